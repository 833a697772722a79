//! In-memory package indexes over recipe trees and archive repositories.
//!
//! A **tree** is a directory of `.xpd` recipes; a **repo** is a directory of
//! `.xpa` archives. Both map `name -> version -> locator` and answer the
//! same question: where does package `name` (optionally at an exact
//! version) come from? Scanning a source is accelerated by a process-local
//! JSON parse cache keyed by absolute path and mtime, because JSON parses
//! several times faster than the YAML it shadows.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;
use xpkg_schema::{HashAlgo, Manifest, Recipe, compare_versions};

use crate::archive;
use crate::error::{IoContext, Result, XpkgError};

/// A package found in some index source.
#[derive(Debug, Clone)]
pub enum Located {
    /// A recipe in a tree; building it produces the package.
    Tree {
        /// Version of the matched output (a sub-output may differ from the
        /// recipe's own version).
        version: String,
        /// The parsed recipe.
        recipe: Recipe,
    },

    /// A pre-built archive in a repo.
    Repo {
        /// Version of the archived package.
        version: String,
        /// Path of the `.xpa` file.
        path: PathBuf,
        /// The archive manifest.
        manifest: Manifest,
    },
}

impl Located {
    /// The version this hit provides.
    pub fn version(&self) -> &str {
        match self {
            Self::Tree { version, .. } | Self::Repo { version, .. } => version,
        }
    }
}

/// `name -> [(version, locator)]` with latest-version selection.
#[derive(Debug)]
struct VersionTable<T> {
    entries: BTreeMap<String, Vec<(String, T)>>,
}

impl<T> Default for VersionTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> VersionTable<T> {
    fn store(&mut self, name: &str, version: &str, locator: T) {
        let versions = self.entries.entry(name.to_string()).or_default();
        // Last writer wins for an exact duplicate version.
        versions.retain(|(v, _)| v != version);
        versions.push((version.to_string(), locator));
    }

    fn lookup(&self, name: &str, version: Option<&str>) -> Option<(&str, &T)> {
        let versions = self.entries.get(name)?;

        match version {
            Some(want) => versions
                .iter()
                .find(|(v, _)| v == want)
                .map(|(v, t)| (v.as_str(), t)),
            None => versions
                .iter()
                .max_by(|(a, _), (b, _)| compare_versions(a, b))
                .map(|(v, t)| (v.as_str(), t)),
        }
    }
}

/// One record of the on-disk parse cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedParse {
    mtime: u64,
    data: serde_json::Value,
}

/// JSON mtime-indexed cache of parsed recipe or manifest data.
///
/// The cache file lives under `<local-cache>/<kind>/md5-<hash>.json` where
/// the hash covers the source directory path and the kind, so two sources
/// never share a cache file.
#[derive(Debug)]
struct ParseCache {
    cache_path: PathBuf,
    entries: BTreeMap<String, CachedParse>,
    dirty: bool,
}

impl ParseCache {
    fn open(cache_root: &Path, kind: &str, source_dir: &Path) -> Self {
        let key = format!("{}{kind}", source_dir.display());
        let file = format!("md5-{}.json", HashAlgo::Md5.hash_bytes(key.as_bytes()));
        let cache_path = cache_root.join(kind).join(file);

        let entries = fs::File::open(&cache_path)
            .ok()
            .and_then(|f| serde_json::from_reader(std::io::BufReader::new(f)).ok())
            .unwrap_or_default();

        Self {
            cache_path,
            entries,
            dirty: false,
        }
    }

    /// Fetch the parse of `path`, re-running `parse` when the file is newer
    /// than the cached copy (or not cached at all).
    fn load(
        &mut self,
        path: &Path,
        parse: impl FnOnce(&Path) -> Result<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mtime = mtime_of(path)?;
        let key = path.display().to_string();

        if let Some(cached) = self.entries.get(&key) {
            if mtime <= cached.mtime {
                return Ok(cached.data.clone());
            }
        }

        debug!(path = %path.display(), "parse cache miss");
        let data = parse(path)?;
        self.entries.insert(key, CachedParse { mtime, data: data.clone() });
        self.dirty = true;

        Ok(data)
    }

    fn save(&self) {
        if !self.dirty {
            return;
        }

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.cache_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut tmp = tempfile::NamedTempFile::new_in(
                self.cache_path.parent().unwrap_or(Path::new(".")),
            )?;
            serde_json::to_writer(&mut tmp, &self.entries)?;
            tmp.persist(&self.cache_path).map_err(|e| e.error)?;
            Ok(())
        };

        // The cache is an accelerator; failing to write it is not fatal.
        if let Err(e) = write() {
            warn!(path = %self.cache_path.display(), error = %e, "could not save parse cache");
        }
    }
}

fn mtime_of(path: &Path) -> Result<u64> {
    let modified = fs::metadata(path).io_at(path)?.modified().io_at(path)?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default())
}

/// A directory of `.xpd` recipes, indexed by output name and version.
#[derive(Debug)]
pub struct PackageTree {
    table: VersionTable<PathBuf>,
}

impl PackageTree {
    /// Scan `path` for recipes, going through the parse cache under
    /// `cache_root`.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] when the directory does not exist.
    /// Individual unparsable recipes are skipped with a warning.
    pub fn open(path: impl AsRef<Path>, cache_root: &Path) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(XpkgError::NotFound(format!(
                "package tree path {} does not exist",
                path.display()
            )));
        }

        let mut cache = ParseCache::open(cache_root, "tree", path);
        let mut table = VersionTable::default();

        for xpd_path in files_with_extension(path, "xpd") {
            let parsed = cache.load(&xpd_path, |p| {
                let recipe = Recipe::load(p)?;
                serde_json::to_value(recipe)
                    .map_err(|e| XpkgError::BadRecipe(e.to_string()))
            });

            let recipe = parsed.and_then(|data| {
                serde_json::from_value::<Recipe>(data)
                    .map_err(|e| XpkgError::BadRecipe(e.to_string()))
            });

            let recipe = match recipe {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %xpd_path.display(), error = %e, "skipping bad recipe");
                    continue;
                }
            };

            match recipe.outputs() {
                Ok(outputs) => {
                    for output in outputs {
                        table.store(&output.name, &output.version, xpd_path.clone());
                    }
                }
                Err(e) => {
                    warn!(path = %xpd_path.display(), error = %e, "skipping bad recipe");
                }
            }
        }

        cache.save();
        Ok(Self { table })
    }

    /// Find `name` (optionally pinned), reloading the recipe from disk.
    pub fn lookup(&self, name: &str, version: Option<&str>) -> Option<Located> {
        let (version, xpd_path) = self.table.lookup(name, version)?;

        match Recipe::load(xpd_path) {
            Ok(recipe) => Some(Located::Tree {
                version: version.to_string(),
                recipe,
            }),
            Err(e) => {
                warn!(path = %xpd_path.display(), error = %e, "recipe vanished from tree");
                None
            }
        }
    }
}

/// A directory of `.xpa` archives, indexed by package name and version.
#[derive(Debug)]
pub struct PackageRepo {
    table: VersionTable<(PathBuf, Manifest)>,
}

impl PackageRepo {
    /// Scan `path` for archives, going through the parse cache under
    /// `cache_root`.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] when the directory does not exist.
    /// Individual unreadable archives are skipped with a warning.
    pub fn open(path: impl AsRef<Path>, cache_root: &Path) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(XpkgError::NotFound(format!(
                "package repo path {} does not exist",
                path.display()
            )));
        }

        let mut cache = ParseCache::open(cache_root, "repo", path);
        let mut table = VersionTable::default();

        for xpa_path in files_with_extension(path, "xpa") {
            let parsed = cache.load(&xpa_path, |p| {
                let manifest = archive::read_manifest(p)?;
                serde_json::to_value(manifest)
                    .map_err(|e| XpkgError::BadRecipe(e.to_string()))
            });

            let manifest = parsed.and_then(|data| {
                serde_json::from_value::<Manifest>(data)
                    .map_err(|e| XpkgError::BadRecipe(e.to_string()))
            });

            match manifest {
                Ok(manifest) => {
                    let name = manifest.name.clone();
                    let version = manifest.version.clone();
                    table.store(&name, &version, (xpa_path, manifest));
                }
                Err(e) => {
                    warn!(path = %xpa_path.display(), error = %e, "skipping bad archive");
                }
            }
        }

        cache.save();
        Ok(Self { table })
    }

    /// Find `name` (optionally pinned).
    pub fn lookup(&self, name: &str, version: Option<&str>) -> Option<Located> {
        let (version, (path, manifest)) = self.table.lookup(name, version)?;

        Some(Located::Repo {
            version: version.to_string(),
            path: path.clone(),
            manifest: manifest.clone(),
        })
    }
}

/// A tree, a repo, or nothing -- all answering `lookup` the same way.
#[derive(Debug)]
pub enum PackageSource {
    /// No packages at all.
    Empty,
    /// A recipe tree.
    Tree(PackageTree),
    /// An archive repo.
    Repo(PackageRepo),
}

impl PackageSource {
    /// Find `name` (optionally pinned) in this source.
    pub fn lookup(&self, name: &str, version: Option<&str>) -> Option<Located> {
        match self {
            Self::Empty => None,
            Self::Tree(tree) => tree.lookup(name, version),
            Self::Repo(repo) => repo.lookup(name, version),
        }
    }
}

/// Several sources queried in user-declared order.
///
/// A pinned lookup returns the first source that has the exact version. An
/// unpinned lookup asks every source for its best candidate and keeps the
/// latest version overall.
#[derive(Debug, Default)]
pub struct CombinedSource {
    sources: Vec<PackageSource>,
}

impl CombinedSource {
    /// Combine `sources` in the given priority order.
    pub fn new(sources: Vec<PackageSource>) -> Self {
        Self { sources }
    }

    /// Whether this set contains no sources at all.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Find `name` (optionally pinned) across all sources.
    pub fn lookup(&self, name: &str, version: Option<&str>) -> Option<Located> {
        if version.is_some() {
            return self
                .sources
                .iter()
                .find_map(|source| source.lookup(name, version));
        }

        self.sources
            .iter()
            .filter_map(|source| source.lookup(name, None))
            .max_by(|a, b| compare_versions(a.version(), b.version()))
    }
}

/// All regular files under `root` with the given extension, sorted.
fn files_with_extension(root: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|x| x == ext))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_xpd(dir: &Path, file: &str, name: &str, version: &str) {
        let yaml = format!("name: {name}\nversion: '{version}'\n");
        fs::write(dir.join(file), yaml).unwrap();
    }

    #[test]
    fn tree_lookup_prefers_latest_version() {
        let tree_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        write_xpd(tree_dir.path(), "hello-1.xpd", "hello", "1.9");
        write_xpd(tree_dir.path(), "hello-2.xpd", "hello", "1.10");

        let tree = PackageTree::open(tree_dir.path(), cache_dir.path()).unwrap();

        let hit = tree.lookup("hello", None).unwrap();
        assert_eq!(hit.version(), "1.10");

        let pinned = tree.lookup("hello", Some("1.9")).unwrap();
        assert_eq!(pinned.version(), "1.9");

        assert!(tree.lookup("hello", Some("3.0")).is_none());
        assert!(tree.lookup("nonexistent", None).is_none());
    }

    #[test]
    fn tree_indexes_sub_outputs_by_name() {
        let tree_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        fs::write(
            tree_dir.path().join("multi.xpd"),
            "\
name: multi
version: '2.0'
packages:
  libmulti:
    files: ['lib/.*']
  multi-extras:
",
        )
        .unwrap();

        let tree = PackageTree::open(tree_dir.path(), cache_dir.path()).unwrap();
        assert!(tree.lookup("libmulti", None).is_some());
        assert!(tree.lookup("multi-extras", Some("2.0")).is_some());
        assert!(tree.lookup("multi", None).is_none());
    }

    #[test]
    fn parse_cache_is_reused_until_mtime_changes() {
        let tree_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        write_xpd(tree_dir.path(), "pkg.xpd", "pkg", "1.0");

        let _ = PackageTree::open(tree_dir.path(), cache_dir.path()).unwrap();

        // One cache file must exist under <cache>/tree.
        let cached: Vec<_> = files_with_extension(&cache_dir.path().join("tree"), "json");
        assert_eq!(cached.len(), 1);
        let first = fs::read_to_string(&cached[0]).unwrap();

        // A rescan with an unchanged file leaves the cache byte-identical.
        let _ = PackageTree::open(tree_dir.path(), cache_dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&cached[0]).unwrap(), first);
    }

    #[test]
    fn missing_source_dir_is_not_found() {
        let cache_dir = tempfile::tempdir().unwrap();
        let err = PackageTree::open("/nonexistent/tree", cache_dir.path()).unwrap_err();
        assert!(matches!(err, XpkgError::NotFound(_)));
    }

    #[test]
    fn combined_source_orders_and_maximises() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        write_xpd(a_dir.path(), "pkg.xpd", "pkg", "1.0");
        write_xpd(b_dir.path(), "pkg.xpd", "pkg", "2.0");

        let combined = CombinedSource::new(vec![
            PackageSource::Tree(PackageTree::open(a_dir.path(), cache_dir.path()).unwrap()),
            PackageSource::Tree(PackageTree::open(b_dir.path(), cache_dir.path()).unwrap()),
            PackageSource::Empty,
        ]);

        // Unpinned: latest across all sources wins.
        assert_eq!(combined.lookup("pkg", None).unwrap().version(), "2.0");
        // Pinned: first source carrying the exact version wins.
        assert_eq!(combined.lookup("pkg", Some("1.0")).unwrap().version(), "1.0");
        assert!(combined.lookup("pkg", Some("9.9")).is_none());
    }
}
