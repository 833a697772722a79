//! The on-disk record of what is installed in a prefix.
//!
//! Records are split in two for fast incremental writes: `db/data.yml`
//! holds every package's base record (version, description, dependencies,
//! owned directories), while `db/file_info/<package>.json` holds the bulky
//! per-package file list and offset table. The file-info record is written
//! first and `data.yml` is replaced by rename, so a crash between the two
//! never yields a base record without its files.
//!
//! The database also maintains an in-memory reference count per directory:
//! how many installed packages own it. Counts are recomputed from the base
//! records on load and kept current across install and remove.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use xpkg_schema::{DepSpec, Manifest, PathOffsets};

use crate::error::{IoContext, Result, XpkgError};
use crate::paths;

/// The slim per-package record kept in `data.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseRecord {
    /// Installed version.
    pub version: String,

    /// Package description.
    #[serde(default)]
    pub description: String,

    /// Runtime dependencies recorded at install time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DepSpec>,

    /// Directories the package owns.
    #[serde(default)]
    pub dirs: Vec<String>,
}

/// The bulky per-package record kept in `file_info/<package>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileInfoRecord {
    files: Vec<String>,
    install_path_offsets: PathOffsets,
}

/// Handle on one prefix's install database.
#[derive(Debug)]
pub struct InstallDatabase {
    prefix: PathBuf,
    records: BTreeMap<String, BaseRecord>,
    dir_refs: BTreeMap<String, usize>,
}

impl InstallDatabase {
    /// Open (creating if needed) the database under `prefix`.
    ///
    /// A legacy single-file `var/xpkg/db.yml` found here is migrated into
    /// the split layout before loading.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::Io`] on filesystem failure and
    /// [`XpkgError::BadRecipe`] if an existing database does not parse.
    pub fn open(prefix: impl Into<PathBuf>) -> Result<Self> {
        let prefix = prefix.into();

        let db_dir = paths::db_dir(&prefix);
        fs::create_dir_all(paths::db_file_info_dir(&prefix)).io_at(&db_dir)?;

        migrate_legacy(&prefix)?;

        let data_path = paths::db_data_path(&prefix);
        let records = if data_path.exists() {
            let text = fs::read_to_string(&data_path).io_at(&data_path)?;
            parse_records(&text)
                .map_err(|e| XpkgError::BadRecipe(format!("corrupt install db: {e}")))?
        } else {
            BTreeMap::new()
        };

        let mut db = Self {
            prefix,
            records,
            dir_refs: BTreeMap::new(),
        };
        db.recount_dirs();

        Ok(db)
    }

    /// Record `manifest` as installed, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::Io`] if either record cannot be written.
    pub fn mark_installed(&mut self, manifest: &Manifest) -> Result<()> {
        let file_info = FileInfoRecord {
            files: manifest.files.clone(),
            install_path_offsets: manifest.install_path_offsets.clone(),
        };

        // File info first: data.yml is the commit point.
        let info_path = self.file_info_path(&manifest.name);
        write_json_atomic(&info_path, &file_info)?;

        self.records.insert(
            manifest.name.clone(),
            BaseRecord {
                version: manifest.version.clone(),
                description: manifest.description.clone(),
                dependencies: manifest.dependencies.clone(),
                dirs: manifest.dirs.clone(),
            },
        );
        self.save()?;
        self.recount_dirs();

        Ok(())
    }

    /// Delete both records of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] if the package is not installed.
    pub fn mark_removed(&mut self, name: &str) -> Result<()> {
        if self.records.remove(name).is_none() {
            return Err(XpkgError::NotFound(format!(
                "package {name} is not installed"
            )));
        }
        self.save()?;
        self.recount_dirs();

        let info_path = self.file_info_path(name);
        if let Err(e) = fs::remove_file(&info_path) {
            warn!(path = %info_path.display(), error = %e, "could not delete file info record");
        }

        Ok(())
    }

    /// The base record of `name`, if installed.
    pub fn get(&self, name: &str) -> Option<&BaseRecord> {
        self.records.get(name)
    }

    /// The full record of `name` (base plus files and offsets).
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BadRecipe`] if the file-info record is corrupt.
    pub fn get_with_files(&self, name: &str) -> Result<Option<Manifest>> {
        let Some(base) = self.records.get(name) else {
            return Ok(None);
        };

        let info_path = self.file_info_path(name);
        let file_info: FileInfoRecord = match fs::read_to_string(&info_path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                XpkgError::BadRecipe(format!("corrupt file info for {name}: {e}"))
            })?,
            Err(e) => {
                // Tolerate a missing side file; the base record still stands.
                warn!(package = name, error = %e, "missing file info record");
                FileInfoRecord {
                    files: Vec::new(),
                    install_path_offsets: PathOffsets::default(),
                }
            }
        };

        Ok(Some(Manifest {
            name: name.to_string(),
            version: base.version.clone(),
            description: base.description.clone(),
            dependencies: base.dependencies.clone(),
            dirs: base.dirs.clone(),
            files: file_info.files,
            install_path_offsets: file_info.install_path_offsets,
        }))
    }

    /// Whether `name` is installed; with a version, whether that exact
    /// version is installed.
    pub fn installed(&self, name: &str, version: Option<&str>) -> bool {
        self.records
            .get(name)
            .is_some_and(|r| version.is_none_or(|v| v == r.version))
    }

    /// Iterate installed `(name, record)` pairs in name order.
    pub fn iter_packages(&self) -> impl Iterator<Item = (&str, &BaseRecord)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All installed packages whose dependencies name `name`.
    pub fn get_rdepends(&self, name: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, record)| record.dependencies.iter().any(|d| d.name() == name))
            .map(|(pkg, _)| pkg.clone())
            .collect()
    }

    /// The installed package owning `relpath` (a file or a directory), if
    /// any.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BadRecipe`] if a file-info record is corrupt.
    pub fn owner_of_path(&self, relpath: &str) -> Result<Option<String>> {
        for (name, record) in &self.records {
            if record.dirs.iter().any(|d| d == relpath) {
                return Ok(Some(name.clone()));
            }

            if let Some(full) = self.get_with_files(name)? {
                if full.files.iter().any(|f| f == relpath) {
                    return Ok(Some(name.clone()));
                }
            }
        }

        Ok(None)
    }

    /// How many installed packages own directory `dir`.
    pub fn dir_refcount(&self, dir: &str) -> usize {
        self.dir_refs.get(dir).copied().unwrap_or(0)
    }

    fn file_info_path(&self, name: &str) -> PathBuf {
        paths::db_file_info_dir(&self.prefix).join(format!("{name}.json"))
    }

    fn save(&self) -> Result<()> {
        write_yaml_atomic(&paths::db_data_path(&self.prefix), &self.records)
    }

    fn recount_dirs(&mut self) {
        self.dir_refs.clear();
        for record in self.records.values() {
            for dir in &record.dirs {
                *self.dir_refs.entry(dir.clone()).or_default() += 1;
            }
        }
    }
}

/// Parse `data.yml`, treating an empty file as an empty database.
fn parse_records(text: &str) -> std::result::Result<BTreeMap<String, BaseRecord>, serde_yaml::Error> {
    let parsed: Option<BTreeMap<String, BaseRecord>> = serde_yaml::from_str(text)?;
    Ok(parsed.unwrap_or_default())
}

/// Move a pre-split `var/xpkg/db.yml` into the `db/` layout.
fn migrate_legacy(prefix: &Path) -> Result<()> {
    let legacy_path = paths::legacy_db_path(prefix);
    if !legacy_path.exists() {
        return Ok(());
    }

    info!(path = %legacy_path.display(), "migrating legacy install database");

    let text = fs::read_to_string(&legacy_path).io_at(&legacy_path)?;
    let legacy: Option<BTreeMap<String, Manifest>> = serde_yaml::from_str(&text)
        .map_err(|e| XpkgError::BadRecipe(format!("corrupt legacy install db: {e}")))?;

    let mut records = BTreeMap::new();
    for (name, manifest) in legacy.unwrap_or_default() {
        let info_path = paths::db_file_info_dir(prefix).join(format!("{name}.json"));
        write_json_atomic(
            &info_path,
            &FileInfoRecord {
                files: manifest.files.clone(),
                install_path_offsets: manifest.install_path_offsets.clone(),
            },
        )?;

        records.insert(
            name,
            BaseRecord {
                version: manifest.version,
                description: manifest.description,
                dependencies: manifest.dependencies,
                dirs: manifest.dirs,
            },
        );
    }

    write_yaml_atomic(&paths::db_data_path(prefix), &records)?;
    fs::remove_file(&legacy_path).io_at(&legacy_path)?;

    Ok(())
}

fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value)
        .map_err(|e| XpkgError::BadRecipe(format!("unserialisable record: {e}")))?;
    write_atomic(path, text.as_bytes())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_vec(value)
        .map_err(|e| XpkgError::BadRecipe(format!("unserialisable record: {e}")))?;
    write_atomic(path, &text)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).io_at(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir).io_at(dir)?;
    std::io::Write::write_all(&mut staged, bytes).io_at(path)?;
    staged
        .persist(path)
        .map_err(|e| XpkgError::io(path, e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, version: &str, deps: &[&str], dirs: &[&str], files: &[&str]) -> Manifest {
        Manifest {
            name: name.into(),
            version: version.into(),
            description: format!("{name} test package"),
            dependencies: deps.iter().map(|d| d.parse().unwrap()).collect(),
            dirs: dirs.iter().map(ToString::to_string).collect(),
            files: files.iter().map(ToString::to_string).collect(),
            install_path_offsets: PathOffsets::new("/tmp/build"),
        }
    }

    #[test]
    fn install_remove_round_trip() {
        let prefix = tempfile::tempdir().unwrap();
        let mut db = InstallDatabase::open(prefix.path()).unwrap();

        db.mark_installed(&manifest("hello", "1.0.0", &[], &["bin"], &["bin/hello"]))
            .unwrap();

        assert!(db.installed("hello", None));
        assert!(db.installed("hello", Some("1.0.0")));
        assert!(!db.installed("hello", Some("2.0.0")));

        let full = db.get_with_files("hello").unwrap().unwrap();
        assert_eq!(full.files, vec!["bin/hello"]);

        db.mark_removed("hello").unwrap();
        assert!(!db.installed("hello", None));
        assert!(matches!(db.mark_removed("hello"), Err(XpkgError::NotFound(_))));
    }

    #[test]
    fn records_survive_reopen() {
        let prefix = tempfile::tempdir().unwrap();

        {
            let mut db = InstallDatabase::open(prefix.path()).unwrap();
            db.mark_installed(&manifest("zlib", "1.2.8", &[], &["lib"], &["lib/libz.so"]))
                .unwrap();
        }

        let db = InstallDatabase::open(prefix.path()).unwrap();
        assert!(db.installed("zlib", Some("1.2.8")));
        assert_eq!(db.dir_refcount("lib"), 1);
        assert_eq!(
            db.get_with_files("zlib").unwrap().unwrap().files,
            vec!["lib/libz.so"]
        );
    }

    #[test]
    fn dir_refcounts_track_installs_and_removes() {
        let prefix = tempfile::tempdir().unwrap();
        let mut db = InstallDatabase::open(prefix.path()).unwrap();

        db.mark_installed(&manifest("a", "1", &[], &["bin", "share"], &["bin/a"]))
            .unwrap();
        db.mark_installed(&manifest("b", "1", &[], &["bin"], &["bin/b"]))
            .unwrap();

        assert_eq!(db.dir_refcount("bin"), 2);
        assert_eq!(db.dir_refcount("share"), 1);
        assert_eq!(db.dir_refcount("lib"), 0);

        db.mark_removed("a").unwrap();
        assert_eq!(db.dir_refcount("bin"), 1);
        assert_eq!(db.dir_refcount("share"), 0);
    }

    #[test]
    fn rdepends_and_owner_queries() {
        let prefix = tempfile::tempdir().unwrap();
        let mut db = InstallDatabase::open(prefix.path()).unwrap();

        db.mark_installed(&manifest("libgreet", "1.0.0", &[], &["lib"], &["lib/libgreet.so"]))
            .unwrap();
        db.mark_installed(&manifest(
            "greeter",
            "1.0.0",
            &["libgreet==1.0.0"],
            &["bin"],
            &["bin/greeter"],
        ))
        .unwrap();

        assert_eq!(db.get_rdepends("libgreet"), vec!["greeter".to_string()]);
        assert!(db.get_rdepends("greeter").is_empty());

        assert_eq!(
            db.owner_of_path("lib/libgreet.so").unwrap(),
            Some("libgreet".to_string())
        );
        assert_eq!(db.owner_of_path("bin").unwrap(), Some("greeter".to_string()));
        assert_eq!(db.owner_of_path("etc/nothing").unwrap(), None);
    }

    #[test]
    fn legacy_single_file_db_is_migrated() {
        let prefix = tempfile::tempdir().unwrap();
        let state = paths::state_dir(prefix.path());
        fs::create_dir_all(&state).unwrap();

        let legacy = manifest("old-pkg", "0.9", &[], &["bin"], &["bin/old"]);
        let mut legacy_map = BTreeMap::new();
        legacy_map.insert("old-pkg".to_string(), legacy);
        fs::write(
            paths::legacy_db_path(prefix.path()),
            serde_yaml::to_string(&legacy_map).unwrap(),
        )
        .unwrap();

        let db = InstallDatabase::open(prefix.path()).unwrap();
        assert!(db.installed("old-pkg", Some("0.9")));
        assert_eq!(
            db.get_with_files("old-pkg").unwrap().unwrap().files,
            vec!["bin/old"]
        );
        assert!(!paths::legacy_db_path(prefix.path()).exists());
    }
}
