//! Build orchestration: from a recipe to relocatable binary archives.
//!
//! A build runs inside a fresh temporary workspace. Sources are fetched
//! through the content-addressed cache and unpacked there; the recipe's
//! `configure` / `build` / `install` phases then run with a composed
//! environment and an install prefix whose basename is a long opaque hash
//! of the package name -- maximal length headroom for later rewrites, since
//! an archive can only ever be installed into a prefix no longer than the
//! one it was built against.
//!
//! After the install phase the prefix is diffed, the new files are scanned
//! for embedded prefix offsets, and one archive per recipe output is
//! written. The workspace is removed on every exit path; only archives
//! that reach the destination directory survive, and nothing is written
//! there until the whole build has succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};
use xpkg_schema::recipe::{BuiltInSpec, CommandItem, Commands};
use xpkg_schema::{HashAlgo, Manifest, OutputSpec, PathOffsets, Recipe};

use crate::cache::SourceCache;
use crate::commands::{BuildEnv, CommandOutput, SubstError, interp, run_builtin, run_shell};
use crate::error::{IoContext, Result, XpkgError};
use crate::scanner::find_path_offsets;
use crate::toolset::Toolset;

/// Source URL scheme resolving relative to the recipe file.
const XPD_URL_SCHEME: &str = "xpd://";

/// Archive suffixes treated as tarballs and unpacked into the workspace.
const TARBALL_SUFFIXES: &[&str] = &[".tar.gz", ".tar.bz2", ".tar.xz", ".tgz"];

/// What a build borrows from the environment it targets.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// The environment prefix (`env_root` in command substitutions).
    pub env_root: PathBuf,

    /// Where build logs go.
    pub log_dir: PathBuf,

    /// `(name, value, separator)` variables prepended so builds see the
    /// environment's installed tools and libraries.
    pub env_vars: Vec<(String, String, String)>,

    /// The active toolset, contributing the overlay and isolation flag.
    pub toolset: Option<Toolset>,
}

/// Builds one recipe into an install prefix and describes the results.
#[derive(Debug)]
pub struct PackageBuilder<'a> {
    recipe: &'a Recipe,
    cache: SourceCache,
    verbose: bool,
}

impl<'a> PackageBuilder<'a> {
    /// A builder for `recipe` using the default source cache.
    pub fn new(recipe: &'a Recipe) -> Self {
        Self {
            recipe,
            cache: SourceCache::new(),
            verbose: false,
        }
    }

    /// Use an explicit source cache (tests, alternate cache roots).
    pub fn with_cache(mut self, cache: SourceCache) -> Self {
        self.cache = cache;
        self
    }

    /// Stream build output to the terminal instead of the log file.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Fetch, unpack, configure, build, and install into `target_dir`,
    /// returning one manifest per recipe output.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BuildFailed`] when a command fails,
    /// [`XpkgError::BadRecipe`] for structural recipe problems, and the
    /// fetch/scan error types from the collaborators this drives.
    pub fn build(&self, target_dir: &Path, ctx: Option<&BuildContext>) -> Result<Vec<Manifest>> {
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("xpkg-{}-", self.recipe.name))
            .tempdir()
            .io_at(std::env::temp_dir())?;

        info!(
            package = self.recipe.name,
            version = self.recipe.version,
            work_dir = %work_dir.path().display(),
            "building"
        );

        fs::create_dir_all(target_dir).io_at(target_dir)?;

        let mut output = self.open_log(ctx)?;
        let env = compose_env(target_dir, ctx, &self.recipe.version)?;
        let subs = substitutions(target_dir, ctx, &self.recipe.version);

        self.fetch_sources(work_dir.path())?;

        let build_dir = self.choose_build_dir(work_dir.path())?;
        debug!(build_dir = %build_dir.display(), "running build phases");

        self.run_phase("configure", self.recipe.configure.as_ref(), &build_dir, &env, &subs, &mut output)?;
        self.run_phase("build", self.recipe.build.as_ref(), &build_dir, &env, &subs, &mut output)?;

        let pre_paths = list_paths(target_dir)?;
        self.run_phase("install", self.recipe.install.as_ref(), &build_dir, &env, &subs, &mut output)?;
        let post_paths = list_paths(target_dir)?;

        let new_paths: BTreeSet<String> = post_paths.difference(&pre_paths).cloned().collect();

        let mut new_dirs = BTreeSet::new();
        let mut new_files = BTreeSet::new();
        for path in new_paths {
            if target_dir.join(&path).is_dir() {
                new_dirs.insert(path);
            } else {
                new_files.insert(path);
            }
        }

        let offsets = find_path_offsets(target_dir, &new_files)?;

        split_outputs(&self.recipe.outputs()?, new_files, new_dirs, &offsets)
    }

    fn open_log(&self, ctx: Option<&BuildContext>) -> Result<CommandOutput> {
        if self.verbose {
            return Ok(CommandOutput::Inherit);
        }

        let log_name = format!("{}-{}_build.log", self.recipe.name, self.recipe.version);
        let log_path = match ctx {
            Some(ctx) => {
                fs::create_dir_all(&ctx.log_dir).io_at(&ctx.log_dir)?;
                ctx.log_dir.join(log_name)
            }
            None => PathBuf::from(log_name),
        };

        info!(log = %log_path.display(), "build log");
        Ok(CommandOutput::Log(File::create(&log_path).io_at(&log_path)?))
    }

    /// Fetch every source, unpacking tarballs and copying plain files.
    fn fetch_sources(&self, work_dir: &Path) -> Result<()> {
        for (spec, source) in &self.recipe.files {
            let url = self.final_url(&source.url)?;
            let fetched = self.cache.fetch(spec, &url)?;

            let is_tarball = TARBALL_SUFFIXES.iter().any(|s| url.ends_with(s));
            let landed = if is_tarball {
                info!(url = %url, "unpacking");
                unpack_tarball(&fetched, work_dir)?
            } else {
                let name = crate::paths::filename_from_url(&url);
                let dest = work_dir.join(name);
                fs::copy(&fetched, &dest).io_at(&dest)?;
                dest
            };

            if let Some(location) = &source.location {
                let dest = work_dir.join(location);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).io_at(parent)?;
                }
                debug!(from = %landed.display(), to = %dest.display(), "relocating source");
                fs::rename(&landed, &dest).io_at(&dest)?;
            }
        }

        Ok(())
    }

    /// Resolve the recipe-relative `xpd://` scheme against the recipe dir.
    fn final_url(&self, url: &str) -> Result<String> {
        let Some(rel) = url.strip_prefix(XPD_URL_SCHEME) else {
            return Ok(url.to_string());
        };

        let dir = self.recipe.dir().ok_or_else(|| {
            XpkgError::BadRecipe(format!(
                "{url} is recipe-relative but the recipe was not loaded from a file"
            ))
        })?;

        let path = dir.join(rel);
        let absolute = path.canonicalize().io_at(&path)?;
        Ok(format!("file://{}", absolute.display()))
    }

    /// The recipe's `build-dir` if set; else the single unpacked top-level
    /// directory; else the workspace itself.
    fn choose_build_dir(&self, work_dir: &Path) -> Result<PathBuf> {
        if let Some(rel) = &self.recipe.build_dir {
            let dir = work_dir.join(rel);
            fs::create_dir_all(&dir).io_at(&dir)?;
            return Ok(dir);
        }

        let subdirs: Vec<PathBuf> = fs::read_dir(work_dir)
            .io_at(work_dir)?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .collect();

        match subdirs.as_slice() {
            [single] => Ok(single.clone()),
            _ => Ok(work_dir.to_path_buf()),
        }
    }

    fn run_phase(
        &self,
        phase: &str,
        commands: Option<&Commands>,
        build_dir: &Path,
        env: &BuildEnv,
        subs: &BTreeMap<String, String>,
        output: &mut CommandOutput,
    ) -> Result<()> {
        let Some(commands) = commands else {
            return Ok(());
        };

        info!(package = self.recipe.name, phase, "running phase");
        let (env_additions, steps) = commands.steps();

        // Per-phase environment additions are appended space-separated.
        let env = match env_additions {
            Some(additions) => {
                let mut scoped = env.clone();
                for (name, value) in additions {
                    scoped.append(name, &interp_cmd(value, subs)?, " ");
                }
                scoped
            }
            None => env.clone(),
        };

        for step in steps {
            match step {
                CommandItem::Shell(line) => {
                    let line = interp_cmd(line, subs)?;
                    run_shell(&line, build_dir, &env, output)?;
                }
                CommandItem::BuiltIn(map) => {
                    let (name, spec) = single_entry(map)?;
                    let args: Vec<String> = spec
                        .args()
                        .to_vec()
                        .into_iter()
                        .map(|a| interp_cmd(a, subs))
                        .collect::<Result<_>>()?;
                    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

                    let cwd = match spec.working_dir() {
                        "" => build_dir.to_path_buf(),
                        dir => build_dir.join(interp_cmd(dir, subs)?),
                    };

                    run_builtin(name, &arg_refs, &cwd)?;
                }
            }
        }

        Ok(())
    }
}

/// Builds a recipe and packs the results into `.xpa` archives.
///
/// The install prefix lives inside a scratch directory and is destroyed
/// with it; only the archives survive, moved into the destination directory
/// in one pass after the whole build has succeeded.
#[derive(Debug)]
pub struct BinaryPackageBuilder<'a> {
    builder: PackageBuilder<'a>,
    recipe: &'a Recipe,
}

impl<'a> BinaryPackageBuilder<'a> {
    /// An archive builder for `recipe`.
    pub fn new(recipe: &'a Recipe) -> Self {
        Self {
            builder: PackageBuilder::new(recipe),
            recipe,
        }
    }

    /// Use an explicit source cache.
    pub fn with_cache(mut self, cache: SourceCache) -> Self {
        self.builder = self.builder.with_cache(cache);
        self
    }

    /// Stream build output to the terminal instead of the log file.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.builder = self.builder.verbose(verbose);
        self
    }

    /// Build and archive, returning the destination path of every archive.
    ///
    /// # Errors
    ///
    /// See [`PackageBuilder::build`]; archive writing adds
    /// [`XpkgError::Io`].
    pub fn build(&self, storage_dir: &Path, ctx: Option<&BuildContext>) -> Result<Vec<PathBuf>> {
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("xpkg-install-{}-", self.recipe.name))
            .tempdir()
            .io_at(std::env::temp_dir())?;

        // A hash of the name gives the prefix a long, opaque basename: all
        // headroom for the length-preserving rewrite at install time.
        let pad_hash = HashAlgo::Md5.hash_bytes(self.recipe.name.as_bytes());
        let install_dir = work_dir.path().join(format!("install-{pad_hash}"));

        let manifests = self.builder.build(&install_dir, ctx)?;

        // Stage every archive in the workspace, then move them all: a
        // failure half-way leaves nothing in the destination.
        let mut staged = Vec::new();
        for manifest in &manifests {
            let file_name = archive_file_name(&manifest.name, &manifest.version);
            let xpa_path = work_dir.path().join(&file_name);
            crate::archive::write(&xpa_path, manifest, &install_dir)?;
            staged.push((xpa_path, file_name));
        }

        fs::create_dir_all(storage_dir).io_at(storage_dir)?;

        let mut dest_paths = Vec::new();
        for (xpa_path, file_name) in staged {
            let dest = storage_dir.join(&file_name);
            if fs::rename(&xpa_path, &dest).is_err() {
                fs::copy(&xpa_path, &dest).io_at(&dest)?;
            }
            info!(archive = %dest.display(), "wrote package archive");
            dest_paths.push(dest);
        }

        Ok(dest_paths)
    }
}

/// `<name>_<version>_<arch>_<linkage>_<kernel>.xpa`
pub fn archive_file_name(name: &str, version: &str) -> String {
    format!(
        "{name}_{version}_{arch}_{linkage}_{kernel}.xpa",
        arch = build_arch(),
        linkage = build_linkage(),
        kernel = build_kernel(),
    )
}

/// The machine architecture names archives are tagged with.
pub fn build_arch() -> &'static str {
    std::env::consts::ARCH
}

/// The architecture name kernel header packages expect (Debian convention).
pub fn kernel_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86" | "i686" => "i386",
        other => other,
    }
}

fn build_linkage() -> &'static str {
    if cfg!(target_os = "macos") {
        "macho"
    } else {
        "elf"
    }
}

fn build_kernel() -> &'static str {
    std::env::consts::OS
}

/// The substitution vocabulary for command strings and toolset templates.
fn substitutions(
    target_dir: &Path,
    ctx: Option<&BuildContext>,
    pkg_version: &str,
) -> BTreeMap<String, String> {
    let mut subs = BTreeMap::new();
    subs.insert("jobs".to_string(), num_cpus::get().to_string());
    subs.insert("prefix".to_string(), target_dir.display().to_string());
    subs.insert("arch".to_string(), build_arch().to_string());
    subs.insert("kernel_arch".to_string(), kernel_arch().to_string());
    subs.insert("pkg_version".to_string(), pkg_version.to_string());

    if let Some(ctx) = ctx {
        subs.insert("env_root".to_string(), ctx.env_root.display().to_string());
    }

    subs
}

/// Compose the variables every build command runs with.
fn compose_env(
    target_dir: &Path,
    ctx: Option<&BuildContext>,
    pkg_version: &str,
) -> Result<BuildEnv> {
    let isolate = ctx
        .and_then(|c| c.toolset.as_ref())
        .is_some_and(|ts| ts.isolate);

    let mut env = if isolate {
        BuildEnv::empty()
    } else {
        BuildEnv::snapshot()
    };

    if let Some(ctx) = ctx {
        for (name, value, sep) in &ctx.env_vars {
            env.prepend(name, value, sep);
        }
        env.set(crate::paths::XPKG_ROOT_VAR, ctx.env_root.display().to_string());

        if let Some(toolset) = &ctx.toolset {
            let subs = substitutions(target_dir, Some(ctx), pkg_version);
            toolset.apply_env(&mut env, &subs)?;
        }
    }

    Ok(env)
}

/// Substitute one command string, mapping failures to the build taxonomy.
fn interp_cmd(text: &str, subs: &BTreeMap<String, String>) -> Result<String> {
    interp(text, subs).map_err(|e| match e {
        SubstError::UnknownVar(var) if var == "env_root" => XpkgError::BuildFailed(
            "package references environment root, must be built in an environment".to_string(),
        ),
        other => XpkgError::BadRecipe(other.to_string()),
    })
}

/// The single `{name: spec}` entry of a built-in command mapping.
fn single_entry(map: &BTreeMap<String, BuiltInSpec>) -> Result<(&str, &BuiltInSpec)> {
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((name, spec)), None) => Ok((name.as_str(), spec)),
        _ => Err(XpkgError::BadRecipe(format!(
            "built-in command must have exactly one operation, got {}",
            map.len()
        ))),
    }
}

/// Every file and directory under `root`, as sorted relative paths.
fn list_paths(root: &Path) -> Result<BTreeSet<String>> {
    let mut paths = BTreeSet::new();

    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| {
            XpkgError::io(root, e.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("walk failed")
            }))
        })?;

        if let Ok(rel) = entry.path().strip_prefix(root) {
            if let Some(rel) = rel.to_str() {
                paths.insert(rel.to_string());
            }
        }
    }

    Ok(paths)
}

/// Unpack a tarball into `dest`, returning the unpacked root directory.
fn unpack_tarball(tar_path: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(tar_path).io_at(tar_path)?;
    let reader = BufReader::new(file);

    let name = tar_path.to_string_lossy();
    let decoder: Box<dyn std::io::Read> = if name.ends_with(".tar.bz2") {
        Box::new(bzip2::read::BzDecoder::new(reader))
    } else if name.ends_with(".tar.xz") {
        Box::new(xz2::read::XzDecoder::new(reader))
    } else {
        Box::new(flate2::read::GzDecoder::new(reader))
    };

    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);

    let mut roots: BTreeSet<String> = BTreeSet::new();
    for entry in archive.entries().io_at(tar_path)? {
        let mut entry = entry.io_at(tar_path)?;

        if let Ok(path) = entry.path() {
            if let Some(first) = path.components().next() {
                roots.insert(first.as_os_str().to_string_lossy().to_string());
            }
        }

        entry.unpack_in(dest).io_at(dest)?;
    }

    let root = roots.into_iter().next().ok_or_else(|| {
        XpkgError::BadRecipe(format!("empty source tarball: {}", tar_path.display()))
    })?;

    Ok(dest.join(root))
}

/// Assign built files and directories to recipe outputs.
///
/// A single-output recipe takes everything. Each multi-output sub-output
/// claims the files fully matching one of its regex patterns, plus every
/// directory that is an ancestor of a claimed file; the catch-all (if any)
/// absorbs the rest. Files left over without a catch-all are logged, not
/// fatal.
fn split_outputs(
    outputs: &[OutputSpec],
    new_files: BTreeSet<String>,
    new_dirs: BTreeSet<String>,
    offsets: &PathOffsets,
) -> Result<Vec<Manifest>> {
    if let [single] = outputs {
        let files: Vec<String> = new_files.iter().cloned().collect();
        return Ok(vec![Manifest {
            name: single.name.clone(),
            version: single.version.clone(),
            description: single.description.clone(),
            dependencies: single.dependencies.clone(),
            dirs: new_dirs.into_iter().collect(),
            files,
            install_path_offsets: offsets.clone(),
        }]);
    }

    let mut remaining = new_files;
    let mut unclaimed_dirs = new_dirs.clone();
    let mut manifests = Vec::new();
    let mut catch_all: Option<&OutputSpec> = None;

    for output in outputs {
        let Some(patterns) = &output.files else {
            catch_all = Some(output);
            continue;
        };

        let mut claimed = BTreeSet::new();
        for pattern in patterns {
            let regex = Regex::new(pattern).map_err(|e| {
                XpkgError::BadRecipe(format!(
                    "bad file pattern {pattern} in output {}: {e}",
                    output.name
                ))
            })?;

            for file in &remaining {
                // Full match, not substring: "lib/.*" must not claim
                // "share/lib/notes.txt".
                if regex
                    .find(file)
                    .is_some_and(|m| m.start() == 0 && m.end() == file.len())
                {
                    claimed.insert(file.clone());
                }
            }
        }

        remaining.retain(|f| !claimed.contains(f));

        let dirs = dirs_for(&new_dirs, &claimed, &output.dirs);
        for dir in &dirs {
            unclaimed_dirs.remove(dir);
        }

        manifests.push(Manifest {
            name: output.name.clone(),
            version: output.version.clone(),
            description: output.description.clone(),
            dependencies: output.dependencies.clone(),
            dirs,
            files: claimed.iter().cloned().collect(),
            install_path_offsets: offsets.subset_for(&claimed),
        });
    }

    if let Some(output) = catch_all {
        if remaining.is_empty() {
            warn!(output = output.name, "catch-all output received no files");
        }

        let mut dirs = dirs_for(&new_dirs, &remaining, &output.dirs);
        for dir in &unclaimed_dirs {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }
        dirs.sort();

        manifests.push(Manifest {
            name: output.name.clone(),
            version: output.version.clone(),
            description: output.description.clone(),
            dependencies: output.dependencies.clone(),
            dirs,
            files: remaining.iter().cloned().collect(),
            install_path_offsets: offsets.subset_for(&remaining),
        });
    } else if !remaining.is_empty() {
        warn!(count = remaining.len(), "files left un-packaged");
    }

    Ok(manifests)
}

/// The directories an output needs: ancestors of its files, plus the ones
/// its recipe claims outright.
fn dirs_for(
    all_dirs: &BTreeSet<String>,
    files: &BTreeSet<String>,
    declared: &[String],
) -> Vec<String> {
    let mut dirs: BTreeSet<String> = declared
        .iter()
        .filter(|d| all_dirs.contains(*d))
        .cloned()
        .collect();

    for dir in all_dirs {
        let with_sep = format!("{dir}/");
        if files.iter().any(|f| f.starts_with(&with_sep)) {
            dirs.insert(dir.clone());
        }
    }

    dirs.into_iter().collect()
}
