//! The environment: one prefix, its database, indexes, and operations.
//!
//! An environment is a prefix directory initialised with a settings file
//! and an install database. It owns the package indexes (trees of recipes
//! and repos of archives, in user-declared priority order), the local
//! archive cache under `var/xpkg/cache`, and every user-facing operation:
//! install, remove, build, info, and the environment-variable composition
//! used for builds and for `jump`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xpkg_schema::{DepSpec, Manifest, Recipe};

use crate::archive::Xpa;
use crate::builder::{BinaryPackageBuilder, BuildContext, build_arch};
use crate::commands::BuildEnv;
use crate::db::InstallDatabase;
use crate::error::{IoContext, Result, XpkgError};
use crate::index::{CombinedSource, Located, PackageRepo, PackageSource, PackageTree};
use crate::installer::install_archive;
use crate::paths;
use crate::resolver::{PlanItem, Resolver};
use crate::toolset::Toolset;

/// Environment variables preserved in isolate mode when graphical I/O is
/// requested.
const GUI_WHITELIST: &[&str] = &[
    "DISPLAY",
    "XAUTHORITY",
    "XDG_RUNTIME_DIR",
    "DBUS_SESSION_BUS_ADDRESS",
];

/// The `var/xpkg/env.yml` settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Human-chosen environment name.
    pub name: String,

    /// The active toolset, fully serialized so the environment builds the
    /// same way even if built-in definitions change.
    pub toolset: Toolset,
}

/// How an environment is opened: explicit paths win over environment
/// variables, which win over emptiness.
#[derive(Debug, Default)]
pub struct EnvOptions {
    /// Recipe tree directories, highest priority first.
    pub tree_paths: Option<Vec<PathBuf>>,

    /// Archive repo directories, highest priority first.
    pub repo_paths: Option<Vec<PathBuf>>,

    /// Override the local source/parse-cache root.
    pub cache_root: Option<PathBuf>,

    /// Stream build output to the terminal.
    pub verbose: bool,
}

/// What `info` found for a query.
#[derive(Debug)]
pub enum Info {
    /// An installed package's full record.
    Installed(Manifest),

    /// A standalone archive's manifest.
    Archive(Manifest),

    /// A path inside the prefix and the package owning it, if any.
    Owner {
        /// The queried path, relative to the prefix.
        path: String,
        /// The owning package.
        package: Option<String>,
    },
}

/// A package environment rooted at a prefix.
#[derive(Debug)]
pub struct Environment {
    prefix: PathBuf,
    settings: Settings,
    db: InstallDatabase,
    tree: CombinedSource,
    repo: CombinedSource,
    cache_root: PathBuf,
    verbose: bool,
}

impl Environment {
    /// Create a new environment under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::Conflict`] when a settings file already exists
    /// there, and [`XpkgError::NotFound`] for an unknown toolset name.
    pub fn init(prefix: &Path, name: &str, toolset_name: Option<&str>) -> Result<()> {
        let settings_path = paths::settings_path(prefix);
        if settings_path.exists() {
            return Err(XpkgError::Conflict(format!(
                "environment already initialised at {}",
                prefix.display()
            )));
        }

        let toolset = Toolset::builtin(toolset_name.unwrap_or_else(|| Toolset::default_name()))?;
        toolset.validate()?;

        // The database directories double as the environment skeleton.
        InstallDatabase::open(prefix)?;
        fs::create_dir_all(paths::xpa_cache_dir(prefix)).io_at(prefix)?;

        let settings = Settings {
            name: name.to_string(),
            toolset,
        };
        let yaml = serde_yaml::to_string(&settings)
            .map_err(|e| XpkgError::BadRecipe(format!("unserialisable settings: {e}")))?;
        fs::write(&settings_path, yaml).io_at(&settings_path)?;

        info!(prefix = %prefix.display(), name, "initialised environment");
        Ok(())
    }

    /// Open an existing environment.
    ///
    /// With no explicit prefix, `XPKG_ROOT` names it. Tree and repo paths
    /// fall back to the colon-separated `XPKG_TREE` and `XPKG_REPO`
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] when no prefix can be determined or
    /// it holds no environment.
    pub fn open(prefix: Option<PathBuf>, options: EnvOptions) -> Result<Self> {
        let prefix = match prefix {
            Some(p) => p,
            None => std::env::var(paths::XPKG_ROOT_VAR)
                .map(PathBuf::from)
                .map_err(|_| {
                    XpkgError::NotFound(format!(
                        "no {} defined, cannot find environment",
                        paths::XPKG_ROOT_VAR
                    ))
                })?,
        };

        let settings_path = paths::settings_path(&prefix);
        if !settings_path.exists() {
            return Err(XpkgError::NotFound(format!(
                "no xpkg environment found in root {}",
                prefix.display()
            )));
        }

        let text = fs::read_to_string(&settings_path).io_at(&settings_path)?;
        let settings: Settings = serde_yaml::from_str(&text)
            .map_err(|e| XpkgError::BadRecipe(format!("corrupt settings file: {e}")))?;

        let db = InstallDatabase::open(&prefix)?;
        let cache_root = options.cache_root.unwrap_or_else(paths::local_cache_dir);

        let tree_paths = resolve_paths(options.tree_paths, paths::XPKG_TREE_VAR);
        let repo_paths = resolve_paths(options.repo_paths, paths::XPKG_REPO_VAR);

        let tree = open_sources(&tree_paths, &cache_root, |p, c| {
            Ok(PackageSource::Tree(PackageTree::open(p, c)?))
        })?;
        let repo = open_sources(&repo_paths, &cache_root, |p, c| {
            Ok(PackageSource::Repo(PackageRepo::open(p, c)?))
        })?;

        fs::create_dir_all(paths::xpa_cache_dir(&prefix)).io_at(&prefix)?;

        Ok(Self {
            prefix,
            settings,
            db,
            tree,
            repo,
            cache_root,
            verbose: options.verbose,
        })
    }

    /// The environment prefix.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The environment settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The install database.
    pub fn database(&self) -> &InstallDatabase {
        &self.db
    }

    /// Install a package: a `.xpa` archive path, a `.xpd` recipe path, or
    /// a `NAME[==VERSION]` spec resolved through the repos then the trees.
    ///
    /// # Errors
    ///
    /// Surfaces the typed errors of the resolver, builder, and relocator
    /// unchanged; a package already installed is [`XpkgError::Conflict`].
    pub fn install(&mut self, input: &str) -> Result<()> {
        // Planning runs before the double-install check so a dependency
        // version clash is reported against the dependency, not the root.
        if input.ends_with(".xpa") {
            let xpa = Xpa::open(input)?;
            let plan = self.resolver().plan_for_manifest(xpa.manifest())?;
            self.check_not_installed(&xpa.manifest().name, Some(&xpa.manifest().version))?;
            self.execute_plan(plan)?;
            return self.install_xpa(&xpa);
        }

        if input.ends_with(".xpd") {
            let recipe = Recipe::load(input)?;
            let plan = self.resolver().plan_for_recipe(&recipe)?;
            for output in recipe.outputs()? {
                self.check_not_installed(&output.name, Some(&output.version))?;
            }
            self.execute_plan(plan)?;
            return self.install_recipe(&recipe);
        }

        let spec: DepSpec = input
            .parse()
            .map_err(|e| XpkgError::BadRecipe(format!("{e}")))?;

        let located = self
            .repo
            .lookup(spec.name(), spec.version())
            .or_else(|| self.tree.lookup(spec.name(), spec.version()))
            .ok_or_else(|| {
                XpkgError::NotFound(format!("cannot find description for package: {input}"))
            })?;

        let plan = match &located {
            Located::Repo { manifest, .. } => self.resolver().plan_for_manifest(manifest)?,
            Located::Tree { recipe, .. } => self.resolver().plan_for_recipe(recipe)?,
        };
        self.check_not_installed(spec.name(), spec.version())?;
        self.execute_plan(plan)?;
        self.install_located(located)
    }

    /// Remove an installed package.
    ///
    /// Files go first (missing ones are warnings); directories are removed
    /// deepest-first and only when empty; the database record goes last.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::Conflict`] when another installed package
    /// depends on `name` and [`XpkgError::NotFound`] when it is not
    /// installed.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let rdepends = self.db.get_rdepends(name);
        if !rdepends.is_empty() {
            return Err(XpkgError::Conflict(format!(
                "cannot remove {name}, required by: {}",
                rdepends.join(", ")
            )));
        }

        let record = self
            .db
            .get_with_files(name)?
            .ok_or_else(|| XpkgError::NotFound(format!("package {name} is not installed")))?;

        info!(package = name, version = record.version, "removing");

        let mut files = record.files.clone();
        files.sort();
        for rel in &files {
            let full = self.prefix.join(rel);
            // symlink_metadata: a dangling symlink still counts as present.
            if full.symlink_metadata().is_ok() {
                fs::remove_file(&full).io_at(&full)?;
            } else {
                warn!(package = name, file = rel, "file missing at remove time");
            }
        }

        // Reverse-sorted paths put children before their parents.
        let mut dirs = record.dirs.clone();
        dirs.sort();
        dirs.reverse();
        for rel in &dirs {
            let full = self.prefix.join(rel);
            match fs::read_dir(&full) {
                Ok(mut entries) => {
                    if entries.next().is_none() {
                        fs::remove_dir(&full).io_at(&full)?;
                    } else if self.db.dir_refcount(rel) == 1 {
                        warn!(dir = rel, "not removing directory, still has files");
                    }
                }
                Err(_) => {
                    warn!(package = name, dir = rel, "directory missing at remove time");
                }
            }
        }

        self.db.mark_removed(name)
    }

    /// Build a recipe into `.xpa` archives in `dest`, with its
    /// dependencies (runtime and build) installed first.
    ///
    /// # Errors
    ///
    /// See [`Self::install`] for the dependency phase and
    /// [`BinaryPackageBuilder::build`] for the build itself.
    pub fn build(&mut self, recipe: &Recipe, dest: &Path, verbose: bool) -> Result<Vec<PathBuf>> {
        let plan = self.resolver().plan_for_recipe(recipe)?;
        self.execute_plan(plan)?;

        let ctx = self.build_context();
        BinaryPackageBuilder::new(recipe)
            .with_cache(crate::cache::SourceCache::at(&self.cache_root))
            .verbose(verbose || self.verbose)
            .build(dest, Some(&ctx))
    }

    /// Describe a package, an archive, or a path inside the prefix.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] for a name that is not installed.
    pub fn info(&self, input: &str) -> Result<Info> {
        if input.ends_with(".xpa") {
            return Ok(Info::Archive(crate::archive::read_manifest(Path::new(input))?));
        }

        // A path query: anything under the prefix, or containing a slash.
        let as_path = Path::new(input);
        let rel = if as_path.is_absolute() {
            as_path
                .strip_prefix(&self.prefix)
                .ok()
                .map(|p| p.to_string_lossy().to_string())
        } else if input.contains('/') {
            Some(input.to_string())
        } else {
            None
        };

        if let Some(rel) = rel {
            let package = self.db.owner_of_path(&rel)?;
            return Ok(Info::Owner { path: rel, package });
        }

        self.db
            .get_with_files(input)?
            .map(Info::Installed)
            .ok_or_else(|| XpkgError::NotFound(format!("package {input} is not installed")))
    }

    /// The `(variable, value, separator)` triples that activate this
    /// environment: `PATH`, `LD_LIBRARY_PATH`, compiler and linker flags.
    pub fn get_env_vars(&self) -> Vec<(String, String, String)> {
        let path_of = |rel: &str| self.prefix.join(rel);
        let existing = |dirs: &[&str]| -> Vec<PathBuf> {
            dirs.iter()
                .map(|d| path_of(d))
                .filter(|p| p.exists())
                .collect()
        };

        // bin always leads PATH so freshly-installed tools win even before
        // anything is installed; the rest only when present.
        let mut bin_dirs = vec![path_of("bin")];
        bin_dirs.extend(existing(&["usr/bin", "usr/sbin", "sbin"]));

        let mut lib_dirs = vec![path_of("lib")];
        let arch_lib = format!("lib/{}-linux-gnu", build_arch());
        lib_dirs.extend(existing(&["lib64", arch_lib.as_str()]));

        let join = |paths: &[PathBuf]| -> String {
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":")
        };

        let cflags = format!("-I{}", path_of("include").display());
        let ldflags = lib_dirs
            .iter()
            .map(|p| format!("-L{}", p.display()))
            .collect::<Vec<_>>()
            .join(" ");

        let mut vars = vec![
            ("PATH".to_string(), join(&bin_dirs), ":".to_string()),
            ("LD_LIBRARY_PATH".to_string(), join(&lib_dirs), ":".to_string()),
            ("CFLAGS".to_string(), cflags.clone(), " ".to_string()),
            ("CCFLAGS".to_string(), cflags.clone(), " ".to_string()),
            ("CPPFLAGS".to_string(), cflags, " ".to_string()),
            ("LDFLAGS".to_string(), ldflags, " ".to_string()),
        ];

        if let Some(preload) = self.find_ld_linux() {
            vars.push(("LD_PRELOAD".to_string(), preload, ":".to_string()));
        }

        vars
    }

    /// Compose the variables of an activated session.
    ///
    /// `isolate` starts from an empty environment instead of the current
    /// one; `gui` preserves the small whitelist needed for graphical I/O.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BadRecipe`] when the toolset overlay fails to
    /// render.
    pub fn session_env(&self, isolate: bool, gui: bool) -> Result<BuildEnv> {
        let snapshot = BuildEnv::snapshot();

        let mut env = if isolate {
            let mut env = BuildEnv::empty();
            if gui {
                for name in GUI_WHITELIST {
                    if let Some(value) = snapshot.get(name) {
                        env.set(*name, value.to_string());
                    }
                }
            }
            env
        } else {
            snapshot
        };

        for (name, value, sep) in self.get_env_vars() {
            env.prepend(&name, &value, &sep);
        }
        env.set(paths::XPKG_ROOT_VAR, self.prefix.display().to_string());

        let subs: BTreeMap<String, String> =
            [("env_root".to_string(), self.prefix.display().to_string())].into();
        self.settings.toolset.apply_env(&mut env, &subs)?;

        Ok(env)
    }

    /// Replace this process with `program` running inside the activated
    /// environment. Only returns on exec failure.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::Io`] when `program` cannot be executed.
    pub fn jump(&self, program: &str, args: &[String]) -> Result<std::convert::Infallible> {
        use std::os::unix::process::CommandExt;

        let mut env = self.session_env(false, true)?;
        env.set("PS1", r"(xpkg) \u@\h:\w\$ ");

        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        env.apply_to(&mut cmd);

        let err = cmd.exec();
        Err(XpkgError::io(program, err))
    }

    /// What the builder needs to know about this environment.
    pub fn build_context(&self) -> BuildContext {
        BuildContext {
            env_root: self.prefix.clone(),
            log_dir: paths::log_dir(&self.prefix),
            env_vars: self.get_env_vars(),
            toolset: Some(self.settings.toolset.clone()),
        }
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.repo, &self.tree, &self.db, Some(&self.settings.toolset))
    }

    /// Install every plan item in order, skipping anything a previous item
    /// already brought in (a multi-output build installs siblings at once).
    fn execute_plan(&mut self, plan: Vec<PlanItem>) -> Result<()> {
        for item in plan {
            if self.db.installed(&item.name, None) {
                debug!(package = item.name, "already installed by an earlier plan item");
                continue;
            }
            self.install_located(item.located)?;
        }
        Ok(())
    }

    fn install_located(&mut self, located: Located) -> Result<()> {
        match located {
            Located::Repo { path, manifest, .. } => {
                self.install_xpa(&Xpa::with_manifest(path, manifest))
            }
            Located::Tree { recipe, .. } => self.install_recipe(&recipe),
        }
    }

    /// Build a recipe into the archive cache, then install every produced
    /// archive (a multi-output recipe installs all its outputs).
    fn install_recipe(&mut self, recipe: &Recipe) -> Result<()> {
        info!(package = recipe.name, version = recipe.version, "building from recipe");

        let cache_dir = paths::xpa_cache_dir(&self.prefix);
        let ctx = self.build_context();

        let xpa_paths = BinaryPackageBuilder::new(recipe)
            .with_cache(crate::cache::SourceCache::at(&self.cache_root))
            .verbose(self.verbose)
            .build(&cache_dir, Some(&ctx))?;

        for path in xpa_paths {
            let xpa = Xpa::open(&path)?;
            if self.db.installed(&xpa.manifest().name, Some(&xpa.manifest().version)) {
                debug!(package = xpa.manifest().name, "output already installed");
                continue;
            }
            self.install_xpa(&xpa)?;
        }

        Ok(())
    }

    /// Extract and relocate one archive, then record it installed.
    fn install_xpa(&mut self, xpa: &Xpa) -> Result<()> {
        install_archive(xpa, &self.prefix)?;
        self.db.mark_installed(xpa.manifest())
    }

    /// Double-install and version-conflict checks for a requested package.
    fn check_not_installed(&self, name: &str, version: Option<&str>) -> Result<()> {
        let Some(record) = self.db.get(name) else {
            return Ok(());
        };

        if version.is_none_or(|v| v == record.version) {
            Err(XpkgError::Conflict(format!(
                "package {name} already at version: {}",
                record.version
            )))
        } else {
            Err(XpkgError::Conflict(format!(
                "package {name} already at version: {} conflicts with: {}",
                record.version,
                version.unwrap_or_default()
            )))
        }
    }

    /// A custom loader under `lib/`, if one is installed.
    fn find_ld_linux(&self) -> Option<String> {
        let lib_dir = self.prefix.join("lib");
        let mut loaders: Vec<String> = fs::read_dir(&lib_dir)
            .ok()?
            .filter_map(std::result::Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with("ld-linux"))
            .collect();

        loaders.sort();
        if loaders.len() > 1 {
            warn!(using = loaders[0], "multiple ld-linux loaders found");
        }

        loaders
            .first()
            .map(|name| lib_dir.join(name).display().to_string())
    }
}

/// Explicit paths, else a colon-separated environment variable, else none.
fn resolve_paths(explicit: Option<Vec<PathBuf>>, var: &str) -> Vec<PathBuf> {
    if let Some(paths) = explicit {
        return paths;
    }

    std::env::var(var)
        .map(|raw| raw.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default()
}

fn open_sources(
    source_paths: &[PathBuf],
    cache_root: &Path,
    open: impl Fn(&Path, &Path) -> Result<PackageSource>,
) -> Result<CombinedSource> {
    let mut sources = Vec::new();
    for path in source_paths {
        sources.push(open(path, cache_root)?);
    }
    Ok(CombinedSource::new(sources))
}
