//! Declarative build recipes (XPD files).
//!
//! An XPD is a YAML document describing how to fetch, configure, build, and
//! install one package, or several packages produced by a single build
//! (`packages` sub-outputs). Parsing is strict about structure but lenient
//! about omissions: almost every field of a sub-output falls back to the
//! top-level recipe value.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::depspec::DepSpec;
use crate::hash::HashSpec;

/// Error raised while loading or validating a recipe.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    /// The file could not be read.
    #[error("cannot read recipe {path}: {source}")]
    Io {
        /// Path of the recipe being read.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// The YAML is malformed or violates the recipe schema.
    #[error("cannot parse recipe: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Two sub-outputs both omit `files` and claim the leftover set.
    #[error("sub-output {second} cannot grab all files, {first} already does")]
    DuplicateCatchAll {
        /// The first catch-all encountered.
        first: String,
        /// The conflicting second catch-all.
        second: String,
    },

    /// Sub-output dependencies form a cycle inside one recipe.
    #[error("sub-outputs of {name} form a dependency cycle")]
    OutputCycle {
        /// The recipe whose sub-outputs are cyclic.
        name: String,
    },
}

/// One entry of a recipe `files` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// Where to fetch the source from (`http(s)://`, `file://`, or the
    /// recipe-relative `xpd://` scheme).
    pub url: String,

    /// Optional directory (relative to the build workspace) the unpacked
    /// source is moved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// The value of a single command step: one shell string or one structured
/// built-in invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandItem {
    /// A shell command string, run via `sh -c` after variable substitution.
    Shell(String),

    /// A built-in invocation such as `{symlink: [src, link]}`. The mapping
    /// must have exactly one key; this is validated at execution time.
    BuiltIn(BTreeMap<String, BuiltInSpec>),
}

/// The arguments of a built-in command, optionally with a working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuiltInSpec {
    /// `{args: ..., working_dir: ...}` form.
    Detailed {
        /// Positional arguments.
        args: ArgList,
        /// Directory to run in, relative paths resolved against the build dir.
        #[serde(default)]
        working_dir: String,
    },

    /// Bare argument form: the mapping value is the argument list itself.
    Bare(ArgList),
}

impl BuiltInSpec {
    /// The positional arguments regardless of form.
    pub fn args(&self) -> &ArgList {
        match self {
            Self::Detailed { args, .. } | Self::Bare(args) => args,
        }
    }

    /// The working directory, empty when unset.
    pub fn working_dir(&self) -> &str {
        match self {
            Self::Detailed { working_dir, .. } => working_dir,
            Self::Bare(_) => "",
        }
    }
}

/// One or more string arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgList {
    /// A single argument.
    One(String),
    /// Several arguments.
    Many(Vec<String>),
}

impl ArgList {
    /// View the arguments as a slice-like vector.
    pub fn to_vec(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

/// A `configure` / `build` / `install` phase: one command, a list of
/// commands, or a list wrapped with per-phase environment additions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Commands {
    /// `{env: {VAR: value}, cmds: [...]}` -- each var is appended
    /// (space-separated) to any existing value while the commands run.
    WithEnv {
        /// Environment additions scoped to these commands.
        env: BTreeMap<String, String>,
        /// The wrapped command list.
        cmds: Box<Commands>,
    },

    /// A plain list of steps.
    Many(Vec<CommandItem>),

    /// A single step.
    Single(CommandItem),
}

impl Commands {
    /// Flatten into the environment additions (if any) and the step list.
    pub fn steps(&self) -> (Option<&BTreeMap<String, String>>, Vec<&CommandItem>) {
        match self {
            Self::WithEnv { env, cmds } => {
                let (_, items) = cmds.steps();
                (Some(env), items)
            }
            Self::Many(items) => (None, items.iter().collect()),
            Self::Single(item) => (None, vec![item]),
        }
    }
}

/// A sub-output of a multi-package recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubPackage {
    /// Version override; falls back to the recipe version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Description override; falls back to the recipe description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Runtime dependencies; fall back to the recipe dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<DepSpec>>,

    /// Directories this sub-output claims outright.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dirs: Vec<String>,

    /// Regex patterns (full-match) selecting this sub-output's files.
    /// Omitted entirely for the catch-all sub-output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// A parsed XPD recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Package name.
    pub name: String,

    /// Package version string.
    pub version: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Runtime dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DepSpec>,

    /// Build dependencies: concrete names, pins, or toolset-indirect
    /// `tl:ROLE` tokens resolved at build time.
    #[serde(
        default,
        rename = "build-dependencies",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub build_dependencies: Vec<String>,

    /// Sources keyed by content hash.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<HashSpec, SourceFile>,

    /// Configure phase commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configure: Option<Commands>,

    /// Build phase commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Commands>,

    /// Install phase commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Commands>,

    /// Directory (relative to the unpack workspace) to run commands in.
    #[serde(
        default,
        rename = "build-dir",
        skip_serializing_if = "Option::is_none"
    )]
    pub build_dir: Option<String>,

    /// Sub-outputs for multi-package recipes. A `null` body means
    /// "all defaults".
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, Option<SubPackage>>,

    /// Where the recipe was loaded from, when it came from disk. Used to
    /// resolve `xpd://` source URLs.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

/// One concrete output of a recipe, with every fallback applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    /// Output package name.
    pub name: String,
    /// Output version.
    pub version: String,
    /// Output description.
    pub description: String,
    /// Output runtime dependencies.
    pub dependencies: Vec<DepSpec>,
    /// Directories claimed outright.
    pub dirs: Vec<String>,
    /// File-selecting regex patterns; `None` marks the catch-all.
    pub files: Option<Vec<String>>,
}

impl OutputSpec {
    /// Whether this output absorbs every file no other output matched.
    pub fn is_catch_all(&self) -> bool {
        self.files.is_none()
    }
}

impl Recipe {
    /// Load and parse a recipe from disk.
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError::Io`] if the file cannot be read and
    /// [`RecipeError::Parse`] if the YAML is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecipeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| RecipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut recipe: Self = serde_yaml::from_reader(file)?;
        recipe.path = Some(path.to_path_buf());
        recipe.validate()?;

        Ok(recipe)
    }

    /// Parse a recipe from a YAML string (no backing file).
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError::Parse`] if the YAML is malformed or the
    /// sub-output structure is invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self, RecipeError> {
        let recipe: Self = serde_yaml::from_str(yaml)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// The directory the recipe was loaded from, for `xpd://` resolution.
    pub fn dir(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// The description, defaulting to empty.
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }

    /// All outputs this recipe produces, dependencies-first.
    ///
    /// A single-output recipe yields one record derived from the top-level
    /// fields. A multi-output recipe yields one record per sub-output,
    /// topologically sorted by the dependencies among them (ties broken
    /// alphabetically), with per-field fallback to the top-level values.
    ///
    /// # Errors
    ///
    /// Returns [`RecipeError::OutputCycle`] if intra-recipe dependencies are
    /// cyclic and [`RecipeError::DuplicateCatchAll`] if two sub-outputs omit
    /// `files`.
    pub fn outputs(&self) -> Result<Vec<OutputSpec>, RecipeError> {
        self.validate()?;

        if self.packages.is_empty() {
            return Ok(vec![OutputSpec {
                name: self.name.clone(),
                version: self.version.clone(),
                description: self.description().to_string(),
                dependencies: self.dependencies.clone(),
                dirs: Vec::new(),
                files: None,
            }]);
        }

        let mut outputs = Vec::new();
        for name in self.sorted_output_names()? {
            let data = self.packages[&name].clone().unwrap_or_default();

            outputs.push(OutputSpec {
                name,
                version: data.version.unwrap_or_else(|| self.version.clone()),
                description: data
                    .description
                    .unwrap_or_else(|| self.description().to_string()),
                dependencies: data
                    .dependencies
                    .unwrap_or_else(|| self.dependencies.clone()),
                dirs: data.dirs,
                files: data.files,
            });
        }

        Ok(outputs)
    }

    /// Validate the structural rules serde cannot express.
    fn validate(&self) -> Result<(), RecipeError> {
        let mut catch_all: Option<&str> = None;

        for (name, data) in &self.packages {
            let has_files = data
                .as_ref()
                .is_some_and(|d| d.files.is_some());

            if !has_files {
                if let Some(first) = catch_all {
                    return Err(RecipeError::DuplicateCatchAll {
                        first: first.to_string(),
                        second: name.clone(),
                    });
                }
                catch_all = Some(name);
            }
        }

        // Surfaces cycles among sub-outputs early.
        if !self.packages.is_empty() {
            self.sorted_output_names()?;
        }

        Ok(())
    }

    /// Topological order of sub-output names: every dependency among peers
    /// precedes its dependent; ties break alphabetically.
    fn sorted_output_names(&self) -> Result<Vec<String>, RecipeError> {
        let peers: BTreeSet<&str> = self.packages.keys().map(String::as_str).collect();

        // Edges dependent -> dependency, filtered to peers in this recipe.
        let mut deps_of: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (name, data) in &self.packages {
            let entry = deps_of.entry(name.as_str()).or_default();
            if let Some(data) = data {
                for dep in data.dependencies.iter().flatten() {
                    if peers.contains(dep.name()) {
                        entry.insert(dep.name());
                    }
                }
            }
        }

        let mut order = Vec::new();
        let mut placed: BTreeSet<&str> = BTreeSet::new();

        while placed.len() < peers.len() {
            let mut advanced = false;

            for (name, deps) in &deps_of {
                if !placed.contains(name) && deps.iter().all(|d| placed.contains(d)) {
                    order.push((*name).to_string());
                    placed.insert(*name);
                    advanced = true;
                }
            }

            if !advanced {
                return Err(RecipeError::OutputCycle {
                    name: self.name.clone(),
                });
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = "\
name: hello
version: 1.0.0
description: My hello world package
files:
  md5-9a8ad92c50cae39aa2c5604fd0ab6d8c:
    url: http://example.com/hello-1.0.0.tar.gz
configure: ./configure --prefix=%(prefix)s
build: make -j%(jobs)s
install: make install
";

    const MULTI: &str = "\
name: multi
version: 2.0.0
dependencies: [zlib]
packages:
  libmulti:
    files: ['lib/.*']
  libmulti-dev:
    dependencies: [libmulti]
    files: ['include/.*']
  multi-tools:
    version: 2.0.1
    dependencies: [libmulti]
    files: ['bin/.*']
  multi-extras:
";

    #[test]
    fn single_output_falls_back_to_top_level() {
        let recipe = Recipe::from_yaml(SINGLE).unwrap();
        let outputs = recipe.outputs().unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "hello");
        assert_eq!(outputs[0].version, "1.0.0");
        assert!(outputs[0].is_catch_all());
    }

    #[test]
    fn commands_accept_string_list_and_env_forms() {
        let recipe = Recipe::from_yaml(
            "\
name: forms
version: '1'
configure: ./configure
build:
  - make
  - make check
install:
  env:
    DESTDIR: /tmp/stage
  cmds:
    - make install
    - symlink: ['bin/tool', 'bin/tool-1']
",
        )
        .unwrap();

        let (env, steps) = recipe.install.as_ref().unwrap().steps();
        assert_eq!(env.unwrap().get("DESTDIR").unwrap(), "/tmp/stage");
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], CommandItem::Shell(_)));
        assert!(matches!(steps[1], CommandItem::BuiltIn(_)));
    }

    #[test]
    fn multi_outputs_are_dependency_ordered() {
        let recipe = Recipe::from_yaml(MULTI).unwrap();
        let outputs = recipe.outputs().unwrap();
        let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();

        // libmulti precedes both of its dependents.
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("libmulti") < pos("libmulti-dev"));
        assert!(pos("libmulti") < pos("multi-tools"));
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn sub_output_fallbacks_apply() {
        let recipe = Recipe::from_yaml(MULTI).unwrap();
        let outputs = recipe.outputs().unwrap();

        let dev = outputs.iter().find(|o| o.name == "libmulti-dev").unwrap();
        assert_eq!(dev.version, "2.0.0");

        let tools = outputs.iter().find(|o| o.name == "multi-tools").unwrap();
        assert_eq!(tools.version, "2.0.1");

        let extras = outputs.iter().find(|o| o.name == "multi-extras").unwrap();
        assert!(extras.is_catch_all());
        assert_eq!(extras.dependencies, vec![DepSpec::any("zlib")]);
    }

    #[test]
    fn two_catch_alls_are_rejected() {
        let err = Recipe::from_yaml(
            "\
name: bad
version: '1'
packages:
  a:
  b:
",
        )
        .unwrap_err();
        assert!(matches!(err, RecipeError::DuplicateCatchAll { .. }));
    }

    #[test]
    fn output_cycles_are_rejected() {
        let err = Recipe::from_yaml(
            "\
name: cyclic
version: '1'
packages:
  a:
    dependencies: [b]
    files: ['lib/.*']
  b:
    dependencies: [a]
    files: ['bin/.*']
",
        )
        .unwrap_err();
        assert!(matches!(err, RecipeError::OutputCycle { .. }));
    }
}
