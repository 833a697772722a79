//! Toolsets: named sets of abstract build roles and environment overlays.
//!
//! A recipe's build dependencies may name concrete packages or abstract
//! roles like `tl:c-compiler`. The active toolset maps each role to a
//! concrete package (or to nothing, meaning "use whatever the host
//! provides") and contributes an environment-variable overlay (`CC=gcc`
//! and friends) applied to every build.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::commands::{BuildEnv, interp};
use crate::error::{Result, XpkgError};

/// Prefix marking a toolset-indirect build dependency.
const ROLE_PREFIX: &str = "tl:";

/// How an overlay variable combines with an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvAction {
    /// Overwrite the variable.
    Replace,
    /// Append the rendered template to the current value.
    Append,
    /// Prepend the rendered template to the current value.
    Prepend,
}

/// One overlay entry: a `%(var)s` template and how to apply it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec(pub String, pub EnvAction);

/// A named build-role mapping plus environment overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolset {
    /// Toolset name (`GNU`, `local`, ...).
    pub name: String,

    /// `role -> concrete package` (roles include `shell`, `base`, `linker`,
    /// `c-compiler`, `c++-compiler`, `libc`). An empty value means the
    /// host's tool is used and no package is installed for the role.
    #[serde(rename = "build-deps", default)]
    pub build_deps: BTreeMap<String, String>,

    /// Environment overlay applied to builds.
    #[serde(rename = "env-vars", default)]
    pub env_vars: BTreeMap<String, EnvVarSpec>,

    /// Strip the build environment down to what the toolset sets.
    #[serde(default)]
    pub isolate: bool,

    /// Resolve every role to "use the host's": for bootstrapping the
    /// first packages of a world. Mutually exclusive with `isolate`.
    #[serde(default)]
    pub no_build_deps: bool,
}

impl Toolset {
    /// Validate invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BadRecipe`] if `isolate` and `no_build_deps`
    /// are both set.
    pub fn validate(&self) -> Result<()> {
        if self.isolate && self.no_build_deps {
            return Err(XpkgError::BadRecipe(format!(
                "toolset {} cannot both isolate and ignore build deps",
                self.name
            )));
        }
        Ok(())
    }

    /// Translate one build dependency.
    ///
    /// A concrete name passes through unchanged. A `tl:ROLE` token becomes
    /// the role's concrete package, or `None` when the host provides it
    /// (empty mapping value, or a `no_build_deps` toolset).
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] when the role is not in this
    /// toolset's mapping.
    pub fn resolve(&self, dep: &str) -> Result<Option<String>> {
        let Some(role) = dep.strip_prefix(ROLE_PREFIX) else {
            return Ok(Some(dep.to_string()));
        };

        if self.no_build_deps {
            return Ok(None);
        }

        match self.build_deps.get(role) {
            Some(pkg) if pkg.is_empty() => Ok(None),
            Some(pkg) => Ok(Some(pkg.clone())),
            None => Err(XpkgError::NotFound(format!(
                "toolset {} does not have a package for role: {role}",
                self.name
            ))),
        }
    }

    /// Render the overlay with `subs` and write it onto `env`.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BadRecipe`] when a template references an
    /// undefined substitution variable.
    pub fn apply_env(&self, env: &mut BuildEnv, subs: &BTreeMap<String, String>) -> Result<()> {
        for (name, EnvVarSpec(template, action)) in &self.env_vars {
            let value = interp(template, subs).map_err(|e| {
                XpkgError::BadRecipe(format!("toolset {} var {name}: {e}", self.name))
            })?;

            match action {
                EnvAction::Replace => env.set(name, value),
                EnvAction::Append => env.append(name, &value, ""),
                EnvAction::Prepend => env.prepend(name, &value, ""),
            }
        }
        Ok(())
    }

    /// The built-in GNU toolset.
    pub fn gnu() -> Self {
        Self {
            name: "GNU".to_string(),
            build_deps: [
                ("shell", "dash"),
                ("base", "coreutils"),
                ("linker", "binutils"),
                ("c-compiler", "gcc"),
                ("c++-compiler", "gcc"),
                ("libc", "ubuntu-libc"),
            ]
            .into_iter()
            .map(|(role, pkg)| (role.to_string(), pkg.to_string()))
            .collect(),
            env_vars: [
                ("CC", EnvVarSpec("gcc".to_string(), EnvAction::Replace)),
                ("CXX", EnvVarSpec("g++".to_string(), EnvAction::Replace)),
            ]
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect(),
            isolate: false,
            no_build_deps: false,
        }
    }

    /// The built-in bootstrap toolset: every role falls back to the host.
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            build_deps: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            isolate: false,
            no_build_deps: true,
        }
    }

    /// Look up a built-in toolset by name.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] for an unknown name.
    pub fn builtin(name: &str) -> Result<Self> {
        match name {
            "GNU" => Ok(Self::gnu()),
            "local" => Ok(Self::local()),
            other => Err(XpkgError::NotFound(format!(
                "cannot find toolset: {other}"
            ))),
        }
    }

    /// The toolset used when none is named at `init` time.
    pub fn default_name() -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_deps_pass_through() {
        let ts = Toolset::gnu();
        assert_eq!(ts.resolve("zlib").unwrap(), Some("zlib".to_string()));
        assert_eq!(ts.resolve("zlib==1.2.8").unwrap(), Some("zlib==1.2.8".to_string()));
    }

    #[test]
    fn roles_resolve_through_the_mapping() {
        let ts = Toolset::gnu();
        assert_eq!(ts.resolve("tl:c-compiler").unwrap(), Some("gcc".to_string()));
        assert_eq!(ts.resolve("tl:libc").unwrap(), Some("ubuntu-libc".to_string()));
        assert!(matches!(
            ts.resolve("tl:fortran-compiler"),
            Err(XpkgError::NotFound(_))
        ));
    }

    #[test]
    fn no_build_deps_resolves_roles_to_host() {
        let ts = Toolset::local();
        assert_eq!(ts.resolve("tl:c-compiler").unwrap(), None);
        assert_eq!(ts.resolve("make").unwrap(), Some("make".to_string()));
    }

    #[test]
    fn empty_role_value_means_host_provided() {
        let mut ts = Toolset::gnu();
        ts.build_deps.insert("libc".to_string(), String::new());
        assert_eq!(ts.resolve("tl:libc").unwrap(), None);
    }

    #[test]
    fn isolate_and_no_build_deps_conflict() {
        let mut ts = Toolset::local();
        ts.isolate = true;
        assert!(ts.validate().is_err());
    }

    #[test]
    fn overlay_actions_apply_in_order() {
        let mut ts = Toolset::gnu();
        ts.env_vars.insert(
            "LDFLAGS".to_string(),
            EnvVarSpec(" -L%(env_root)s/lib".to_string(), EnvAction::Append),
        );

        let mut env = BuildEnv::empty();
        env.set("LDFLAGS", "-L/opt/lib");

        let subs = [("env_root".to_string(), "/env".to_string())].into();
        ts.apply_env(&mut env, &subs).unwrap();

        assert_eq!(env.get("CC"), Some("gcc"));
        assert_eq!(env.get("LDFLAGS"), Some("-L/opt/lib -L/env/lib"));
    }

    #[test]
    fn settings_round_trip() {
        let yaml = serde_yaml::to_string(&Toolset::gnu()).unwrap();
        let back: Toolset = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.name, "GNU");
        assert_eq!(back.resolve("tl:shell").unwrap(), Some("dash".to_string()));
        assert_eq!(
            back.env_vars.get("CC"),
            Some(&EnvVarSpec("gcc".to_string(), EnvAction::Replace))
        );
    }
}
