//! Dependency expressions: `NAME` or `NAME==VERSION`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error raised for malformed dependency expressions.
#[derive(Debug, thiserror::Error)]
#[error("invalid package expression: {0}")]
pub struct DepSpecError(String);

/// A dependency on a package, optionally pinned to an exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepSpec {
    name: String,
    version: Option<String>,
}

impl DepSpec {
    /// A dependency on any version of `name`.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// A dependency pinned to `name==version`.
    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// The package name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pinned version, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Whether `version` satisfies this spec.
    pub fn matches(&self, version: &str) -> bool {
        self.version.as_deref().is_none_or(|want| want == version)
    }
}

impl FromStr for DepSpec {
    type Err = DepSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split("==");

        let name = parts.next().unwrap_or_default();
        let version = parts.next();

        if name.is_empty() || version.is_some_and(str::is_empty) || parts.next().is_some() {
            return Err(DepSpecError(s.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            version: version.map(ToString::to_string),
        })
    }
}

impl fmt::Display for DepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}=={v}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Serialize for DepSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DepSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name() {
        let dep: DepSpec = "libgreet".parse().unwrap();
        assert_eq!(dep.name(), "libgreet");
        assert_eq!(dep.version(), None);
        assert!(dep.matches("0.1"));
        assert!(dep.matches("2.0"));
    }

    #[test]
    fn pinned_version() {
        let dep: DepSpec = "libgreet==1.0.0".parse().unwrap();
        assert_eq!(dep.name(), "libgreet");
        assert_eq!(dep.version(), Some("1.0.0"));
        assert!(dep.matches("1.0.0"));
        assert!(!dep.matches("2.0.0"));
    }

    #[test]
    fn rejects_malformed() {
        assert!("".parse::<DepSpec>().is_err());
        assert!("a==".parse::<DepSpec>().is_err());
        assert!("a==1==2".parse::<DepSpec>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["zlib", "zlib==1.2.8"] {
            assert_eq!(s.parse::<DepSpec>().unwrap().to_string(), s);
        }
    }
}
