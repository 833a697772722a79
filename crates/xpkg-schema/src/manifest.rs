//! Binary archive (XPA) manifests and install-path offset tables.
//!
//! The manifest is the `xpkg.yml` member of an archive. Its heart is the
//! offset table: for every packaged file, the byte offsets at which the
//! build-time install prefix was embedded, classified by how the occurrence
//! is terminated. The installer rewrites exactly those bytes when the
//! archive lands in a different prefix.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::depspec::DepSpec;

/// Offsets of the build prefix inside one package's files.
///
/// * `text_files` -- offsets of unterminated occurrences in NUL-free files;
///   rewrites there may change the file length.
/// * `binary_files` -- occurrences that are exactly NUL-terminated at
///   `offset + install_dir.len()`; rewrites are length-preserving.
/// * `sub_binary_files` -- occurrences that are a prefix of a longer C
///   string. Each group lists every occurrence sharing one terminator, with
///   the terminator offset as the last element.
/// * `recompile_files` -- files (compiled bytecode) whose offsets are not
///   patched; the installer regenerates them from source instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOffsets {
    /// The absolute prefix the archive was built against.
    pub install_dir: String,

    /// `relpath -> [offset, ...]` for text files.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub text_files: BTreeMap<String, Vec<u64>>,

    /// `relpath -> [offset, ...]` for exactly NUL-terminated occurrences.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary_files: BTreeMap<String, Vec<u64>>,

    /// `relpath -> [[o1, ..., ok, null_off], ...]` for substring occurrences.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_binary_files: BTreeMap<String, Vec<Vec<u64>>>,

    /// Files rewritten by recompilation rather than byte patching.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recompile_files: Vec<String>,
}

impl PathOffsets {
    /// A table with the given install prefix and no entries.
    pub fn new(install_dir: impl Into<String>) -> Self {
        Self {
            install_dir: install_dir.into(),
            ..Self::default()
        }
    }

    /// Whether any file carries offsets or needs recompilation.
    pub fn is_empty(&self) -> bool {
        self.text_files.is_empty()
            && self.binary_files.is_empty()
            && self.sub_binary_files.is_empty()
            && self.recompile_files.is_empty()
    }

    /// The subset of this table covering only `files`.
    ///
    /// Used when one build is split into several sub-output archives: each
    /// archive carries offsets only for the files it owns.
    pub fn subset_for(&self, files: &BTreeSet<String>) -> Self {
        Self {
            install_dir: self.install_dir.clone(),
            text_files: self
                .text_files
                .iter()
                .filter(|(path, _)| files.contains(*path))
                .map(|(path, offsets)| (path.clone(), offsets.clone()))
                .collect(),
            binary_files: self
                .binary_files
                .iter()
                .filter(|(path, _)| files.contains(*path))
                .map(|(path, offsets)| (path.clone(), offsets.clone()))
                .collect(),
            sub_binary_files: self
                .sub_binary_files
                .iter()
                .filter(|(path, _)| files.contains(*path))
                .map(|(path, groups)| (path.clone(), groups.clone()))
                .collect(),
            recompile_files: self
                .recompile_files
                .iter()
                .filter(|path| files.contains(*path))
                .cloned()
                .collect(),
        }
    }
}

/// The `xpkg.yml` manifest of a binary archive, and the record shape the
/// install database stores per package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Package name.
    pub name: String,

    /// Package version.
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Runtime dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DepSpec>,

    /// Directories the package owns, relative to the prefix.
    #[serde(default)]
    pub dirs: Vec<String>,

    /// Ordinary files the package owns, relative to the prefix.
    #[serde(default)]
    pub files: Vec<String>,

    /// Where the build prefix is embedded in those files.
    #[serde(default)]
    pub install_path_offsets: PathOffsets,
}

impl Manifest {
    /// Whether `path` is one of this package's files or directories.
    pub fn owns(&self, path: &str) -> bool {
        self.files.iter().any(|f| f == path) || self.dirs.iter().any(|d| d == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_offsets() -> PathOffsets {
        let mut table = PathOffsets::new("/tmp/xpkg-install-abc123");
        table
            .text_files
            .insert("share/hello/msg.txt".into(), vec![5, 100]);
        table.binary_files.insert("bin/hello".into(), vec![12947]);
        table
            .sub_binary_files
            .insert("bin/hello".into(), vec![vec![1000, 1015], vec![7562, 7590, 7610]]);
        table.recompile_files.push("lib/hello/greet.pyc".into());
        table
    }

    #[test]
    fn subset_keeps_only_owned_entries() {
        let table = sample_offsets();
        let files: BTreeSet<String> = ["bin/hello".to_string()].into();

        let subset = table.subset_for(&files);
        assert_eq!(subset.install_dir, table.install_dir);
        assert!(subset.text_files.is_empty());
        assert!(subset.recompile_files.is_empty());
        assert_eq!(subset.binary_files.len(), 1);
        assert_eq!(subset.sub_binary_files["bin/hello"].len(), 2);
    }

    #[test]
    fn yaml_round_trip() {
        let manifest = Manifest {
            name: "hello".into(),
            version: "1.0.0".into(),
            description: "My hello world package".into(),
            dependencies: vec![DepSpec::any("libgreet")],
            dirs: vec!["bin".into()],
            files: vec!["bin/hello".into()],
            install_path_offsets: sample_offsets(),
        };

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let back: Manifest = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(back.name, "hello");
        assert_eq!(back.install_path_offsets, manifest.install_path_offsets);
        assert!(back.owns("bin/hello"));
        assert!(back.owns("bin"));
        assert!(!back.owns("lib"));
    }

    #[test]
    fn missing_offset_sections_default_to_empty() {
        let yaml = "\
name: tiny
version: '1'
dirs: []
files: []
install_path_offsets:
  install_dir: /tmp/xpkg-install-tiny
";
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert!(manifest.install_path_offsets.is_empty());
    }
}
