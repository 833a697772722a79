//! Shared types and wire formats for the Xpkg package manager.
//!
//! This crate defines the canonical data structures used across all Xpkg
//! components: the Debian-style version algebra, content-hash specs,
//! dependency expressions, declarative build recipes (XPD), and binary
//! archive manifests with their install-path offset tables (XPA). It does
//! no I/O beyond reading recipe files.

/// Dependency expressions: `NAME` or `NAME==VERSION`.
pub mod depspec;
/// Content-hash specs of the form `<algo>-<hex>`.
pub mod hash;
/// Archive manifests and install-path offset tables.
pub mod manifest;
/// Declarative build recipes (XPD).
pub mod recipe;
/// Debian-style version parsing and total ordering.
pub mod version;

// Re-exports
pub use depspec::DepSpec;
pub use hash::{HashAlgo, HashSpec};
pub use manifest::{Manifest, PathOffsets};
pub use recipe::{OutputSpec, Recipe, RecipeError};
pub use version::{Version, compare_versions};
