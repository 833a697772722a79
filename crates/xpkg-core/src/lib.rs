//! Core engine for the Xpkg package manager.
//!
//! This crate provides everything between the wire formats and the CLI:
//! resolving a package request into a concrete install plan, driving builds
//! inside a controlled environment, producing relocatable binary archives
//! with exact install-path offset tables, and installing archives into a
//! target prefix by rewriting those offsets in place. It is designed to be
//! consumed by the `xpkg` CLI without coupling to any particular front end.

/// Reading and writing binary package archives (XPA).
pub mod archive;
/// Build orchestration: recipes to relocatable archives.
pub mod builder;
/// Content-addressed cache of fetched sources.
pub mod cache;
/// Shell and built-in command execution with owned environments.
pub mod commands;
/// The on-disk install database with directory reference counts.
pub mod db;
/// The environment: one prefix and its operations.
pub mod env;
/// The typed error taxonomy.
pub mod error;
/// Package indexes over recipe trees and archive repos.
pub mod index;
/// The relocating installer.
pub mod installer;
/// The Xpkg directory layout and environment variables.
pub mod paths;
/// Dependency resolution into install plans.
pub mod resolver;
/// The install-path offset scanner.
pub mod scanner;
/// Toolsets: build roles and environment overlays.
pub mod toolset;

// Re-exports
pub use archive::Xpa;
pub use builder::{BinaryPackageBuilder, BuildContext, PackageBuilder};
pub use cache::SourceCache;
pub use db::InstallDatabase;
pub use env::{EnvOptions, Environment, Info};
pub use error::{Result, XpkgError};
pub use installer::install_archive;
pub use resolver::Resolver;
pub use toolset::Toolset;
