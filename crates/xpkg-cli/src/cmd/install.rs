//! Install packages.

use std::path::PathBuf;

use anyhow::Result;
use xpkg_core::env::EnvOptions;

/// Install each requested package in turn.
///
/// # Errors
///
/// Surfaces the core's typed errors; the first failure stops the run.
pub fn install(
    root: Option<PathBuf>,
    names: &[String],
    tree: Option<PathBuf>,
    repo: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let options = EnvOptions {
        tree_paths: tree.map(|p| vec![p]),
        repo_paths: repo.map(|p| vec![p]),
        cache_root: None,
        verbose,
    };

    let mut env = super::open_env(root, options)?;
    for name in names {
        env.install(name)?;
        println!("Installed {name}");
    }

    Ok(())
}
