//! Remove installed packages.

use std::path::PathBuf;

use anyhow::Result;

/// Remove each named package in turn.
///
/// # Errors
///
/// Fails when a package is absent or still required by another.
pub fn remove(root: Option<PathBuf>, names: &[String]) -> Result<()> {
    let mut env = super::open_env(root, Default::default())?;
    for name in names {
        env.remove(name)?;
        println!("Removed {name}");
    }

    Ok(())
}
