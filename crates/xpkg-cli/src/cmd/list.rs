//! List installed packages.

use std::path::PathBuf;

use anyhow::Result;

/// Print every installed package as `name - version`.
///
/// # Errors
///
/// Fails only when the environment cannot be opened.
pub fn list(root: Option<PathBuf>) -> Result<()> {
    let env = super::open_env(root, Default::default())?;

    for (name, record) in env.database().iter_packages() {
        println!("  {name} - {}", record.version);
    }

    Ok(())
}
