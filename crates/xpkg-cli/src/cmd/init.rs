//! Create a new environment.

use std::path::Path;

use anyhow::Result;
use xpkg_core::Environment;

/// Initialise an environment at `prefix`.
///
/// # Errors
///
/// Fails when the prefix already holds an environment or the toolset name
/// is unknown.
pub fn init(prefix: &Path, name: &str, toolset: Option<&str>) -> Result<()> {
    Environment::init(prefix, name, toolset)?;
    println!("Initialised environment '{name}' at {}", prefix.display());
    Ok(())
}
