//! Build a recipe into binary archives.

use std::path::{Path, PathBuf};

use anyhow::Result;
use xpkg_core::BinaryPackageBuilder;
use xpkg_core::env::EnvOptions;
use xpkg_schema::Recipe;

/// Build the recipe at `path` into `dest`.
///
/// A recipe with dependencies builds inside the environment; one without
/// can build free-standing when no environment is available.
///
/// # Errors
///
/// Surfaces recipe, resolution, and build failures.
pub fn build(root: Option<PathBuf>, path: &Path, dest: &Path, verbose: bool) -> Result<()> {
    let recipe = Recipe::load(path)?;

    let needs_env = !recipe.dependencies.is_empty() || !recipe.build_dependencies.is_empty();

    let archives = match super::open_env(
        root,
        EnvOptions {
            verbose,
            ..Default::default()
        },
    ) {
        Ok(mut env) => env.build(&recipe, dest, verbose)?,
        Err(err) if !needs_env => {
            // No environment and none needed: free-standing build.
            tracing::debug!(error = %err, "building outside an environment");
            BinaryPackageBuilder::new(&recipe)
                .verbose(verbose)
                .build(dest, None)?
        }
        Err(err) => return Err(err),
    };

    for archive in archives {
        println!("Package in: {}", archive.display());
    }

    Ok(())
}
