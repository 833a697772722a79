//! Describe packages, archives, and files.

use std::path::PathBuf;

use anyhow::Result;
use xpkg_core::Info;

/// Print what is known about `name`, or about the environment itself.
///
/// # Errors
///
/// Fails when the queried package is not installed.
pub fn info(root: Option<PathBuf>, name: Option<&str>) -> Result<()> {
    let env = super::open_env(root, Default::default())?;

    let Some(name) = name else {
        let installed = env.database().iter_packages().count();
        println!("Environment: {}", env.settings().name);
        println!("Prefix:      {}", env.prefix().display());
        println!("Toolset:     {}", env.settings().toolset.name);
        println!("Packages:    {installed}");
        return Ok(());
    };

    match env.info(name)? {
        Info::Installed(manifest) | Info::Archive(manifest) => {
            println!("Name:         {}", manifest.name);
            println!("Version:      {}", manifest.version);
            if !manifest.description.is_empty() {
                println!("Description:  {}", manifest.description);
            }
            if !manifest.dependencies.is_empty() {
                let deps: Vec<String> = manifest
                    .dependencies
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                println!("Dependencies: {}", deps.join(", "));
            }
            println!("Files:        {}", manifest.files.len());
        }
        Info::Owner { path, package } => match package {
            Some(package) => println!("{path}: owned by {package}"),
            None => println!("{path}: not owned by any package"),
        },
    }

    Ok(())
}
