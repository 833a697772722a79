//! One module per subcommand.

/// `xpkg build` -- build a recipe into archives.
pub mod build;
/// `xpkg info` -- describe packages, archives, and files.
pub mod info;
/// `xpkg init` -- create an environment.
pub mod init;
/// `xpkg install` -- install packages.
pub mod install;
/// `xpkg jump` -- run a program inside the environment.
pub mod jump;
/// `xpkg list` -- list installed packages.
pub mod list;
/// `xpkg remove` -- remove installed packages.
pub mod remove;

use std::path::PathBuf;

use anyhow::Result;
use xpkg_core::env::{EnvOptions, Environment};

/// Open the environment for `root`, falling back to `XPKG_ROOT`.
pub(crate) fn open_env(root: Option<PathBuf>, options: EnvOptions) -> Result<Environment> {
    Ok(Environment::open(root, options)?)
}
