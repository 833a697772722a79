//! Command-line interface definition for `xpkg`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Per-command implementations.
pub mod cmd;

/// An isolated, relocatable package environment manager.
#[derive(Debug, Parser)]
#[command(name = "xpkg", version, about)]
pub struct Cli {
    /// Environment prefix to operate on.
    #[arg(long, global = true, env = "XPKG_ROOT")]
    pub root: Option<PathBuf>,

    /// Print build commands and their output to the terminal.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Commands,
}

/// The `xpkg` subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a new environment at a prefix.
    Init {
        /// Directory to root the environment at.
        prefix: PathBuf,

        /// Human-readable environment name.
        name: String,

        /// Toolset to build with (`local` or `GNU`).
        #[arg(long)]
        toolset: Option<String>,
    },

    /// Install packages (names, `.xpd` recipes, or `.xpa` archives).
    Install {
        /// Package specs: `NAME`, `NAME==VERSION`, or a file path.
        #[arg(required = true)]
        names: Vec<String>,

        /// Recipe tree directories (colon list also read from XPKG_TREE).
        #[arg(long)]
        tree: Option<PathBuf>,

        /// Archive repo directories (colon list also read from XPKG_REPO).
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Remove installed packages.
    Remove {
        /// Packages to remove.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Build a recipe into binary archives.
    Build {
        /// Path to the `.xpd` recipe.
        path: PathBuf,

        /// Where to place the archives (default: current directory).
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },

    /// Describe a package, archive, or file.
    Info {
        /// Package name, `.xpa` path, or a path inside the prefix.
        name: Option<String>,
    },

    /// List installed packages.
    List,

    /// Run a program (default: a shell) inside the environment.
    Jump {
        /// Program and arguments to run.
        #[arg(long, default_value = "bash")]
        command: String,
    },
}
