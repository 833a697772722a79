//! xpkg - an isolated, relocatable package environment manager.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xpkg_cli::{Cli, Commands, cmd};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            prefix,
            name,
            toolset,
        } => cmd::init::init(&prefix, &name, toolset.as_deref()),
        Commands::Install { names, tree, repo } => {
            cmd::install::install(cli.root, &names, tree, repo, cli.verbose)
        }
        Commands::Remove { names } => cmd::remove::remove(cli.root, &names),
        Commands::Build { path, dest } => cmd::build::build(cli.root, &path, &dest, cli.verbose),
        Commands::Info { name } => cmd::info::info(cli.root, name.as_deref()),
        Commands::List => cmd::list::list(cli.root),
        Commands::Jump { command } => cmd::jump::jump(cli.root, &command),
    }
}
