//! Run a program inside the activated environment.

use std::path::PathBuf;

use anyhow::Result;

/// Replace this process with `command` run inside the environment.
///
/// Only returns when the program cannot be executed.
///
/// # Errors
///
/// Fails when the environment cannot be opened or exec fails.
pub fn jump(root: Option<PathBuf>, command: &str) -> Result<()> {
    let env = super::open_env(root, Default::default())?;

    // Shell-style splitting: the first word is the program.
    let mut parts = command.split_whitespace();
    let program = parts.next().unwrap_or("bash");
    let args: Vec<String> = parts.map(ToString::to_string).collect();

    match env.jump(program, &args) {
        Ok(never) => match never {},
        Err(e) => Err(e.into()),
    }
}
