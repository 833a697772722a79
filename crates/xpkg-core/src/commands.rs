//! Command execution for recipe builds.
//!
//! Recipes express work as shell strings and structured built-in
//! invocations. Both run against a [`BuildEnv`]: an owned snapshot of
//! environment variables that is composed up front and handed to every
//! spawned process. The process's own environment is never mutated, so
//! "apply" and "restore" are paired by ownership -- dropping the map is the
//! restore.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{IoContext, Result, XpkgError};

/// Error from `%(name)s` substitution.
#[derive(Debug, thiserror::Error)]
pub enum SubstError {
    /// The template referenced a variable that is not defined.
    #[error("unknown substitution variable: {0}")]
    UnknownVar(String),

    /// A `%(`...`)s` group was left unclosed.
    #[error("unterminated substitution in: {0}")]
    Unterminated(String),
}

/// Interpolate `%(name)s` references in `text` from `subs`.
///
/// `%%` escapes a literal percent sign. Referencing an undefined variable
/// is an error rather than a silent pass-through, because a command line
/// with a half-substituted path is far worse than a failed build.
///
/// # Errors
///
/// Returns [`SubstError`] on unknown variables or malformed templates.
pub fn interp(text: &str, subs: &BTreeMap<String, String>) -> std::result::Result<String, SubstError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(stripped) = rest.strip_prefix('%') {
            out.push('%');
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('(') {
            let end = stripped
                .find(")s")
                .ok_or_else(|| SubstError::Unterminated(text.to_string()))?;
            let name = &stripped[..end];
            let value = subs
                .get(name)
                .ok_or_else(|| SubstError::UnknownVar(name.to_string()))?;
            out.push_str(value);
            rest = &stripped[end + 2..];
        } else {
            out.push('%');
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// An owned set of environment variables for spawned build commands.
///
/// Commands run with exactly these variables (`env_clear` + `envs`), so two
/// builds never leak state into each other through the process
/// environment.
#[derive(Debug, Clone, Default)]
pub struct BuildEnv {
    vars: BTreeMap<String, String>,
}

impl BuildEnv {
    /// Snapshot the current process environment.
    pub fn snapshot() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// An empty environment (isolation mode).
    pub fn empty() -> Self {
        Self::default()
    }

    /// The value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Set `name` outright.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Remove `name`.
    pub fn remove(&mut self, name: &str) {
        self.vars.remove(name);
    }

    /// Append `value` to `name`, joining with `sep` when already set.
    pub fn append(&mut self, name: &str, value: &str, sep: &str) {
        match self.vars.get_mut(name) {
            Some(existing) if !existing.is_empty() => {
                existing.push_str(sep);
                existing.push_str(value);
            }
            _ => {
                self.vars.insert(name.to_string(), value.to_string());
            }
        }
    }

    /// Prepend `value` to `name`, joining with `sep` when already set.
    pub fn prepend(&mut self, name: &str, value: &str, sep: &str) {
        let new = match self.vars.get(name) {
            Some(existing) if !existing.is_empty() => format!("{value}{sep}{existing}"),
            _ => value.to_string(),
        };
        self.vars.insert(name.to_string(), new);
    }

    /// Keep only the variables whose names are in `keep`.
    pub fn retain_only(&mut self, keep: &[&str]) {
        self.vars.retain(|name, _| keep.contains(&name.as_str()));
    }

    /// Iterate all `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Configure `cmd` to run with exactly this environment.
    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(&self.vars);
    }
}

/// Where command output goes: a build log file or the caller's terminal.
#[derive(Debug)]
pub enum CommandOutput {
    /// Append to the given log file.
    Log(File),
    /// Inherit stdout/stderr (verbose builds).
    Inherit,
}

impl CommandOutput {
    /// Note the command line about to run, the way the log reads later.
    fn echo(&mut self, cmd: &str) -> std::io::Result<()> {
        match self {
            Self::Log(file) => writeln!(file, "[cmd] {cmd}"),
            Self::Inherit => {
                println!("[cmd] {cmd}");
                Ok(())
            }
        }
    }

    fn stdio(&self) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            Self::Log(file) => {
                let out = file.try_clone()?;
                let err = file.try_clone()?;
                Ok((Stdio::from(out), Stdio::from(err)))
            }
            Self::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
        }
    }
}

/// Run one shell command via `sh -c` in `cwd` under `env`.
///
/// # Errors
///
/// Returns [`XpkgError::BuildFailed`] when the command exits non-zero and
/// [`XpkgError::Io`] when it cannot be spawned.
pub fn run_shell(
    cmd_line: &str,
    cwd: &Path,
    env: &BuildEnv,
    output: &mut CommandOutput,
) -> Result<()> {
    output.echo(cmd_line).io_at(cwd)?;
    let (stdout, stderr) = output.stdio().io_at(cwd)?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(cmd_line)
        .current_dir(cwd)
        .stdout(stdout)
        .stderr(stderr);
    env.apply_to(&mut cmd);

    let status = cmd.status().io_at(cwd)?;
    if !status.success() {
        return Err(XpkgError::BuildFailed(format!(
            "command exited with {status}: {cmd_line}"
        )));
    }

    Ok(())
}

/// Run a structured built-in command.
///
/// Supported operations:
///
/// * `symlink(src, link)` -- create a symbolic link;
/// * `patchelf(interp[, path])` -- delegate to the `patchelf` tool to set an
///   ELF program interpreter;
/// * `full_binary_str_replace(file, old, new)` -- length-preserving in-place
///   replacement, NUL-padding the shorter replacement.
///
/// # Errors
///
/// Returns [`XpkgError::BadRecipe`] for unknown operations or wrong
/// arities, and [`XpkgError::BuildFailed`] / [`XpkgError::Io`] when the
/// operation itself fails.
pub fn run_builtin(name: &str, args: &[&str], cwd: &Path) -> Result<()> {
    debug!(builtin = name, ?args, cwd = %cwd.display(), "running built-in");

    match name {
        "symlink" => {
            let [src, link] = args else {
                return Err(bad_arity("symlink", "src, link", args));
            };
            let link_path = resolve(cwd, link);
            std::os::unix::fs::symlink(src, &link_path).io_at(link_path)
        }

        "patchelf" => {
            let (interp, target) = match args {
                [interp] => (*interp, None),
                [interp, path] => (*interp, Some(*path)),
                _ => return Err(bad_arity("patchelf", "interp[, path]", args)),
            };

            let mut cmd = Command::new("patchelf");
            cmd.arg("--set-interpreter").arg(interp);
            if let Some(path) = target {
                cmd.arg(resolve(cwd, path));
            }
            cmd.current_dir(cwd);

            let status = cmd.status().io_at(cwd)?;
            if status.success() {
                Ok(())
            } else {
                Err(XpkgError::BuildFailed(format!(
                    "patchelf exited with {status}"
                )))
            }
        }

        "full_binary_str_replace" => {
            let [file, old, new] = args else {
                return Err(bad_arity("full_binary_str_replace", "file, old, new", args));
            };
            binary_str_replace(&resolve(cwd, file), old.as_bytes(), new.as_bytes())
        }

        other => Err(XpkgError::BadRecipe(format!(
            "{other} is not a built-in command"
        ))),
    }
}

fn bad_arity(name: &str, want: &str, got: &[&str]) -> XpkgError {
    XpkgError::BadRecipe(format!(
        "built-in {name} expects ({want}), got {} arguments",
        got.len()
    ))
}

fn resolve(cwd: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

/// Replace every occurrence of `old` in `path` with `new`, NUL-padded to
/// keep the file length unchanged.
fn binary_str_replace(path: &Path, old: &[u8], new: &[u8]) -> Result<()> {
    if new.len() > old.len() {
        return Err(XpkgError::Relocation(format!(
            "replacement longer than original ({} > {} bytes) in {}",
            new.len(),
            old.len(),
            path.display()
        )));
    }

    let mut contents = std::fs::read(path).io_at(path)?;
    let original_len = contents.len();

    let mut padded = new.to_vec();
    padded.resize(old.len(), 0);

    let mut at = 0;
    while let Some(pos) = find_from(&contents, old, at) {
        contents[pos..pos + old.len()].copy_from_slice(&padded);
        at = pos + old.len();
    }

    debug_assert_eq!(contents.len(), original_len);
    std::fs::write(path, contents).io_at(path)
}

/// Find `needle` in `haystack` at or after `from`.
pub(crate) fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| from + pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn interp_substitutes_and_escapes() {
        let subs = subs(&[("prefix", "/env"), ("jobs", "4")]);
        assert_eq!(
            interp("./configure --prefix=%(prefix)s -j%(jobs)s", &subs).unwrap(),
            "./configure --prefix=/env -j4"
        );
        assert_eq!(interp("100%% done", &subs).unwrap(), "100% done");
    }

    #[test]
    fn interp_rejects_unknown_vars() {
        let err = interp("rm -rf %(env_root)s", &subs(&[])).unwrap_err();
        assert!(matches!(err, SubstError::UnknownVar(v) if v == "env_root"));
    }

    #[test]
    fn build_env_append_prepend() {
        let mut env = BuildEnv::empty();
        env.set("PATH", "/usr/bin");
        env.prepend("PATH", "/env/bin", ":");
        assert_eq!(env.get("PATH"), Some("/env/bin:/usr/bin"));

        env.append("CFLAGS", "-I/env/include", " ");
        assert_eq!(env.get("CFLAGS"), Some("-I/env/include"));
        env.append("CFLAGS", "-O2", " ");
        assert_eq!(env.get("CFLAGS"), Some("-I/env/include -O2"));
    }

    #[test]
    fn build_env_isolation() {
        let mut env = BuildEnv::snapshot();
        env.set("DISPLAY", ":0");
        env.set("SECRET", "hunter2");
        env.retain_only(&["DISPLAY"]);
        assert_eq!(env.get("DISPLAY"), Some(":0"));
        assert_eq!(env.get("SECRET"), None);
    }

    #[test]
    fn shell_commands_run_with_the_given_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BuildEnv::empty();
        env.set("PATH", "/usr/bin:/bin");
        env.set("GREETING", "hello");

        run_shell(
            "printf '%s' \"$GREETING\" > out.txt",
            dir.path(),
            &env,
            &mut CommandOutput::Inherit,
        )
        .unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello");
    }

    #[test]
    fn failing_shell_command_is_build_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BuildEnv::empty();
        env.set("PATH", "/usr/bin:/bin");

        let err = run_shell("exit 3", dir.path(), &env, &mut CommandOutput::Inherit).unwrap_err();
        assert!(matches!(err, XpkgError::BuildFailed(_)));
    }

    #[test]
    fn symlink_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target.txt"), b"x").unwrap();

        run_builtin("symlink", &["target.txt", "link.txt"], dir.path()).unwrap();
        assert_eq!(
            std::fs::read_link(dir.path().join("link.txt")).unwrap(),
            Path::new("target.txt")
        );
    }

    #[test]
    fn unknown_builtin_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_builtin("frobnicate", &[], dir.path()).unwrap_err();
        assert!(matches!(err, XpkgError::BadRecipe(_)));
    }

    #[test]
    fn binary_replace_preserves_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"pre/old/prefix/path\0tail/old/prefix!").unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        run_builtin(
            "full_binary_str_replace",
            &["blob", "/old/prefix", "/new"],
            dir.path(),
        )
        .unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len() as u64, before);
        assert!(find_from(&contents, b"/old/prefix", 0).is_none());
        assert_eq!(&contents[3..7], b"/new");

        // A longer replacement must refuse to run.
        let err = run_builtin(
            "full_binary_str_replace",
            &["blob", "/new", "/much/longer/replacement"],
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, XpkgError::Relocation(_)));
    }
}
