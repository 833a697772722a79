//! The relocator: installs an archive into a prefix it was not built in.
//!
//! Extraction streams the payload into the target prefix; the rewrite then
//! walks the offset table and replaces every recorded embedding of the
//! build prefix with the target prefix. Text rewrites may change a file's
//! length. Binary rewrites never do: a complete C string is swapped for the
//! NUL-padded target, and a substring occurrence is rewritten inside its
//! `[first_offset, null_offset)` window with NUL padding to the original
//! window length. A target prefix longer than the build prefix is refused
//! outright.
//!
//! The rewrite is not atomic: a length-check failure aborts mid-way and
//! leaves the prefix partially rewritten. Callers treat install as
//! transactional at the environment level.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};
use xpkg_schema::PathOffsets;

use crate::archive::Xpa;
use crate::commands::find_from;
use crate::error::{IoContext, Result, XpkgError};

/// Extract `xpa` into `target` and rewrite every recorded prefix offset.
///
/// # Errors
///
/// Returns [`XpkgError::Relocation`] when the target prefix is longer than
/// the build prefix or a length check fails, [`XpkgError::Integrity`] when
/// the payload disagrees with the manifest, and [`XpkgError::Io`] on
/// filesystem failure.
pub fn install_archive(xpa: &Xpa, target: &Path) -> Result<()> {
    info!(
        package = xpa.manifest().name,
        version = xpa.manifest().version,
        target = %target.display(),
        "installing archive"
    );

    xpa.extract_into(target)?;
    rewrite_offsets(&xpa.manifest().install_path_offsets, target)
}

/// Apply the offset table to an already-extracted tree at `target`.
///
/// # Errors
///
/// See [`install_archive`].
pub fn rewrite_offsets(offsets: &PathOffsets, target: &Path) -> Result<()> {
    if offsets.is_empty() {
        return Ok(());
    }

    let old = offsets.install_dir.as_bytes().to_vec();
    let new = target
        .to_str()
        .ok_or_else(|| {
            XpkgError::Relocation(format!(
                "target prefix is not valid UTF-8: {}",
                target.display()
            ))
        })?
        .as_bytes()
        .to_vec();

    if new.len() > old.len() {
        return Err(XpkgError::Relocation(format!(
            "target prefix {} ({} bytes) exceeds the build prefix length limit of {} bytes",
            target.display(),
            new.len(),
            old.len()
        )));
    }

    for rel in offsets.text_files.keys() {
        rewrite_file(target, rel, |contents| {
            Ok(replace_all(&contents, &old, &new))
        })?;
    }

    // `old\0` swapped for `new` plus NUL padding: same byte count.
    let mut old_terminated = old.clone();
    old_terminated.push(0);
    let mut new_padded = new.clone();
    new_padded.resize(old_terminated.len(), 0);

    for (rel, file_offsets) in &offsets.binary_files {
        rewrite_file(target, rel, |mut contents| {
            for &offset in file_offsets {
                let start = offset as usize;
                let end = start + old_terminated.len();

                let window = contents.get(start..end).ok_or_else(|| {
                    length_violation(rel, "offset beyond end of file")
                })?;
                if window != old_terminated.as_slice() {
                    return Err(length_violation(rel, "recorded offset does not hold the build prefix"));
                }

                contents[start..end].copy_from_slice(&new_padded);
            }
            Ok(contents)
        })?;
    }

    for (rel, groups) in &offsets.sub_binary_files {
        rewrite_file(target, rel, |mut contents| {
            for group in groups {
                let (Some(&first), Some(&null_off)) = (group.first(), group.last()) else {
                    continue;
                };

                let start = first as usize;
                let end = null_off as usize;
                let window = contents.get(start..end).ok_or_else(|| {
                    length_violation(rel, "substring window beyond end of file")
                })?;

                let mut replaced = replace_all(window, &old, &new);
                if replaced.len() > window.len() {
                    return Err(length_violation(rel, "substring rewrite grew its window"));
                }
                replaced.resize(end - start, 0);

                contents[start..end].copy_from_slice(&replaced);
            }
            Ok(contents)
        })?;
    }

    for rel in &offsets.recompile_files {
        recompile(target, rel);
    }

    Ok(())
}

fn length_violation(rel: &str, what: &str) -> XpkgError {
    XpkgError::Relocation(format!("{what} in {rel}"))
}

/// Read, transform, and write back one file, temporarily granting
/// user-write permission when the installed mode lacks it.
fn rewrite_file(
    target: &Path,
    rel: &str,
    transform: impl FnOnce(Vec<u8>) -> Result<Vec<u8>>,
) -> Result<()> {
    let path = target.join(rel);
    debug!(file = rel, "rewriting install path");

    let contents = fs::read(&path).io_at(&path)?;
    let permissions = fs::metadata(&path).io_at(&path)?.permissions();
    let user_writable = permissions.mode() & 0o200 != 0;

    if !user_writable {
        let mut writable = permissions.clone();
        writable.set_mode(permissions.mode() | 0o200);
        fs::set_permissions(&path, writable).io_at(&path)?;
    }

    let result =
        transform(contents).and_then(|rewritten| fs::write(&path, rewritten).io_at(&path));

    if !user_writable {
        // Restore the original mode even when the rewrite failed.
        if let Err(e) = fs::set_permissions(&path, permissions) {
            warn!(file = rel, error = %e, "could not restore file mode");
        }
    }

    result
}

/// Replace every occurrence of `old` in `haystack` with `new`.
fn replace_all(haystack: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut at = 0;

    while let Some(pos) = find_from(haystack, old, at) {
        out.extend_from_slice(&haystack[at..pos]);
        out.extend_from_slice(new);
        at = pos + old.len();
    }

    out.extend_from_slice(&haystack[at..]);
    out
}

/// Regenerate one bytecode file from its adjacent source.
///
/// Failure here is never fatal: the package works without the bytecode,
/// which the interpreter will regenerate on first import anyway.
fn recompile(target: &Path, rel: &str) {
    let compiled = target.join(rel);
    let source = compiled.with_extension("py");

    if !source.exists() {
        warn!(file = rel, "no source next to bytecode, leaving stale copy");
        return;
    }

    let status = Command::new("python3")
        .arg("-c")
        .arg("import py_compile, sys; py_compile.compile(sys.argv[1], cfile=sys.argv[2], doraise=True)")
        .arg(&source)
        .arg(&compiled)
        .status();

    match status {
        Ok(status) if status.success() => {
            debug!(file = rel, "recompiled bytecode for new prefix");
        }
        Ok(status) => {
            warn!(file = rel, %status, "bytecode recompilation failed");
        }
        Err(e) => {
            warn!(file = rel, error = %e, "could not run python3 to recompile bytecode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use crate::scanner::find_path_offsets;

    /// A tree built under a long opaque prefix (as the builder arranges),
    /// scanned by the real scanner, then copied to a shorter target the way
    /// extraction would lay it out. Tests cover the scanner/relocator
    /// contract end to end.
    struct Fixture {
        _tmp: tempfile::TempDir,
        build: PathBuf,
        target: PathBuf,
        files: BTreeSet<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let build = tmp.path().join("install-0123456789abcdef0123456789abcdef");
            let target = tmp.path().join("t");
            for root in [&build, &target] {
                fs::create_dir_all(root.join("bin")).unwrap();
                fs::create_dir_all(root.join("share")).unwrap();
            }
            Self {
                _tmp: tmp,
                build,
                target,
                files: BTreeSet::new(),
            }
        }

        fn prefix(&self) -> Vec<u8> {
            self.build.to_str().unwrap().as_bytes().to_vec()
        }

        fn add(&mut self, rel: &str, contents: &[u8]) {
            fs::write(self.build.join(rel), contents).unwrap();
            self.files.insert(rel.to_string());
        }

        /// Scan the build tree, copy it to the target, and return the table.
        fn stage(&self) -> PathOffsets {
            let offsets = find_path_offsets(&self.build, &self.files).unwrap();
            for rel in &self.files {
                fs::copy(self.build.join(rel), self.target.join(rel)).unwrap();
            }
            offsets
        }
    }

    #[test]
    fn text_rewrite_replaces_every_occurrence() {
        let mut fx = Fixture::new();
        let prefix = fx.prefix();

        let mut text = b"root=".to_vec();
        text.extend_from_slice(&prefix);
        text.extend_from_slice(b"\ndata=");
        text.extend_from_slice(&prefix);
        text.extend_from_slice(b"/share\n");
        fx.add("share/conf.txt", &text);

        let offsets = fx.stage();
        rewrite_offsets(&offsets, &fx.target).unwrap();

        let rewritten = fs::read_to_string(fx.target.join("share/conf.txt")).unwrap();
        assert!(!rewritten.contains(&offsets.install_dir));
        assert!(rewritten.contains(&format!("root={}\n", fx.target.display())));
        assert!(rewritten.contains(&format!("data={}/share\n", fx.target.display())));
    }

    #[test]
    fn binary_rewrite_is_length_preserving() {
        let mut fx = Fixture::new();
        let prefix = fx.prefix();

        // "<code>\0<prefix>\0<code><prefix>/greet\0"
        let mut blob = b"ELF\x7f\0".to_vec();
        blob.extend_from_slice(&prefix);
        blob.push(0);
        blob.extend_from_slice(b"code");
        blob.extend_from_slice(&prefix);
        blob.extend_from_slice(b"/greet");
        blob.push(0);
        fx.add("bin/greeter", &blob);

        let offsets = fx.stage();
        let before_len = fs::metadata(fx.target.join("bin/greeter")).unwrap().len();
        rewrite_offsets(&offsets, &fx.target).unwrap();
        let contents = fs::read(fx.target.join("bin/greeter")).unwrap();

        assert_eq!(contents.len() as u64, before_len);
        assert!(find_from(&contents, offsets.install_dir.as_bytes(), 0).is_none());

        // The exact C string became "<target>\0...".
        let mut exact = fx.target.to_str().unwrap().as_bytes().to_vec();
        exact.push(0);
        assert!(find_from(&contents, &exact, 0).is_some());

        // The substring occurrence still reads "<target>/greet" as a C string.
        let mut wanted = fx.target.to_str().unwrap().as_bytes().to_vec();
        wanted.extend_from_slice(b"/greet\0");
        assert!(find_from(&contents, &wanted, 0).is_some());
    }

    #[test]
    fn longer_target_prefix_is_refused() {
        let mut fx = Fixture::new();
        let prefix = fx.prefix();

        let mut blob = vec![0u8];
        blob.extend_from_slice(&prefix);
        blob.push(0);
        fx.add("bin/tool", &blob);

        let offsets = fx.stage();
        let long_target = format!("{}/and-then-some", offsets.install_dir);
        let err = rewrite_offsets(&offsets, Path::new(&long_target)).unwrap_err();
        assert!(matches!(err, XpkgError::Relocation(_)));
    }

    #[test]
    fn corrupted_offsets_fail_the_rewrite() {
        let mut fx = Fixture::new();
        let prefix = fx.prefix();

        let mut blob = vec![0u8];
        blob.extend_from_slice(&prefix);
        blob.push(0);
        fx.add("bin/tool", &blob);

        let mut offsets = fx.stage();

        // Shift the recorded offset: the window no longer holds the prefix.
        for offs in offsets.binary_files.values_mut() {
            for o in offs.iter_mut() {
                *o += 1;
            }
        }

        let err = rewrite_offsets(&offsets, &fx.target).unwrap_err();
        assert!(matches!(err, XpkgError::Relocation(_)));
    }

    #[test]
    fn read_only_files_are_rewritten_and_mode_restored() {
        let mut fx = Fixture::new();
        let prefix = fx.prefix();

        let mut text = prefix.clone();
        text.extend_from_slice(b"/doc\n");
        fx.add("share/doc.txt", &text);

        let offsets = fx.stage();
        let path = fx.target.join("share/doc.txt");

        let mut mode = fs::metadata(&path).unwrap().permissions();
        mode.set_mode(0o444);
        fs::set_permissions(&path, mode).unwrap();

        rewrite_offsets(&offsets, &fx.target).unwrap();

        assert!(!fs::read_to_string(&path).unwrap().contains(&offsets.install_dir));
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o444);
    }

    #[test]
    fn empty_offset_table_is_a_no_op() {
        let fx = Fixture::new();
        let offsets = PathOffsets::new("/anything");
        rewrite_offsets(&offsets, &fx.target).unwrap();
    }
}
