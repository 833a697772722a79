//! The path-offset finder: records where the build prefix landed.
//!
//! After a build installs into its working prefix, every produced file is
//! scanned for embedded copies of the absolute prefix string. The resulting
//! offset table is what makes an archive relocatable: at install time the
//! exact bytes are rewritten to the target prefix without rebuilding.
//!
//! Classification is byte-oriented. A file containing no NUL byte is text;
//! its occurrences may be rewritten with a plain (length-changing)
//! replacement. A file with NULs is binary; each occurrence is either a
//! complete C string (`prefix\0`) or a prefix of a longer C string, and in
//! both cases the rewrite must preserve the file length. UTF-16/32 payloads
//! are not understood and their occurrences will be missed.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::debug;
use xpkg_schema::PathOffsets;

use crate::commands::find_from;
use crate::error::{IoContext, Result, XpkgError};

/// Extensions whose files are regenerated at install time instead of byte
/// patched (compiled bytecode embeds its source path in a form byte
/// patching cannot fix up reliably).
pub const RECOMPILE_EXTENSIONS: &[&str] = &["pyc"];

/// Scan `files` (paths relative to `install_dir`) for occurrences of the
/// prefix and build the offset table.
///
/// Hard-linked duplicates are scanned once (keyed by inode); symlinks and
/// directories are skipped. Input files are never modified.
///
/// # Errors
///
/// Returns [`XpkgError::Io`] when a file cannot be read and
/// [`XpkgError::BadRecipe`] when the prefix is not valid UTF-8.
pub fn find_path_offsets(install_dir: &Path, files: &BTreeSet<String>) -> Result<PathOffsets> {
    let prefix_str = install_dir.to_str().ok_or_else(|| {
        XpkgError::BadRecipe(format!(
            "install prefix is not valid UTF-8: {}",
            install_dir.display()
        ))
    })?;
    let prefix = prefix_str.as_bytes();

    let mut table = PathOffsets::new(prefix_str);
    let mut seen_inodes: HashSet<u64> = HashSet::new();

    for rel in files {
        let full = install_dir.join(rel);

        let Ok(meta) = full.symlink_metadata() else {
            continue;
        };
        if !meta.file_type().is_file() {
            continue;
        }

        // Hard links share content; scan each inode once.
        if !seen_inodes.insert(meta.ino()) {
            continue;
        }

        let contents = fs::read(&full).io_at(&full)?;
        let offsets = occurrences(&contents, prefix);
        if offsets.is_empty() {
            continue;
        }

        if has_recompile_extension(rel) {
            debug!(file = rel, "recorded for recompile on install");
            table.recompile_files.push(rel.clone());
            continue;
        }

        let nul_count = contents.iter().filter(|b| **b == 0).count();
        if nul_count == 0 {
            table.text_files.insert(rel.clone(), offsets);
        } else {
            classify_binary(&mut table, rel, &contents, prefix, &offsets);
        }
    }

    Ok(table)
}

/// Whether `rel` names a file the installer regenerates instead of patching.
pub fn has_recompile_extension(rel: &str) -> bool {
    Path::new(rel)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| RECOMPILE_EXTENSIONS.contains(&ext))
}

/// Every offset at which `needle` occurs in `haystack`.
///
/// Overlap is impossible in practice: the needle is an absolute path, so it
/// starts with `/` and is far longer than one byte.
fn occurrences(haystack: &[u8], needle: &[u8]) -> Vec<u64> {
    let mut offsets = Vec::new();
    let mut at = 0;

    while let Some(pos) = find_from(haystack, needle, at) {
        offsets.push(pos as u64);
        at = pos + needle.len();
    }

    offsets
}

/// Split a binary file's occurrences into exactly-terminated strings and
/// substring groups sharing a terminator.
fn classify_binary(
    table: &mut PathOffsets,
    rel: &str,
    contents: &[u8],
    prefix: &[u8],
    offsets: &[u64],
) {
    let mut binary_offsets: Vec<u64> = Vec::new();
    let mut groups: Vec<Vec<u64>> = Vec::new();

    for &offset in offsets {
        let string_end = offset as usize + prefix.len();

        // A run with no terminator extends to the end of the file; using the
        // file length as the shared terminator keeps the install-time splice
        // length-preserving.
        let null_off = contents[string_end..]
            .iter()
            .position(|b| *b == 0)
            .map_or(contents.len() as u64, |pos| (string_end + pos) as u64);

        if null_off == string_end as u64 {
            binary_offsets.push(offset);
        } else if let Some(group) = groups
            .last_mut()
            .filter(|group| group.last() == Some(&null_off))
        {
            // Same terminator as the previous occurrence: one longer string
            // embedding the prefix several times.
            let end = group.len() - 1;
            group.insert(end, offset);
        } else {
            groups.push(vec![offset, null_off]);
        }
    }

    if !binary_offsets.is_empty() {
        table.binary_files.insert(rel.to_string(), binary_offsets);
    }
    if !groups.is_empty() {
        table.sub_binary_files.insert(rel.to_string(), groups);
    }
}
