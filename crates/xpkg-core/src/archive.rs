//! Reading and writing binary package archives (XPA files).
//!
//! An XPA is an uncompressed POSIX tar with exactly two members, in order:
//!
//! 1. `xpkg.yml` -- the YAML manifest (name, version, dependencies, owned
//!    files and dirs, and the install-path offset table);
//! 2. `files.tar.gz` -- a gzip-compressed tar of the package files, each
//!    path relative to the install prefix.
//!
//! Opening an archive reads only the manifest; the payload is streamed when
//! the archive is installed. A written archive is immutable.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use xpkg_schema::Manifest;

use crate::error::{IoContext, Result, XpkgError};

/// Name of the manifest member inside the outer tar.
pub const MANIFEST_MEMBER: &str = "xpkg.yml";

/// Name of the payload member inside the outer tar.
pub const PAYLOAD_MEMBER: &str = "files.tar.gz";

/// A package archive on disk with its manifest parsed.
#[derive(Debug, Clone)]
pub struct Xpa {
    path: PathBuf,
    manifest: Manifest,
}

impl Xpa {
    /// Open an archive, eagerly reading only the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`] if the file is absent and
    /// [`XpkgError::BadRecipe`] if the container or manifest is malformed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(XpkgError::NotFound(format!(
                "archive does not exist: {}",
                path.display()
            )));
        }

        let manifest = read_manifest(&path)?;
        Ok(Self { path, manifest })
    }

    /// An already-parsed manifest paired with its archive path (used by the
    /// repo index, which caches manifests).
    pub fn with_manifest(path: impl Into<PathBuf>, manifest: Manifest) -> Self {
        Self {
            path: path.into(),
            manifest,
        }
    }

    /// The archive file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Stream the payload into `dest`, creating owned directories and
    /// verifying that every manifest file actually landed.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::BadRecipe`] if the payload member is missing and
    /// [`XpkgError::Integrity`] if the manifest names a file the payload
    /// does not contain.
    pub fn extract_into(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).io_at(dest)?;

        let file = File::open(&self.path).io_at(&self.path)?;
        let mut outer = tar::Archive::new(BufReader::new(file));

        let mut extracted = false;
        for entry in outer.entries().io_at(&self.path)? {
            let entry = entry.io_at(&self.path)?;
            if entry_name(&entry)?.as_deref() == Some(PAYLOAD_MEMBER) {
                let mut inner = tar::Archive::new(GzDecoder::new(entry));
                inner.set_preserve_permissions(true);
                inner.unpack(dest).io_at(dest)?;
                extracted = true;
                break;
            }
        }

        if !extracted {
            return Err(XpkgError::BadRecipe(format!(
                "archive {} has no {PAYLOAD_MEMBER} member",
                self.path.display()
            )));
        }

        // Owned directories that carry no files still belong to the package.
        for dir in &self.manifest.dirs {
            fs::create_dir_all(dest.join(dir)).io_at(dest.join(dir))?;
        }

        for rel in &self.manifest.files {
            let path = dest.join(rel);
            if path.symlink_metadata().is_err() {
                return Err(XpkgError::Integrity(format!(
                    "manifest of {} lists {rel} but the payload does not contain it",
                    self.manifest.name
                )));
            }
        }

        Ok(())
    }
}

/// Read just the manifest member out of an archive.
///
/// # Errors
///
/// Returns [`XpkgError::BadRecipe`] when the container is not a tar, the
/// manifest member is missing, or the YAML does not parse.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let file = File::open(path).io_at(path)?;
    let mut outer = tar::Archive::new(BufReader::new(file));

    for entry in outer.entries().io_at(path)? {
        let entry = entry.io_at(path)?;
        if entry_name(&entry)?.as_deref() == Some(MANIFEST_MEMBER) {
            return serde_yaml::from_reader(entry).map_err(|e| {
                XpkgError::BadRecipe(format!(
                    "bad manifest in {}: {e}",
                    path.display()
                ))
            });
        }
    }

    Err(XpkgError::BadRecipe(format!(
        "archive {} has no {MANIFEST_MEMBER} member",
        path.display()
    )))
}

/// Write an archive for `manifest`, taking file contents from
/// `install_root` (the build prefix the manifest paths are relative to).
///
/// The payload is staged next to `xpa_path` and the finished archive
/// renamed into place, so a crash never leaves a half-written `.xpa`
/// visible.
///
/// # Errors
///
/// Returns [`XpkgError::Io`] on any filesystem failure.
pub fn write(xpa_path: &Path, manifest: &Manifest, install_root: &Path) -> Result<()> {
    let stage_dir = xpa_path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(stage_dir).io_at(stage_dir)?;

    // Inner payload first; the outer tar needs its final size up front.
    let payload = tempfile::Builder::new()
        .prefix(".files-")
        .suffix(".tar.gz")
        .tempfile_in(stage_dir)
        .io_at(stage_dir)?;

    {
        let encoder = GzEncoder::new(payload.as_file(), Compression::default());
        let mut inner = tar::Builder::new(encoder);
        inner.follow_symlinks(false);

        for rel in &manifest.files {
            let full = install_root.join(rel);
            inner.append_path_with_name(&full, rel).io_at(&full)?;
        }

        inner
            .into_inner()
            .and_then(GzEncoder::finish)
            .io_at(payload.path())?;
    }

    let manifest_yaml = serde_yaml::to_string(manifest)
        .map_err(|e| XpkgError::BadRecipe(format!("unserialisable manifest: {e}")))?;

    let staged = tempfile::Builder::new()
        .prefix(".xpa-")
        .tempfile_in(stage_dir)
        .io_at(stage_dir)?;

    {
        let mut outer = tar::Builder::new(staged.as_file());

        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_yaml.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        outer
            .append_data(&mut header, MANIFEST_MEMBER, manifest_yaml.as_bytes())
            .io_at(xpa_path)?;

        let mut payload_file = File::open(payload.path()).io_at(payload.path())?;
        outer
            .append_file(PAYLOAD_MEMBER, &mut payload_file)
            .io_at(xpa_path)?;

        outer.finish().io_at(xpa_path)?;
    }

    staged
        .persist(xpa_path)
        .map_err(|e| XpkgError::io(xpa_path, e.error))?;

    Ok(())
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<String>> {
    let path = entry
        .path()
        .map_err(|e| XpkgError::BadRecipe(format!("bad tar member name: {e}")))?;
    Ok(path.to_str().map(ToString::to_string))
}
