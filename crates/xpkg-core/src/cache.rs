//! Content-addressed cache of fetched source files.
//!
//! Every source a recipe names is stored once under the local cache root,
//! named by its `<algo>-<hex>` spec. Files are verified against the declared
//! hash on every use: a stale or corrupted cache entry is silently
//! re-downloaded, while a mismatch on a fresh download is an integrity
//! failure. Writers download to a temporary name, verify, then rename into
//! place, so concurrent readers never observe a partial file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use xpkg_schema::HashSpec;

use crate::error::{IoContext, Result, XpkgError};
use crate::paths;

/// How long one download attempt may take before we consider it failed.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// A handle on the process-wide source cache directory.
#[derive(Debug, Clone)]
pub struct SourceCache {
    root: PathBuf,
}

impl SourceCache {
    /// The cache at the default root (`XPKG_LOCAL_CACHE` or `~/.xpkg/cache`).
    pub fn new() -> Self {
        Self::at(paths::local_cache_dir())
    }

    /// A cache rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch `url` into the cache under `spec`, returning the local path.
    ///
    /// A cached file is re-hashed and reused when it still matches. A spec
    /// with an empty digest downloads unconditionally, hashes the result,
    /// and stores it under the computed digest.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::Io`] when the download fails (after one retry
    /// for transient network errors) and [`XpkgError::Integrity`] when a
    /// freshly downloaded file does not match the declared hash.
    pub fn fetch(&self, spec: &HashSpec, url: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).io_at(&self.root)?;

        if !spec.has_digest() {
            return self.fetch_unpinned(spec, url);
        }

        let cache_path = self.root.join(spec.to_string());

        if cache_path.exists() {
            // The file is about to be read off disk anyway, so re-hashing it
            // here is nearly free and catches corrupted cache entries.
            let actual = hash_file(spec, &cache_path)?;
            if actual == spec.hex() {
                debug!(%spec, "source cache hit");
                return Ok(cache_path);
            }
            warn!(%spec, "cached source is stale or corrupt, re-downloading");
        }

        let staged = self.download(url)?;
        let actual = hash_file(spec, staged.path())?;

        if actual != spec.hex() {
            return Err(XpkgError::Integrity(format!(
                "downloaded {url} hashes to {}-{actual}, expected {spec}",
                spec.algo()
            )));
        }

        staged.persist(&cache_path).map_err(|e| XpkgError::io(&cache_path, e.error))?;

        Ok(cache_path)
    }

    /// Download, hash, and store a source whose digest is not yet known.
    fn fetch_unpinned(&self, spec: &HashSpec, url: &str) -> Result<PathBuf> {
        let staged = self.download(url)?;
        let actual = hash_file(spec, staged.path())?;

        let resolved = spec
            .with_digest(actual)
            .map_err(|e| XpkgError::BadRecipe(e.to_string()))?;
        let cache_path = self.root.join(resolved.to_string());

        staged.persist(&cache_path).map_err(|e| XpkgError::io(&cache_path, e.error))?;
        info!(%url, spec = %resolved, "stored source under computed hash");

        Ok(cache_path)
    }

    /// Pull `url` into a temporary file inside the cache root.
    ///
    /// `file://` URLs and bare paths are copied from the filesystem;
    /// `http(s)://` URLs go through the network with one retry.
    fn download(&self, url: &str) -> Result<tempfile::NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempfile_in(&self.root)
            .io_at(&self.root)?;

        if let Some(local) = url.strip_prefix("file://") {
            let mut src = fs::File::open(local).io_at(local)?;
            io::copy(&mut src, staged.as_file_mut()).io_at(local)?;
            return Ok(staged);
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            info!(%url, "downloading");
            let body = fetch_http(url)?;
            staged.write_all(&body).io_at(staged.path())?;
            return Ok(staged);
        }

        // Anything else is treated as a plain filesystem path.
        let mut src = fs::File::open(url).io_at(url)?;
        io::copy(&mut src, staged.as_file_mut()).io_at(url)?;
        Ok(staged)
    }
}

impl Default for SourceCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest a file on disk with the spec's algorithm.
fn hash_file(spec: &HashSpec, path: &Path) -> Result<String> {
    let file = fs::File::open(path).io_at(path)?;
    spec.algo().hash_reader(io::BufReader::new(file)).io_at(path)
}

/// One HTTP GET with a single retry on transient failure.
fn fetch_http(url: &str) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| network_error(url, &e))?;

    let mut last_err = None;

    for attempt in 0..2 {
        if attempt > 0 {
            warn!(%url, "retrying download after transient failure");
        }

        match try_get(&client, url) {
            Ok(body) => return Ok(body),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.expect("at least one download attempt ran"))
}

fn try_get(client: &reqwest::blocking::Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|e| network_error(url, &e))?;

    let body = response.bytes().map_err(|e| network_error(url, &e))?;
    Ok(body.to_vec())
}

fn network_error(url: &str, err: &reqwest::Error) -> XpkgError {
    XpkgError::io(url, io::Error::other(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpkg_schema::HashAlgo;

    fn spec_for(data: &[u8], algo: HashAlgo) -> HashSpec {
        HashSpec::new(algo, algo.hash_bytes(data)).unwrap()
    }

    #[test]
    fn fetches_and_caches_local_file() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();

        let src = src_dir.path().join("hello.txt");
        fs::write(&src, b"hello world").unwrap();

        let cache = SourceCache::at(cache_dir.path());
        let spec = spec_for(b"hello world", HashAlgo::Sha256);

        let path = cache.fetch(&spec, &format!("file://{}", src.display())).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        assert_eq!(path, cache_dir.path().join(spec.to_string()));

        // Second fetch is served from the cache even if the origin is gone.
        fs::remove_file(&src).unwrap();
        let again = cache.fetch(&spec, "file:///nonexistent").unwrap();
        assert_eq!(again, path);
    }

    #[test]
    fn corrupt_cache_entry_is_refetched() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();

        let src = src_dir.path().join("data.bin");
        fs::write(&src, b"payload").unwrap();

        let cache = SourceCache::at(cache_dir.path());
        let spec = spec_for(b"payload", HashAlgo::Md5);

        // Poison the cache entry, then fetch: the poisoned bytes must be
        // replaced by a fresh download.
        fs::write(cache_dir.path().join(spec.to_string()), b"garbage").unwrap();
        let path = cache.fetch(&spec, &format!("file://{}", src.display())).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"payload");
    }

    #[test]
    fn mismatched_download_is_an_integrity_error() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();

        let src = src_dir.path().join("data.bin");
        fs::write(&src, b"actual bytes").unwrap();

        let cache = SourceCache::at(cache_dir.path());
        let spec = spec_for(b"declared bytes", HashAlgo::Sha1);

        let err = cache
            .fetch(&spec, &format!("file://{}", src.display()))
            .unwrap_err();
        assert!(matches!(err, XpkgError::Integrity(_)));
    }

    #[test]
    fn empty_digest_resolves_to_computed_hash() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();

        let src = src_dir.path().join("blob");
        fs::write(&src, b"unpinned").unwrap();

        let cache = SourceCache::at(cache_dir.path());
        let spec = HashSpec::new(HashAlgo::Sha256, "").unwrap();

        let path = cache.fetch(&spec, &format!("file://{}", src.display())).unwrap();
        let expected = spec_for(b"unpinned", HashAlgo::Sha256);
        assert_eq!(path, cache_dir.path().join(expected.to_string()));
    }
}
