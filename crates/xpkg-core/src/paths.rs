//! The Xpkg directory layout and the environment variables that steer it.

use std::path::{Path, PathBuf};

/// Overrides the active prefix for operations given no explicit prefix.
pub const XPKG_ROOT_VAR: &str = "XPKG_ROOT";

/// Colon-separated list of directories of `.xpd` recipes.
pub const XPKG_TREE_VAR: &str = "XPKG_TREE";

/// Colon-separated list of directories of `.xpa` archives.
pub const XPKG_REPO_VAR: &str = "XPKG_REPO";

/// Overrides the source/parse-cache root.
pub const XPKG_LOCAL_CACHE_VAR: &str = "XPKG_LOCAL_CACHE";

/// `var/xpkg` under the prefix: everything Xpkg owns about an environment.
pub fn state_dir(prefix: &Path) -> PathBuf {
    prefix.join("var").join("xpkg")
}

/// The environment settings file (`var/xpkg/env.yml`).
pub fn settings_path(prefix: &Path) -> PathBuf {
    state_dir(prefix).join("env.yml")
}

/// The install database directory (`var/xpkg/db`).
pub fn db_dir(prefix: &Path) -> PathBuf {
    state_dir(prefix).join("db")
}

/// The base install records (`var/xpkg/db/data.yml`).
pub fn db_data_path(prefix: &Path) -> PathBuf {
    db_dir(prefix).join("data.yml")
}

/// Per-package file and offset records (`var/xpkg/db/file_info`).
pub fn db_file_info_dir(prefix: &Path) -> PathBuf {
    db_dir(prefix).join("file_info")
}

/// Pre-split single-file database some older prefixes carry
/// (`var/xpkg/db.yml`); migrated into `db/` on load.
pub fn legacy_db_path(prefix: &Path) -> PathBuf {
    state_dir(prefix).join("db.yml")
}

/// Built archives awaiting install (`var/xpkg/cache`).
pub fn xpa_cache_dir(prefix: &Path) -> PathBuf {
    state_dir(prefix).join("cache")
}

/// Build logs (`var/xpkg/log`).
pub fn log_dir(prefix: &Path) -> PathBuf {
    state_dir(prefix).join("log")
}

/// The build log file for one package.
pub fn build_log_path(prefix: &Path, name: &str, version: &str) -> PathBuf {
    log_dir(prefix).join(format!("{name}-{version}_build.log"))
}

/// The local user cache root: `XPKG_LOCAL_CACHE` if set, else
/// `~/.xpkg/cache`.
///
/// Holds fetched sources named `<algo>-<hex>` and, under `tree/` and
/// `repo/`, the JSON mtime-indexed parse caches.
pub fn local_cache_dir() -> PathBuf {
    if let Ok(path) = std::env::var(XPKG_LOCAL_CACHE_VAR) {
        return PathBuf::from(path);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".xpkg")
        .join("cache")
}

/// Extract the trailing filename component of a URL.
pub fn filename_from_url(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_var_xpkg() {
        let prefix = Path::new("/env");
        assert_eq!(settings_path(prefix), Path::new("/env/var/xpkg/env.yml"));
        assert_eq!(db_data_path(prefix), Path::new("/env/var/xpkg/db/data.yml"));
        assert_eq!(
            db_file_info_dir(prefix),
            Path::new("/env/var/xpkg/db/file_info")
        );
        assert_eq!(xpa_cache_dir(prefix), Path::new("/env/var/xpkg/cache"));
        assert_eq!(
            build_log_path(prefix, "hello", "1.0.0"),
            Path::new("/env/var/xpkg/log/hello-1.0.0_build.log")
        );
    }

    #[test]
    fn url_filenames() {
        assert_eq!(
            filename_from_url("http://example.com/dl/hello-1.0.0.tar.gz"),
            "hello-1.0.0.tar.gz"
        );
        assert_eq!(filename_from_url("plain.txt"), "plain.txt");
    }
}
