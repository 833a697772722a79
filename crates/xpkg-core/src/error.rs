//! The typed error taxonomy every core operation surfaces.
//!
//! The builder, relocator, and resolver return these to the environment,
//! which reports them to the caller unchanged. Expected absence (a package
//! not found in an index) is a `None` return at the lookup layer, not an
//! error; it becomes [`XpkgError::NotFound`] only where presence is
//! required.

use std::path::PathBuf;

use xpkg_schema::recipe::RecipeError;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, XpkgError>;

/// Everything a core operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum XpkgError {
    /// A recipe, archive, package, or file was absent where required.
    #[error("not found: {0}")]
    NotFound(String),

    /// A version pin clashed with an installed package, a removal was
    /// blocked by reverse dependencies, or a package was installed twice.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The dependency closure contains a cycle or a self-dependency.
    #[error("dependency cycle involving: {0}")]
    DependencyCycle(String),

    /// A content hash did not match, or an archive manifest disagrees with
    /// its payload.
    #[error("integrity failure: {0}")]
    Integrity(String),

    /// The relocation contract was violated: the target prefix is longer
    /// than the build prefix, or a rewrite changed a file's length.
    #[error("relocation failure: {0}")]
    Relocation(String),

    /// A configure/build/install command exited non-zero.
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// An unparsable or structurally invalid recipe or manifest.
    #[error("bad recipe: {0}")]
    BadRecipe(String),

    /// An underlying filesystem or network failure.
    #[error("I/O failure on {path}: {source}")]
    Io {
        /// The path (or URL) the operation was touching.
        path: PathBuf,
        /// The underlying failure.
        source: std::io::Error,
    },
}

impl XpkgError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<RecipeError> for XpkgError {
    fn from(err: RecipeError) -> Self {
        Self::BadRecipe(err.to_string())
    }
}

/// Attach a path to `io::Result` values without writing `map_err` chains.
pub(crate) trait IoContext<T> {
    /// Convert an `io::Result` into a [`Result`], recording `path`.
    fn io_at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| XpkgError::io(path, source))
    }
}
