//! Error types for kelp-cache.

use std::path::PathBuf;

use thiserror::Error;

use kelp_core::ImageName;

/// Failures reported by a build backend. Surfaced verbatim by the cache.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("building {image} failed: {message}")]
    Failed { image: ImageName, message: String },

    #[error("tests for {image} failed: {message}")]
    TestFailed { image: ImageName, message: String },

    /// The backend succeeded but did not report a result for a requested image.
    #[error("build backend returned no result for {image}")]
    MissingResult { image: ImageName },
}

/// All errors that can arise from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Build(#[from] BuildError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot determine home directory; pass an explicit cache file")]
    HomeNotFound,

    #[error("dependency resolution task failed: {0}")]
    Join(String),
}

/// Convenience constructor for [`CacheError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.into(),
        source,
    }
}
