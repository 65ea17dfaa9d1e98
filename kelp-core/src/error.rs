//! Error types for kelp-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ImageName;

/// All errors that can arise while loading a pipeline config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with the offending path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse pipeline config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The config file did not exist at the expected path.
    #[error("pipeline config not found at {path}")]
    NotFound { path: PathBuf },

    #[error("unsupported apiVersion '{found}' in {path}; expected '{expected}'")]
    UnsupportedVersion {
        path: PathBuf,
        found: String,
        expected: &'static str,
    },

    /// Two artifacts share an image name; image names key every cache and change set.
    #[error("artifact image '{image}' is declared more than once")]
    DuplicateImage { image: ImageName },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
