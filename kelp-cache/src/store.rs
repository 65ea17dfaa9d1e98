//! Fingerprint store: persisted build results keyed by dependency fingerprint.
//!
//! Persists a `CacheStoreFile` JSON document, by default at
//! `<home>/.kelp/cache.json`. Writes use the atomic `.tmp` + rename pattern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kelp_core::TaggedArtifact;

use crate::error::{io_err, CacheError};

/// In-memory store: fingerprint hex digest → last successful build result.
pub type Entries = HashMap<String, TaggedArtifact>;

/// On-disk store payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStoreFile {
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Entries,
}

impl CacheStoreFile {
    pub fn empty() -> Self {
        Self {
            updated_at: Utc::now(),
            entries: HashMap::new(),
        }
    }
}

/// `<home>/.kelp/cache.json`
pub fn store_path_at(home: &Path) -> PathBuf {
    home.join(".kelp").join("cache.json")
}

/// [`store_path_at`] rooted at `dirs::home_dir()`.
pub fn default_store_path() -> Result<PathBuf, CacheError> {
    dirs::home_dir()
        .map(|home| store_path_at(&home))
        .ok_or(CacheError::HomeNotFound)
}

/// Load the store at `path`.
///
/// Returns an empty store if the file does not yet exist.
pub fn load_at(path: &Path) -> Result<CacheStoreFile, CacheError> {
    if !path.exists() {
        return Ok(CacheStoreFile::empty());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Save the store atomically.
///
/// Writes to `<path>.tmp` then renames to `<path>`.
pub fn save_at(path: &Path, store: &CacheStoreFile) -> Result<(), CacheError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid cache store path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(store)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}
