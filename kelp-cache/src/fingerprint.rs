//! Source dependencies and content fingerprints.
//!
//! A fingerprint is the SHA-256 over an artifact's build settings plus the
//! relative path and content digest of every source dependency. Any change to
//! one of those inputs yields a different fingerprint, which is a cache miss.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use kelp_core::types::{Artifact, DockerArtifact};
use kelp_core::ImageName;

use crate::error::{io_err, CacheError};

/// Directory names never treated as build inputs.
pub const IGNORED_DIRS: &[&str] = &[".git", ".kelp", "target", "node_modules"];

/// Resolves the files an artifact's build depends on.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    async fn resolve(&self, artifact: &Artifact) -> Result<Vec<PathBuf>, CacheError>;
}

/// Treats every file under the artifact context as a dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkspaceResolver;

#[async_trait]
impl DependencyResolver for WorkspaceResolver {
    async fn resolve(&self, artifact: &Artifact) -> Result<Vec<PathBuf>, CacheError> {
        let root = artifact.context.clone();
        tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .map_err(|err| CacheError::Join(err.to_string()))?
    }
}

/// Build settings that participate in the fingerprint.
#[derive(Serialize)]
struct BuildInputs<'a> {
    image: &'a ImageName,
    docker: &'a DockerArtifact,
    tests: &'a [String],
}

/// Compute the fingerprint of `artifact` given its resolved dependencies.
pub fn fingerprint(artifact: &Artifact, deps: &[PathBuf]) -> Result<String, CacheError> {
    let inputs = BuildInputs {
        image: &artifact.image,
        docker: &artifact.docker,
        tests: artifact.test_commands(),
    };

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&inputs)?);

    let mut deps = deps.to_vec();
    deps.sort();
    deps.dedup();
    for path in &deps {
        let rel = path.strip_prefix(&artifact.context).unwrap_or(path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(hash_file(path)?.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_file(path: &Path) -> Result<String, CacheError> {
    let content = fs::read(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}

fn collect_files(root: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut files = Vec::new();
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                let ignored = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| IGNORED_DIRS.contains(&name));
                if !ignored {
                    dirs.push(entry.path());
                }
            } else if ty.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
