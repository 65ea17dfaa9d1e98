//! Build cache: reuse results for unchanged fingerprints, build the rest once.
//!
//! ## `ArtifactCache::build` protocol
//!
//! 1. Fingerprint every artifact (resolver failure → forced miss).
//! 2. Hits reuse the stored [`TaggedArtifact`].
//! 3. Misses go to the backend in a single `build_and_test` call.
//! 4. On full success, record the new entries (one per image) and persist
//!    the store.
//! 5. Return results in input order, hits and fresh builds interleaved.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use kelp_core::{Artifact, ImageName, ImageTags, TaggedArtifact};

use crate::error::{io_err, BuildError, CacheError};
use crate::fingerprint::{fingerprint, DependencyResolver};
use crate::store::{self, CacheStoreFile, Entries};

/// A real build + test pass over a batch of artifacts.
///
/// Must be safe to call with any sub-batch of the configured artifacts.
#[async_trait]
pub trait BuildAndTest: Send + Sync {
    async fn build_and_test(
        &self,
        out: &mut (dyn Write + Send),
        tags: &ImageTags,
        artifacts: &[Arc<Artifact>],
    ) -> Result<Vec<TaggedArtifact>, BuildError>;
}

/// Decision layer in front of [`BuildAndTest`].
#[async_trait]
pub trait Cache: Send + Sync {
    async fn build(
        &mut self,
        out: &mut (dyn Write + Send),
        tags: &ImageTags,
        artifacts: &[Arc<Artifact>],
        builder: &dyn BuildAndTest,
    ) -> Result<Vec<TaggedArtifact>, CacheError>;
}

/// Caching disabled: every call delegates the full batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn build(
        &mut self,
        out: &mut (dyn Write + Send),
        tags: &ImageTags,
        artifacts: &[Arc<Artifact>],
        builder: &dyn BuildAndTest,
    ) -> Result<Vec<TaggedArtifact>, CacheError> {
        Ok(builder.build_and_test(out, tags, artifacts).await?)
    }
}

/// Fingerprint-keyed cache, optionally persisted to disk.
pub struct ArtifactCache {
    resolver: Arc<dyn DependencyResolver>,
    entries: Entries,
    store_path: Option<PathBuf>,
}

impl ArtifactCache {
    /// A cache that lives only as long as this value.
    pub fn in_memory(resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            resolver,
            entries: Entries::new(),
            store_path: None,
        }
    }

    /// Load entries from `path` and persist back to it after each successful build.
    pub fn load_at(path: &Path, resolver: Arc<dyn DependencyResolver>) -> Result<Self, CacheError> {
        let store = store::load_at(path)?;
        tracing::debug!(path = %path.display(), entries = store.entries.len(), "loaded build cache");
        Ok(Self {
            resolver,
            entries: store.entries,
            store_path: Some(path.to_path_buf()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `None` when the dependencies cannot be resolved or hashed; that
    /// artifact is then always rebuilt.
    async fn fingerprint_of(&self, artifact: &Artifact) -> Option<String> {
        let result = match self.resolver.resolve(artifact).await {
            Ok(deps) => fingerprint(artifact, &deps),
            Err(err) => Err(err),
        };
        match result {
            Ok(fp) => Some(fp),
            Err(err) => {
                tracing::warn!(
                    image = %artifact.image,
                    error = %err,
                    "could not fingerprint artifact, forcing rebuild",
                );
                None
            }
        }
    }

    /// Keep one entry per image: the new fingerprint replaces older ones.
    fn commit(&mut self, fp: &str, result: &TaggedArtifact) {
        let before = self.entries.len();
        self.entries
            .retain(|_, cached| cached.image_name != result.image_name);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            tracing::debug!(image = %result.image_name, pruned, "replaced stale cache entries");
        }
        self.entries.insert(fp.to_string(), result.clone());
    }

    fn persist(&self) {
        let Some(path) = self.store_path.as_ref() else {
            return;
        };
        let store = CacheStoreFile {
            updated_at: Utc::now(),
            entries: self.entries.clone(),
        };
        if let Err(err) = store::save_at(path, &store) {
            tracing::warn!(path = %path.display(), error = %err, "failed to persist build cache");
        }
    }
}

#[async_trait]
impl Cache for ArtifactCache {
    async fn build(
        &mut self,
        out: &mut (dyn Write + Send),
        tags: &ImageTags,
        artifacts: &[Arc<Artifact>],
        builder: &dyn BuildAndTest,
    ) -> Result<Vec<TaggedArtifact>, CacheError> {
        let mut resolved: Vec<Option<TaggedArtifact>> = Vec::with_capacity(artifacts.len());
        let mut misses: Vec<Arc<Artifact>> = Vec::new();
        let mut miss_fingerprints: Vec<Option<String>> = Vec::new();

        writeln!(out, "Checking cache...").map_err(|e| io_err("build output", e))?;
        for artifact in artifacts {
            let fp = self.fingerprint_of(artifact).await;
            let hit = fp.as_deref().and_then(|fp| self.entries.get(fp));
            match hit {
                Some(hit) => {
                    writeln!(out, " - {}: Found. Reusing {}", artifact.image, hit.tag)
                        .map_err(|e| io_err("build output", e))?;
                    resolved.push(Some(TaggedArtifact {
                        image_name: artifact.image.clone(),
                        tag: hit.tag.clone(),
                    }));
                }
                None => {
                    writeln!(out, " - {}: Not found. Building", artifact.image)
                        .map_err(|e| io_err("build output", e))?;
                    resolved.push(None);
                    misses.push(Arc::clone(artifact));
                    miss_fingerprints.push(fp);
                }
            }
        }

        if misses.is_empty() {
            return Ok(resolved.into_iter().flatten().collect());
        }

        let built = builder.build_and_test(out, tags, &misses).await?;
        let mut by_image: HashMap<ImageName, TaggedArtifact> = built
            .into_iter()
            .map(|result| (result.image_name.clone(), result))
            .collect();

        let mut fresh = Vec::with_capacity(misses.len());
        for artifact in &misses {
            let result = by_image
                .remove(&artifact.image)
                .ok_or_else(|| BuildError::MissingResult {
                    image: artifact.image.clone(),
                })?;
            fresh.push(result);
        }

        // Every miss produced a result; only now commit to the cache.
        for (fp, result) in miss_fingerprints.iter().zip(&fresh) {
            if let Some(fp) = fp {
                self.commit(fp, result);
            }
        }
        self.persist();

        let mut fresh = fresh.into_iter();
        let mut results = Vec::with_capacity(resolved.len());
        for slot in resolved {
            match slot {
                Some(hit) => results.push(hit),
                None => results.extend(fresh.next()),
            }
        }
        Ok(results)
    }
}
