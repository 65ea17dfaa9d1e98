//! Per-cycle accumulator of pending work.
//!
//! Detectors call the `add_*` methods concurrently; the dev loop drains one
//! category at a time with the `take_*` / `reset_*` methods. Every operation
//! runs under one lock, so a reset is always strictly before or after any
//! given add.
//!
//! Rebuilds and resyncs are insertion-ordered sets keyed by image name: the
//! first entry for an image wins and later ones for the same image are ignored
//! until that category is reset.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::{IndexMap, IndexSet};

use kelp_core::{Artifact, ImageName, SyncItem};

#[derive(Debug, Default)]
struct Pending {
    rebuild: IndexMap<ImageName, Arc<Artifact>>,
    resync: IndexMap<ImageName, SyncItem>,
    retest: IndexSet<ImageName>,
    redeploy: bool,
    reload: bool,
}

#[derive(Debug, Default)]
pub struct ChangeSet {
    pending: Mutex<Pending>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Accumulation
    // -----------------------------------------------------------------------

    pub fn add_rebuild(&self, artifact: &Arc<Artifact>) {
        self.pending()
            .rebuild
            .entry(artifact.image.clone())
            .or_insert_with(|| Arc::clone(artifact));
    }

    pub fn add_retest(&self, artifact: &Artifact) {
        self.pending().retest.insert(artifact.image.clone());
    }

    pub fn add_resync(&self, item: SyncItem) {
        self.pending()
            .resync
            .entry(item.image.clone())
            .or_insert(item);
    }

    pub fn mark_redeploy(&self) {
        self.pending().redeploy = true;
    }

    pub fn mark_reload(&self) {
        self.pending().reload = true;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn needs_rebuild(&self) -> Vec<Arc<Artifact>> {
        self.pending().rebuild.values().cloned().collect()
    }

    pub fn needs_resync(&self) -> Vec<SyncItem> {
        self.pending().resync.values().cloned().collect()
    }

    pub fn needs_retest(&self) -> Vec<ImageName> {
        self.pending().retest.iter().cloned().collect()
    }

    pub fn needs_redeploy(&self) -> bool {
        self.pending().redeploy
    }

    pub fn needs_reload(&self) -> bool {
        self.pending().reload
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending();
        pending.rebuild.is_empty()
            && pending.resync.is_empty()
            && pending.retest.is_empty()
            && !pending.redeploy
            && !pending.reload
    }

    // -----------------------------------------------------------------------
    // Category-scoped reset
    // -----------------------------------------------------------------------

    pub fn reset_build(&self) {
        self.pending().rebuild.clear();
    }

    pub fn reset_sync(&self) {
        self.pending().resync.clear();
    }

    pub fn reset_deploy(&self) {
        self.pending().redeploy = false;
    }

    pub fn reset_test(&self) {
        self.pending().retest.clear();
    }

    pub fn reset_reload(&self) {
        self.pending().reload = false;
    }

    /// Snapshot and clear pending rebuilds in one step.
    pub(crate) fn take_rebuild(&self) -> Vec<Arc<Artifact>> {
        let mut pending = self.pending();
        std::mem::take(&mut pending.rebuild).into_values().collect()
    }

    /// Snapshot and clear pending resyncs in one step.
    pub(crate) fn take_resync(&self) -> Vec<SyncItem> {
        let mut pending = self.pending();
        std::mem::take(&mut pending.resync).into_values().collect()
    }

    /// Snapshot and clear pending retests in one step.
    pub(crate) fn take_retest(&self) -> Vec<ImageName> {
        let mut pending = self.pending();
        std::mem::take(&mut pending.retest).into_iter().collect()
    }
}
