//! Filesystem monitor: notify events → debounced path batches → ChangeSet.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexSet;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use kelp_cache::fingerprint::IGNORED_DIRS;
use kelp_core::{Artifact, ImageName, SyncItem};

use crate::changeset::ChangeSet;
use crate::error::RunnerError;

// ---------------------------------------------------------------------------
// Change mapping
// ---------------------------------------------------------------------------

/// What the dev loop watches, and how a changed path maps onto pending work.
#[derive(Debug, Clone)]
pub struct WatchTargets {
    config_file: PathBuf,
    manifests: Vec<PathBuf>,
    artifacts: Vec<Arc<Artifact>>,
}

/// Counts of what one batch queued.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub rebuild: usize,
    pub resync: usize,
    pub retest: usize,
    pub redeploy: bool,
    pub reload: bool,
}

impl WatchTargets {
    pub fn new(
        config_file: PathBuf,
        manifests: Vec<PathBuf>,
        artifacts: Vec<Arc<Artifact>>,
    ) -> Self {
        Self {
            config_file,
            manifests,
            artifacts,
        }
    }

    /// Directories to watch recursively; nested roots are folded into their parent.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dir) = self.config_file.parent() {
            candidates.push(dir.to_path_buf());
        }
        for manifest in &self.manifests {
            if manifest.is_dir() {
                candidates.push(manifest.clone());
            } else if let Some(dir) = manifest.parent() {
                candidates.push(dir.to_path_buf());
            }
        }
        candidates.extend(self.artifacts.iter().map(|a| a.context.clone()));
        candidates.retain(|p| !p.as_os_str().is_empty());
        candidates.sort();
        candidates.dedup();

        let mut roots: Vec<PathBuf> = Vec::new();
        for candidate in candidates {
            if !roots.iter().any(|root| candidate.starts_with(root)) {
                roots.push(candidate);
            }
        }
        roots
    }

    /// Queue the work a batch of changed paths implies.
    ///
    /// Config file → reload; manifest → redeploy; sync rule → resync (copy if
    /// the file still exists, delete otherwise); test path → retest; anything
    /// else inside a workspace → rebuild. Resync changes for one image are
    /// merged into a single item.
    pub fn apply(&self, paths: &[PathBuf], changes: &ChangeSet) -> Classified {
        let mut classified = Classified::default();
        let mut sync_items: BTreeMap<ImageName, SyncItem> = BTreeMap::new();
        let mut rebuilt: IndexSet<ImageName> = IndexSet::new();
        let mut retested: IndexSet<ImageName> = IndexSet::new();

        for path in paths {
            if self.is_ignored(path) {
                continue;
            }
            if path == &self.config_file {
                changes.mark_reload();
                classified.reload = true;
                continue;
            }
            if self.manifests.iter().any(|m| path.starts_with(m)) {
                changes.mark_redeploy();
                classified.redeploy = true;
                continue;
            }

            for artifact in self.artifacts.iter().filter(|a| a.contains(path)) {
                if let Some(dest) = artifact.sync_destination(path) {
                    let item = sync_items
                        .entry(artifact.image.clone())
                        .or_insert_with(|| SyncItem::new(artifact.image.clone()));
                    if path.exists() {
                        item.copy.insert(path.clone(), dest);
                    } else {
                        item.delete.insert(dest);
                    }
                } else if artifact.is_test_path(path) {
                    changes.add_retest(artifact);
                    retested.insert(artifact.image.clone());
                } else {
                    changes.add_rebuild(artifact);
                    rebuilt.insert(artifact.image.clone());
                }
            }
        }

        classified.resync = sync_items.len();
        for item in sync_items.into_values() {
            changes.add_resync(item);
        }
        classified.rebuild = rebuilt.len();
        classified.retest = retested.len();
        classified
    }

    /// Paths inside `.git`, `.kelp`, `target` or `node_modules` below a
    /// watched directory.
    fn is_ignored(&self, path: &Path) -> bool {
        let base = self
            .artifacts
            .iter()
            .map(|a| a.context.as_path())
            .chain(self.config_file.parent())
            .find(|base| path.starts_with(base));
        let rel = base
            .and_then(|base| path.strip_prefix(base).ok())
            .unwrap_or(path);
        rel.components().any(|c| {
            c.as_os_str()
                .to_str()
                .is_some_and(|name| IGNORED_DIRS.contains(&name))
        })
    }
}

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

/// Collects paths until no new event has arrived for `window`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: IndexSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: IndexSet::new(),
            last_event: None,
        }
    }

    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path);
        self.last_event = Some(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.last_event.map(|at| at + self.window)
    }

    /// Drain the batch once the window has passed since the last event.
    pub fn flush(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.last_event = None;
        Some(std::mem::take(&mut self.pending).into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Watcher task
// ---------------------------------------------------------------------------

/// Watch `roots` (replaced whenever the dev loop publishes new ones) and send
/// debounced batches of changed paths to `batch_tx`.
pub async fn watcher_task(
    mut roots_rx: watch::Receiver<Vec<PathBuf>>,
    batch_tx: mpsc::Sender<Vec<PathBuf>>,
    window: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RunnerError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched = watch_roots(&mut watcher, &[], &roots_rx.borrow_and_update())?;
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            changed = roots_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let roots = roots_rx.borrow_and_update().clone();
                watched = watch_roots(&mut watcher, &watched, &roots)?;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let now = Instant::now();
                for path in event.paths {
                    debouncer.push(restore_prefix(&watched, path), now);
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(batch) = debouncer.flush(Instant::now()) {
                    tracing::debug!(paths = batch.len(), "file changes detected");
                    if batch_tx.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

/// A watched root: the path as configured, and the real path events arrive under.
#[derive(Debug, Clone)]
struct Watched {
    configured: PathBuf,
    canonical: PathBuf,
}

fn watch_roots(
    watcher: &mut RecommendedWatcher,
    previous: &[Watched],
    roots: &[PathBuf],
) -> Result<Vec<Watched>, RunnerError> {
    for old in previous {
        if let Err(err) = watcher.unwatch(&old.canonical) {
            tracing::debug!(path = %old.canonical.display(), error = %err, "unwatch failed");
        }
    }

    let mut watched = Vec::with_capacity(roots.len());
    for root in roots {
        // FSEvents reports real paths (e.g. /private/var on macOS); map them back.
        let canonical = match fs::canonicalize(root) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(path = %root.display(), error = %err, "skipping missing watch root");
                continue;
            }
        };
        watcher.watch(&canonical, RecursiveMode::Recursive)?;
        tracing::debug!(path = %canonical.display(), "watching");
        watched.push(Watched {
            configured: root.clone(),
            canonical,
        });
    }
    Ok(watched)
}

fn restore_prefix(watched: &[Watched], path: PathBuf) -> PathBuf {
    for root in watched {
        if let Ok(rel) = path.strip_prefix(&root.canonical) {
            return root.configured.join(rel);
        }
    }
    path
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
