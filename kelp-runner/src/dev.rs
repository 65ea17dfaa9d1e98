//! Dev loop driver.
//!
//! [`Runner`] owns the pipeline for one config: artifacts, cache, the latest
//! build per image, and the collaborators. [`Runner::cycle`] runs one poll:
//!
//! 1. Reload the config if it changed.
//! 2. Take one [`IntentSnapshot`](crate::intents::IntentSnapshot).
//! 3. Sync → build (+test) → retest → deploy, each only when its category is
//!    due and has pending work. The category's ChangeSet slice is drained and
//!    its intent reset before the stage runs.
//!
//! Stage failures are logged and reported; they never end the loop.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use kelp_cache::{
    store, ArtifactCache, BuildAndTest, BuildError, Cache, NoCache, WorkspaceResolver,
};
use kelp_core::{
    config, tags, Artifact, ImageName, PipelineConfig, RunOptions, SyncItem, TaggedArtifact,
};

use crate::changeset::ChangeSet;
use crate::deploy::{Deployer, Deployment};
use crate::docker::DockerBuilder;
use crate::error::{io_err, RunnerError};
use crate::intents::Intents;
use crate::kubectl::{AppliedDeployments, KubectlCli, KubectlDeployer, KubectlStatusChecker};
use crate::monitor::WatchTargets;
use crate::sync::{KubectlSyncer, Syncer};

/// Shortest period the dev loop polls at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Re-runs an artifact's tests against an already built image.
#[async_trait]
pub trait Tester: Send + Sync {
    async fn test(
        &self,
        out: &mut (dyn Write + Send),
        artifact: &Artifact,
        reference: &str,
    ) -> Result<(), BuildError>;
}

/// The external collaborators for one config.
pub struct Components {
    pub builder: Arc<dyn BuildAndTest>,
    pub tester: Arc<dyn Tester>,
    pub deployment: Deployment,
    pub syncer: Arc<dyn Syncer>,
}

/// Builds [`Components`]; called again on every config reload.
pub type ComponentFactory =
    Arc<dyn Fn(&PipelineConfig, &RunOptions) -> Components + Send + Sync>;

/// docker builds, kubectl deploys / status checks / syncs.
pub fn docker_kubectl(config: &PipelineConfig, options: &RunOptions) -> Components {
    let cli = KubectlCli::new(options.kube_context.clone(), options.namespace.clone());
    let applied = AppliedDeployments::default();
    let builder = Arc::new(DockerBuilder::new(options.push(config)));

    let mut deployers: Vec<Arc<dyn Deployer>> = Vec::new();
    if let Some(kubectl) = &config.deploy.kubectl {
        let namespace = options
            .namespace
            .clone()
            .or_else(|| kubectl.default_namespace.clone());
        let deploy_cli = KubectlCli::new(options.kube_context.clone(), namespace);
        deployers.push(Arc::new(KubectlDeployer::new(
            deploy_cli,
            kubectl.manifests.clone(),
            applied.clone(),
        )));
    }

    let checker = KubectlStatusChecker::new(cli.clone(), config.status_check_deadline(), applied);
    let deployment = Deployment::new(deployers, Arc::new(checker))
        .with_status_check(options.status_check)
        .with_render_only(options.render_only)
        .with_namespaces(config.configured_namespaces(), options.namespace.clone());

    let mut sync_namespaces = config.configured_namespaces();
    if let Some(ns) = &options.namespace {
        if !sync_namespaces.contains(ns) {
            sync_namespaces.push(ns.clone());
        }
    }

    Components {
        builder: builder.clone(),
        tester: builder,
        deployment,
        syncer: Arc::new(KubectlSyncer::new(cli, sync_namespaces)),
    }
}

/// `NoCache` when caching is off, otherwise the persisted fingerprint cache.
pub fn open_cache(options: &RunOptions) -> Result<Box<dyn Cache>, RunnerError> {
    if !options.cache_artifacts {
        return Ok(Box::new(NoCache));
    }
    let path = match &options.cache_file {
        Some(path) => path.clone(),
        None => store::default_store_path()?,
    };
    let cache = ArtifactCache::load_at(&path, Arc::new(WorkspaceResolver))?;
    Ok(Box::new(cache))
}

/// What one [`Runner::cycle`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub reloaded: bool,
    pub synced: usize,
    pub built: usize,
    pub retested: usize,
    pub deployed: bool,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        !self.reloaded
            && self.synced == 0
            && self.built == 0
            && self.retested == 0
            && !self.deployed
            && self.errors.is_empty()
    }

    fn fail(&mut self, stage: &str, err: impl std::fmt::Display) {
        tracing::error!(stage, error = %err, "dev cycle stage failed");
        self.errors.push(format!("{stage}: {err}"));
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct Runner {
    options: RunOptions,
    config: PipelineConfig,
    artifacts: Vec<Arc<Artifact>>,
    targets: WatchTargets,
    components: Components,
    factory: ComponentFactory,
    cache: Box<dyn Cache>,
    builds: IndexMap<ImageName, TaggedArtifact>,
    changes: Arc<ChangeSet>,
    intents: Arc<Intents>,
}

impl Runner {
    pub fn new(
        options: RunOptions,
        config: PipelineConfig,
        cache: Box<dyn Cache>,
        factory: ComponentFactory,
    ) -> Self {
        let intents = Intents::new(options.auto_build, options.auto_sync, options.auto_deploy);
        let components = factory(&config, &options);
        let mut runner = Self {
            targets: WatchTargets::new(options.config_file.clone(), Vec::new(), Vec::new()),
            artifacts: Vec::new(),
            options,
            config: config.clone(),
            components,
            factory,
            cache,
            builds: IndexMap::new(),
            changes: Arc::new(ChangeSet::new()),
            intents: Arc::new(intents),
        };
        runner.install(config, false);
        runner
    }

    /// Load the config named by `options` and open the configured cache.
    pub fn load(mut options: RunOptions, factory: ComponentFactory) -> Result<Self, RunnerError> {
        if options.config_file.is_relative() {
            let cwd = std::env::current_dir().map_err(|e| io_err(".", e))?;
            options.config_file = cwd.join(&options.config_file);
        }
        let config = config::load_at(&options.config_file)?;
        let cache = open_cache(&options)?;
        Ok(Self::new(options, config, cache, factory))
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &[Arc<Artifact>] {
        &self.artifacts
    }

    pub fn targets(&self) -> &WatchTargets {
        &self.targets
    }

    pub fn changes(&self) -> &Arc<ChangeSet> {
        &self.changes
    }

    pub fn intents(&self) -> &Arc<Intents> {
        &self.intents
    }

    /// Latest successful build per image, in first-built order.
    pub fn builds(&self) -> Vec<TaggedArtifact> {
        self.builds.values().cloned().collect()
    }

    fn install(&mut self, config: PipelineConfig, rebuild_components: bool) {
        self.artifacts = config
            .build
            .artifacts
            .iter()
            .cloned()
            .map(Arc::new)
            .collect();
        self.targets = WatchTargets::new(
            self.options.config_file.clone(),
            config.manifests().to_vec(),
            self.artifacts.clone(),
        );
        if rebuild_components {
            self.components = (self.factory)(&config, &self.options);
        }
        self.builds.retain(|image, _| config.artifact(image).is_some());
        self.config = config;
    }

    /// Re-read the config file, keeping intents and cache, and queue a full
    /// rebuild and redeploy.
    pub fn reload(&mut self) -> Result<(), RunnerError> {
        let config = config::load_at(&self.options.config_file)?;
        self.install(config, true);
        for artifact in &self.artifacts {
            self.changes.add_rebuild(artifact);
        }
        self.changes.mark_redeploy();
        tracing::info!(
            config = %self.options.config_file.display(),
            artifacts = self.artifacts.len(),
            "configuration reloaded"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Build `artifacts` through the cache and record the results.
    pub async fn build(
        &mut self,
        out: &mut (dyn Write + Send),
        artifacts: &[Arc<Artifact>],
    ) -> Result<Vec<TaggedArtifact>, RunnerError> {
        if artifacts.is_empty() {
            return Ok(Vec::new());
        }
        let tags = tags::date_time_tags(artifacts.iter().map(|a| a.as_ref()), Utc::now());
        let results = self
            .cache
            .build(out, &tags, artifacts, self.components.builder.as_ref())
            .await?;
        for result in &results {
            self.builds.insert(result.image_name.clone(), result.clone());
        }
        Ok(results)
    }

    pub async fn build_all(
        &mut self,
        out: &mut (dyn Write + Send),
    ) -> Result<Vec<TaggedArtifact>, RunnerError> {
        let artifacts = self.artifacts.clone();
        self.build(out, &artifacts).await
    }

    /// Deploy the latest builds; returns the targeted namespaces.
    pub async fn deploy(
        &mut self,
        out: &mut (dyn Write + Send),
    ) -> Result<Vec<String>, RunnerError> {
        let builds = self.builds();
        Ok(self.components.deployment.deploy(out, &builds).await?)
    }

    pub async fn render(&mut self, out: &mut (dyn Write + Send)) -> Result<(), RunnerError> {
        let builds = self.builds();
        Ok(self.components.deployment.render(out, &builds).await?)
    }

    /// Build everything, then deploy.
    pub async fn run_once(
        &mut self,
        out: &mut (dyn Write + Send),
    ) -> Result<Vec<String>, RunnerError> {
        self.build_all(out).await?;
        self.deploy(out).await
    }

    async fn sync_item(
        &self,
        out: &mut (dyn Write + Send),
        item: &SyncItem,
    ) -> Result<(), RunnerError> {
        let Some(build) = self.builds.get(&item.image) else {
            return Err(RunnerError::Protocol(format!(
                "no build of {} to sync into",
                item.image
            )));
        };
        self.components
            .syncer
            .sync(out, item, &build.tag)
            .await
            .map_err(|source| RunnerError::Sync {
                image: item.image.clone(),
                source,
            })
    }

    async fn retest(
        &self,
        out: &mut (dyn Write + Send),
        image: &ImageName,
    ) -> Result<bool, RunnerError> {
        let Some(artifact) = self.artifacts.iter().find(|a| &a.image == image) else {
            return Ok(false);
        };
        let Some(build) = self.builds.get(image) else {
            return Ok(false);
        };
        self.components
            .tester
            .test(out, artifact, &build.tag)
            .await?;
        Ok(true)
    }

    fn artifact(&self, image: &ImageName) -> Option<&Arc<Artifact>> {
        self.artifacts.iter().find(|a| &a.image == image)
    }

    /// One poll of the dev loop.
    pub async fn cycle(&mut self, out: &mut (dyn Write + Send)) -> CycleReport {
        let mut report = CycleReport::default();

        if self.changes.needs_reload() {
            self.changes.reset_reload();
            match self.reload() {
                Ok(()) => report.reloaded = true,
                Err(err) => report.fail("reload", err),
            }
        }

        let intents = self.intents.get_intents();

        if intents.sync {
            let items = self.changes.take_resync();
            if !items.is_empty() {
                self.intents.reset_sync();
                for item in &items {
                    match self.sync_item(out, item).await {
                        Ok(()) => report.synced += 1,
                        Err(err) => {
                            report.fail("sync", err);
                            // The files still need to reach the cluster.
                            if let Some(artifact) = self.artifact(&item.image).cloned() {
                                self.changes.add_rebuild(&artifact);
                            }
                        }
                    }
                }
            }
        }

        let mut build_failed = false;
        if intents.build {
            let artifacts = self.changes.take_rebuild();
            let mut rebuilt = IndexSet::new();
            if !artifacts.is_empty() {
                self.intents.reset_build();
                match self.build(out, &artifacts).await {
                    Ok(results) => {
                        report.built = results.len();
                        rebuilt.extend(results.into_iter().map(|r| r.image_name));
                        self.changes.mark_redeploy();
                    }
                    Err(err) => {
                        build_failed = true;
                        report.fail("build", err);
                    }
                }
            }

            if !build_failed {
                let images = self.changes.take_retest();
                if !images.is_empty() {
                    self.intents.reset_build();
                }
                for image in images.iter().filter(|image| !rebuilt.contains(*image)) {
                    match self.retest(out, image).await {
                        Ok(true) => report.retested += 1,
                        Ok(false) => {}
                        Err(err) => report.fail("test", err),
                    }
                }
            }
        }

        if intents.deploy && !build_failed && self.changes.needs_redeploy() {
            self.changes.reset_deploy();
            self.intents.reset_deploy();
            match self.deploy(out).await {
                Ok(namespaces) => {
                    report.deployed = true;
                    tracing::info!(namespaces = ?namespaces, "deploy complete");
                }
                Err(RunnerError::Deploy(err)) if err.is_status_check() => {
                    report.deployed = true;
                    report.fail("status check", err);
                }
                Err(err) => report.fail("deploy", err),
            }
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Loop task
// ---------------------------------------------------------------------------

/// Dev loop state published to the control socket.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub started_at: DateTime<Utc>,
    pub cycles: u64,
    pub builds: Vec<TaggedArtifact>,
    pub last_cycle: Option<CycleReport>,
}

impl LoopStatus {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            cycles: 0,
            builds: Vec::new(),
            last_cycle: None,
        }
    }
}

pub type SharedStatus = Arc<RwLock<LoopStatus>>;

/// Channels tying the loop to the watcher and control socket.
pub struct LoopChannels {
    pub batch_rx: mpsc::Receiver<Vec<PathBuf>>,
    pub roots_tx: watch::Sender<Vec<PathBuf>>,
    pub status: SharedStatus,
    pub shutdown_rx: broadcast::Receiver<()>,
}

/// Initial build + deploy, then poll every `poll_interval` until shutdown.
///
/// Watcher batches are applied to the ChangeSet between cycles.
pub async fn dev_loop(
    mut runner: Runner,
    mut out: Box<dyn Write + Send>,
    channels: LoopChannels,
) -> Result<(), RunnerError> {
    let LoopChannels {
        mut batch_rx,
        roots_tx,
        status,
        mut shutdown_rx,
    } = channels;

    let initial = tokio::select! {
        _ = shutdown_rx.recv() => return Ok(()),
        result = runner.run_once(&mut *out) => result,
    };
    let mut first = CycleReport {
        built: runner.builds().len(),
        deployed: initial.is_ok(),
        ..CycleReport::default()
    };
    if let Err(err) = initial {
        first.fail("initial run", err);
    }
    publish(&status, runner.builds(), first).await;
    if let Err(err) = writeln!(out, "Watching for changes...") {
        tracing::debug!(error = %err, "failed to write watch banner");
    }
    if !runner.intents().is_any_auto_enabled() {
        tracing::info!("every category is manual; use `kelp trigger` to run stages");
    }

    let mut ticker = tokio::time::interval(poll_period(runner.options().poll_interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            batch = batch_rx.recv() => {
                let Some(paths) = batch else { break };
                let classified = runner.targets().apply(&paths, runner.changes());
                tracing::debug!(?classified, "queued changes");
            }
            _ = ticker.tick() => {
                let report = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    report = runner.cycle(&mut *out) => report,
                };
                if report.reloaded && roots_tx.send(runner.targets().roots()).is_err() {
                    tracing::warn!("watcher gone, roots not updated");
                }
                if !report.is_idle() {
                    publish(&status, runner.builds(), report).await;
                }
            }
        }
    }
    Ok(())
}

/// `tokio::time::interval` panics on a zero period.
fn poll_period(requested: Duration) -> Duration {
    if requested < MIN_POLL_INTERVAL {
        tracing::warn!(
            requested_ms = requested.as_millis() as u64,
            "poll interval below {}ms, clamping",
            MIN_POLL_INTERVAL.as_millis()
        );
        MIN_POLL_INTERVAL
    } else {
        requested
    }
}

async fn publish(status: &SharedStatus, builds: Vec<TaggedArtifact>, report: CycleReport) {
    let mut status = status.write().await;
    status.cycles += 1;
    status.builds = builds;
    status.last_cycle = Some(report);
}
