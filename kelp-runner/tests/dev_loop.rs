use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kelp_cache::{
    ArtifactCache, BuildAndTest, BuildError, CacheError, DependencyResolver, NoCache,
};
use kelp_core::config::{BuildConfig, DeployConfig, API_VERSION};
use kelp_core::{Artifact, ImageTags, PipelineConfig, RunOptions, SyncItem, TaggedArtifact};
use kelp_runner::dev::{dev_loop, LoopChannels, LoopStatus};
use kelp_runner::{
    ComponentFactory, Components, DeployError, Deployer, Deployment, Intents, Runner,
    StatusChecker, Syncer, Tester, ToolError,
};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch, RwLock};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Shared, ordered record of every collaborator call.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Clone, Default)]
struct Switches {
    fail_build: Arc<AtomicBool>,
    fail_sync: Arc<AtomicBool>,
    /// When set, every build fires a one-shot deploy trigger on these intents.
    deploy_trigger: Arc<Mutex<Option<Arc<Intents>>>>,
}

struct FakeBuilder {
    log: EventLog,
    switches: Switches,
}

#[async_trait]
impl BuildAndTest for FakeBuilder {
    async fn build_and_test(
        &self,
        _out: &mut (dyn Write + Send),
        tags: &ImageTags,
        artifacts: &[Arc<Artifact>],
    ) -> Result<Vec<TaggedArtifact>, BuildError> {
        let names: Vec<&str> = artifacts.iter().map(|a| a.image.as_str()).collect();
        self.log.push(format!("build {}", names.join(",")));
        if let Some(intents) = self.switches.deploy_trigger.lock().unwrap().as_ref() {
            intents.set_deploy(true);
        }
        if self.switches.fail_build.load(Ordering::SeqCst) {
            return Err(BuildError::Failed {
                image: artifacts[0].image.clone(),
                message: "exit status 1".to_string(),
            });
        }
        Ok(artifacts
            .iter()
            .map(|a| {
                let tag = tags.get(&a.image).cloned().unwrap_or_default();
                TaggedArtifact::new(a.image.clone(), format!("{}:{tag}", a.image))
            })
            .collect())
    }
}

struct FakeTester {
    log: EventLog,
}

#[async_trait]
impl Tester for FakeTester {
    async fn test(
        &self,
        _out: &mut (dyn Write + Send),
        artifact: &Artifact,
        _reference: &str,
    ) -> Result<(), BuildError> {
        self.log.push(format!("test {}", artifact.image));
        Ok(())
    }
}

struct FakeDeployer {
    log: EventLog,
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn render(
        &self,
        _out: &mut (dyn Write + Send),
        _builds: &[TaggedArtifact],
    ) -> Result<(), DeployError> {
        self.log.push("render");
        Ok(())
    }

    async fn deploy(
        &self,
        _out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<Vec<String>, DeployError> {
        self.log.push(format!("deploy {}", builds.len()));
        Ok(vec!["dev".to_string()])
    }
}

struct FakeChecker;

#[async_trait]
impl StatusChecker for FakeChecker {
    async fn check(
        &self,
        _out: &mut (dyn Write + Send),
        _namespaces: &[String],
    ) -> Result<(), ToolError> {
        Ok(())
    }
}

struct FakeSyncer {
    log: EventLog,
    switches: Switches,
}

#[async_trait]
impl Syncer for FakeSyncer {
    async fn sync(
        &self,
        _out: &mut (dyn Write + Send),
        item: &SyncItem,
        _reference: &str,
    ) -> Result<(), ToolError> {
        self.log.push(format!("sync {}", item.image));
        if self.switches.fail_sync.load(Ordering::SeqCst) {
            return Err(ToolError::Failed {
                program: "kubectl".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "no running pods".to_string(),
            });
        }
        Ok(())
    }
}

struct NoDeps;

#[async_trait]
impl DependencyResolver for NoDeps {
    async fn resolve(&self, _artifact: &Artifact) -> Result<Vec<PathBuf>, CacheError> {
        Ok(Vec::new())
    }
}

fn factory(log: &EventLog, switches: &Switches) -> ComponentFactory {
    let log = log.clone();
    let switches = switches.clone();
    Arc::new(move |_config: &PipelineConfig, options: &RunOptions| {
        let builder = Arc::new(FakeBuilder {
            log: log.clone(),
            switches: switches.clone(),
        });
        let deployers: Vec<Arc<dyn Deployer>> = vec![Arc::new(FakeDeployer { log: log.clone() })];
        Components {
            builder,
            tester: Arc::new(FakeTester { log: log.clone() }),
            deployment: Deployment::new(deployers, Arc::new(FakeChecker))
                .with_status_check(options.status_check),
            syncer: Arc::new(FakeSyncer {
                log: log.clone(),
                switches: switches.clone(),
            }),
        }
    })
}

fn pipeline(root: &Path, images: &[&str]) -> PipelineConfig {
    PipelineConfig {
        api_version: API_VERSION.to_string(),
        build: BuildConfig {
            push: false,
            artifacts: images
                .iter()
                .map(|image| Artifact::new(*image, root.join(image)))
                .collect(),
        },
        deploy: DeployConfig::default(),
    }
}

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    log: EventLog,
    switches: Switches,
    runner: Runner,
}

fn fixture_with(images: &[&str], tweak: impl FnOnce(&mut RunOptions)) -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let mut options = RunOptions {
        config_file: root.join("kelp.yaml"),
        cache_artifacts: false,
        poll_interval: Duration::from_millis(50),
        ..RunOptions::default()
    };
    tweak(&mut options);

    let log = EventLog::default();
    let switches = Switches::default();
    let runner = Runner::new(
        options,
        pipeline(&root, images),
        Box::new(NoCache),
        factory(&log, &switches),
    );
    Fixture {
        _tmp: tmp,
        root,
        log,
        switches,
        runner,
    }
}

fn fixture(images: &[&str]) -> Fixture {
    fixture_with(images, |_| {})
}

fn sink() -> Vec<u8> {
    Vec::new()
}

// ---------------------------------------------------------------------------
// Runner::run_once / cycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_once_builds_every_artifact_then_deploys() {
    let mut fx = fixture(&["app", "api"]);

    let namespaces = fx.runner.run_once(&mut sink()).await.expect("run once");

    assert_eq!(namespaces, vec!["dev"]);
    assert_eq!(fx.log.events(), vec!["build app,api", "deploy 2"]);
    let builds = fx.runner.builds();
    assert_eq!(builds.len(), 2);
    assert!(builds[0].tag.starts_with("app:"), "tag: {}", builds[0].tag);
}

#[tokio::test]
async fn idle_cycle_does_nothing() {
    let mut fx = fixture(&["app"]);

    let report = fx.runner.cycle(&mut sink()).await;

    assert!(report.is_idle(), "report: {report:?}");
    assert!(fx.log.events().is_empty());
}

#[tokio::test]
async fn manual_build_waits_for_trigger() {
    let mut fx = fixture_with(&["app"], |o| o.auto_build = false);
    let app = fx.runner.artifacts()[0].clone();
    fx.runner.changes().add_rebuild(&app);

    let report = fx.runner.cycle(&mut sink()).await;
    assert!(report.is_idle(), "report: {report:?}");
    assert_eq!(fx.runner.changes().needs_rebuild().len(), 1);

    fx.runner.intents().set_build(true);
    let report = fx.runner.cycle(&mut sink()).await;

    assert_eq!(report.built, 1);
    assert!(report.deployed);
    assert!(fx.runner.changes().needs_rebuild().is_empty());
    assert!(!fx.runner.intents().get_intents().build, "trigger is one-shot");
    assert_eq!(fx.log.events(), vec!["build app", "deploy 1"]);
}

#[tokio::test]
async fn manual_deploy_keeps_redeploy_pending() {
    let mut fx = fixture_with(&["app"], |o| o.auto_deploy = false);
    let app = fx.runner.artifacts()[0].clone();
    fx.runner.changes().add_rebuild(&app);

    let report = fx.runner.cycle(&mut sink()).await;

    assert_eq!(report.built, 1);
    assert!(!report.deployed);
    assert!(fx.runner.changes().needs_redeploy());

    fx.runner.intents().set_deploy(true);
    let report = fx.runner.cycle(&mut sink()).await;
    assert!(report.deployed);
    assert!(!fx.runner.changes().needs_redeploy());
}

#[tokio::test]
async fn deploy_trigger_during_build_waits_for_next_cycle() {
    let mut fx = fixture_with(&["app"], |o| o.auto_deploy = false);
    *fx.switches.deploy_trigger.lock().unwrap() = Some(Arc::clone(fx.runner.intents()));
    let app = fx.runner.artifacts()[0].clone();
    fx.runner.changes().add_rebuild(&app);

    let report = fx.runner.cycle(&mut sink()).await;

    assert_eq!(report.built, 1);
    assert!(!report.deployed, "deploy decided from the start-of-cycle snapshot");
    assert!(fx.runner.intents().get_intents().deploy);
    assert!(fx.runner.changes().needs_redeploy());

    *fx.switches.deploy_trigger.lock().unwrap() = None;
    let report = fx.runner.cycle(&mut sink()).await;

    assert!(report.deployed);
    assert!(!fx.runner.intents().get_intents().deploy, "trigger is one-shot");
    assert_eq!(fx.log.events(), vec!["build app", "deploy 1"]);
}

#[tokio::test]
async fn build_failure_skips_deploy() {
    let mut fx = fixture(&["app"]);
    let app = fx.runner.artifacts()[0].clone();
    fx.switches.fail_build.store(true, Ordering::SeqCst);
    fx.runner.changes().add_rebuild(&app);
    fx.runner.changes().mark_redeploy();

    let report = fx.runner.cycle(&mut sink()).await;

    assert!(!report.deployed);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("build:"), "{:?}", report.errors);
    assert!(fx.runner.changes().needs_redeploy());
    assert_eq!(fx.log.events(), vec!["build app"]);

    fx.switches.fail_build.store(false, Ordering::SeqCst);
    fx.runner.changes().add_rebuild(&app);
    let report = fx.runner.cycle(&mut sink()).await;
    assert!(report.deployed);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn stages_run_sync_then_build_then_deploy() {
    let mut fx = fixture(&["app", "api"]);
    fx.runner.run_once(&mut sink()).await.expect("run once");
    fx.log.clear();

    let api = fx.runner.artifacts()[1].clone();
    let mut item = SyncItem::new("app");
    item.copy
        .insert(fx.root.join("app/index.html"), "/srv/index.html".to_string());
    fx.runner.changes().add_rebuild(&api);
    fx.runner.changes().add_resync(item);

    let report = fx.runner.cycle(&mut sink()).await;

    assert_eq!(report.synced, 1);
    assert_eq!(report.built, 1);
    assert!(report.deployed);
    assert_eq!(fx.log.events(), vec!["sync app", "build api", "deploy 2"]);
}

#[tokio::test]
async fn sync_failure_falls_back_to_rebuild() {
    let mut fx = fixture(&["app"]);
    fx.runner.run_once(&mut sink()).await.expect("run once");
    fx.log.clear();
    fx.switches.fail_sync.store(true, Ordering::SeqCst);

    let mut item = SyncItem::new("app");
    item.delete.insert("/srv/old.html".to_string());
    fx.runner.changes().add_resync(item);

    let report = fx.runner.cycle(&mut sink()).await;

    assert_eq!(report.synced, 0);
    assert_eq!(report.built, 1);
    assert!(report.errors[0].starts_with("sync:"), "{:?}", report.errors);
    assert_eq!(fx.log.events(), vec!["sync app", "build app", "deploy 1"]);
}

#[tokio::test]
async fn retest_skips_images_rebuilt_in_the_same_cycle() {
    let mut fx = fixture(&["app", "api"]);
    fx.runner.run_once(&mut sink()).await.expect("run once");
    fx.log.clear();

    let app = fx.runner.artifacts()[0].clone();
    let api = fx.runner.artifacts()[1].clone();
    fx.runner.changes().add_rebuild(&app);
    fx.runner.changes().add_retest(&app);
    fx.runner.changes().add_retest(&api);

    let report = fx.runner.cycle(&mut sink()).await;

    assert_eq!(report.built, 1);
    assert_eq!(report.retested, 1);
    assert_eq!(fx.log.events(), vec!["build app", "test api", "deploy 2"]);
    assert!(fx.runner.changes().needs_retest().is_empty());
}

#[tokio::test]
async fn reload_picks_up_new_artifacts_and_redeploys() {
    let mut fx = fixture(&["app"]);
    fx.runner.run_once(&mut sink()).await.expect("run once");
    fx.log.clear();

    std::fs::write(
        fx.root.join("kelp.yaml"),
        "apiVersion: kelp/v1\nbuild:\n  artifacts:\n    - image: app\n      context: app\n    - image: worker\n      context: worker\n",
    )
    .unwrap();
    fx.runner.changes().mark_reload();

    let report = fx.runner.cycle(&mut sink()).await;

    assert!(report.reloaded);
    assert_eq!(report.built, 2);
    assert!(report.deployed);
    assert_eq!(fx.runner.artifacts().len(), 2);
    assert_eq!(fx.runner.artifacts()[1].context, fx.root.join("worker"));
    assert_eq!(fx.log.events(), vec!["build app,worker", "deploy 2"]);
}

#[tokio::test]
async fn reload_failure_is_reported_and_config_kept() {
    let mut fx = fixture(&["app"]);
    std::fs::write(fx.root.join("kelp.yaml"), "apiVersion: [").unwrap();
    fx.runner.changes().mark_reload();

    let report = fx.runner.cycle(&mut sink()).await;

    assert!(!report.reloaded);
    assert!(report.errors[0].starts_with("reload:"), "{:?}", report.errors);
    assert_eq!(fx.runner.artifacts().len(), 1);
    assert!(!fx.runner.changes().needs_reload());
}

#[tokio::test]
async fn cached_artifacts_are_not_rebuilt() {
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().to_path_buf();
    let log = EventLog::default();
    let options = RunOptions {
        config_file: root.join("kelp.yaml"),
        ..RunOptions::default()
    };
    let mut runner = Runner::new(
        options,
        pipeline(&root, &["app"]),
        Box::new(ArtifactCache::in_memory(Arc::new(NoDeps))),
        factory(&log, &Switches::default()),
    );

    runner.run_once(&mut sink()).await.expect("first run");
    let first = runner.builds();
    runner.run_once(&mut sink()).await.expect("second run");

    assert_eq!(log.events(), vec!["build app", "deploy 1", "deploy 1"]);
    assert_eq!(runner.builds(), first);
}

// ---------------------------------------------------------------------------
// dev_loop task
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dev_loop_rebuilds_on_watched_change_and_stops_on_shutdown() {
    let fx = fixture(&["app"]);
    let log = fx.log.clone();
    let changed = fx.root.join("app").join("main.go");

    let (batch_tx, batch_rx) = mpsc::channel(8);
    let (roots_tx, _roots_rx) = watch::channel(Vec::new());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let status = Arc::new(RwLock::new(LoopStatus::new(Utc::now())));

    let handle = tokio::spawn(dev_loop(
        fx.runner,
        Box::new(std::io::sink()),
        LoopChannels {
            batch_rx,
            roots_tx,
            status: status.clone(),
            shutdown_rx,
        },
    ));

    for _ in 0..100 {
        if status.read().await.cycles >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    batch_tx.send(vec![changed]).await.expect("send batch");

    for _ in 0..100 {
        if status.read().await.cycles >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("join").expect("dev loop");

    assert_eq!(
        log.events(),
        vec!["build app", "deploy 1", "build app", "deploy 1"]
    );
    let status = status.read().await;
    assert_eq!(status.builds.len(), 1);
    assert_eq!(status.last_cycle.as_ref().map(|c| c.built), Some(1));
}

#[tokio::test(start_paused = true)]
async fn dev_loop_survives_zero_poll_interval() {
    let fx = fixture_with(&["app"], |o| o.poll_interval = Duration::ZERO);
    let log = fx.log.clone();
    let app = fx.runner.artifacts()[0].clone();
    let changes = Arc::clone(fx.runner.changes());

    let (_batch_tx, batch_rx) = mpsc::channel(8);
    let (roots_tx, _roots_rx) = watch::channel(Vec::new());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let status = Arc::new(RwLock::new(LoopStatus::new(Utc::now())));

    let handle = tokio::spawn(dev_loop(
        fx.runner,
        Box::new(std::io::sink()),
        LoopChannels {
            batch_rx,
            roots_tx,
            status: status.clone(),
            shutdown_rx,
        },
    ));

    for _ in 0..100 {
        if status.read().await.cycles >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    changes.add_rebuild(&app);

    for _ in 0..100 {
        if status.read().await.cycles >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("join").expect("dev loop");
    assert_eq!(
        log.events(),
        vec!["build app", "deploy 1", "build app", "deploy 1"]
    );
}
