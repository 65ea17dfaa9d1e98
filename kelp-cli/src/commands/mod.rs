pub mod build;
pub mod control;
pub mod deploy;
pub mod dev;
pub mod status;

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};

use kelp_core::config::CONFIG_FILE_NAME;
use kelp_core::{RunOptions, StatusCheck};
use kelp_runner::paths::{socket_path, workspace_of};

/// Flags accepted by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path to the pipeline config file.
    #[arg(short = 'f', long, global = true, default_value = CONFIG_FILE_NAME)]
    pub filename: PathBuf,

    /// Namespace to deploy into; also checked for rollout status.
    #[arg(short = 'n', long, global = true)]
    pub namespace: Option<String>,

    /// kubectl context to use.
    #[arg(long, global = true)]
    pub kube_context: Option<String>,

    /// Wait for deployments to stabilize after each deploy (default: true).
    #[arg(long, global = true, value_name = "BOOL")]
    pub status_check: Option<bool>,

    /// Reuse builds whose sources did not change.
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub cache_artifacts: bool,

    /// Build cache location (default: ~/.kelp/cache.json).
    #[arg(long, global = true)]
    pub cache_file: Option<PathBuf>,

    /// Rebuild automatically on source changes.
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub auto_build: bool,

    /// Sync files automatically on change.
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub auto_sync: bool,

    /// Redeploy automatically after builds and manifest changes.
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub auto_deploy: bool,

    /// Push images after building; overrides `build.push`.
    #[arg(long, global = true, value_name = "BOOL")]
    pub push: Option<bool>,

    /// Dev loop poll interval; must be at least 1ms.
    #[arg(
        long,
        global = true,
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval: u64,
}

impl GlobalArgs {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            config_file: self.filename.clone(),
            namespace: self.namespace.clone(),
            kube_context: self.kube_context.clone(),
            render_only: false,
            status_check: StatusCheck::from_flag(self.status_check),
            auto_build: self.auto_build,
            auto_sync: self.auto_sync,
            auto_deploy: self.auto_deploy,
            cache_artifacts: self.cache_artifacts,
            cache_file: self.cache_file.clone(),
            push: self.push,
            poll_interval: Duration::from_millis(self.poll_interval),
        }
    }

    /// Control socket of the dev loop running for this config file.
    pub fn socket(&self) -> PathBuf {
        socket_path(&workspace_of(&self.filename))
    }
}
