use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use kelp_core::ImageName;

/// Failure of an external tool (docker, kubectl) or of reading its inputs.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unexpected {program} output: {source}")]
    Output {
        program: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
}

/// Outcome of a failed deploy, split by the stage that failed.
///
/// `StatusCheck` means the manifests were applied and remain applied; only the
/// post-deploy verification failed.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("rendering manifests failed: {0}")]
    Render(#[source] ToolError),

    #[error("deploy failed: {0}")]
    Apply(#[source] ToolError),

    #[error("deployments did not stabilize: {0}")]
    StatusCheck(#[source] ToolError),

    #[error("failed to write deploy output: {0}")]
    Output(#[source] std::io::Error),
}

impl DeployError {
    pub fn is_status_check(&self) -> bool {
        matches!(self, DeployError::StatusCheck(_))
    }
}

/// Error surface for the dev loop, runtime, and control protocol.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] kelp_core::ConfigError),

    #[error("build error: {0}")]
    Cache(#[from] kelp_cache::CacheError),

    #[error(transparent)]
    Build(#[from] kelp_cache::BuildError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("sync failed for {image}: {source}")]
    Sync {
        image: ImageName,
        #[source]
        source: ToolError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("dev loop is not running (socket missing: {socket})")]
    NotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RunnerError {
    RunnerError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn tool_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ToolError {
    ToolError::Io {
        path: path.into(),
        source,
    }
}
