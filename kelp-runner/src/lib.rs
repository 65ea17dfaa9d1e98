//! kelp dev loop runtime: change tracking, trigger intents, deploy
//! orchestration, docker/kubectl adapters, file monitor, control socket.

pub mod changeset;
pub mod deploy;
pub mod dev;
pub mod docker;
mod error;
pub mod exec;
pub mod intents;
pub mod kubectl;
pub mod monitor;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod sync;

pub use changeset::ChangeSet;
pub use deploy::{Deployer, Deployment, StatusChecker, STABILIZE_MESSAGE};
pub use dev::{
    docker_kubectl, open_cache, ComponentFactory, Components, CycleReport, Runner, Tester,
};
pub use error::{DeployError, RunnerError, ToolError};
pub use intents::{AutoSnapshot, IntentSnapshot, Intents};
pub use protocol::{
    request_auto, request_status, request_stop, request_trigger, send_request, ControlRequest,
    ControlResponse,
};
pub use runtime::{block_on, init_tracing, run_dev, start_blocking, ControlState};
pub use sync::Syncer;
