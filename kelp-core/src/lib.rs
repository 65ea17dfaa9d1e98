//! kelp core library: domain types, pipeline config loading, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes and domain structs
//! - [`error`]: [`ConfigError`]
//! - [`config`]: load `kelp.yaml`, absolutize paths, run options
//! - [`tags`]: image tag generation

pub mod config;
pub mod error;
pub mod tags;
pub mod types;

pub use config::{PipelineConfig, RunOptions};
pub use error::ConfigError;
pub use types::{
    Artifact, Category, ImageName, ImageTags, StatusCheck, SyncItem, SyncRule, TaggedArtifact,
    TestConfig,
};
