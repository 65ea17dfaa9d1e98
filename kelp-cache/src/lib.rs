//! # kelp-cache
//!
//! Fingerprint-gated build cache.
//!
//! Call [`Cache::build`] on an [`ArtifactCache`] to reuse results for artifacts
//! whose source dependencies are unchanged and build the remainder with a
//! single [`BuildAndTest`] call. [`NoCache`] always delegates the full batch.

pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod store;

pub use cache::{ArtifactCache, BuildAndTest, Cache, NoCache};
pub use error::{BuildError, CacheError};
pub use fingerprint::{fingerprint, DependencyResolver, WorkspaceResolver};
