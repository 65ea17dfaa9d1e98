//! Pipeline configuration (`kelp.yaml`) and per-invocation run options.
//!
//! # File layout
//!
//! ```text
//! apiVersion: kelp/v1
//! build:
//!   push: false
//!   artifacts:
//!     - image: app
//!       context: ./app
//! deploy:
//!   kubectl:
//!     manifests: [k8s]
//!   namespaces: [dev]
//! ```
//!
//! Relative paths in the file are resolved against the directory holding it.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::{Artifact, ImageName, StatusCheck};

pub const CONFIG_FILE_NAME: &str = "kelp.yaml";
pub const API_VERSION: &str = "kelp/v1";
pub const DEFAULT_STATUS_CHECK_DEADLINE_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Root of `kelp.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub api_version: String,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Push images after building. Local clusters usually leave this off.
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubectl: Option<KubectlDeploy>,
    /// Namespaces the deploy always targets, in addition to discovered ones.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default = "default_deadline")]
    pub status_check_deadline_seconds: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            kubectl: None,
            namespaces: Vec::new(),
            status_check_deadline_seconds: DEFAULT_STATUS_CHECK_DEADLINE_SECS,
        }
    }
}

fn default_deadline() -> u64 {
    DEFAULT_STATUS_CHECK_DEADLINE_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubectlDeploy {
    /// Manifest files or directories of `*.yaml` / `*.yml` files.
    #[serde(default)]
    pub manifests: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
}

impl PipelineConfig {
    pub fn artifact(&self, image: &ImageName) -> Option<&Artifact> {
        self.build.artifacts.iter().find(|a| &a.image == image)
    }

    pub fn status_check_deadline(&self) -> Duration {
        Duration::from_secs(self.deploy.status_check_deadline_seconds)
    }

    /// Namespaces configured up front: the explicit list, then the kubectl default.
    pub fn configured_namespaces(&self) -> Vec<String> {
        let mut namespaces = self.deploy.namespaces.clone();
        if let Some(ns) = self
            .deploy
            .kubectl
            .as_ref()
            .and_then(|k| k.default_namespace.as_ref())
        {
            if !namespaces.contains(ns) {
                namespaces.push(ns.clone());
            }
        }
        namespaces
    }

    /// Manifest paths, empty when no kubectl deployer is configured.
    pub fn manifests(&self) -> &[PathBuf] {
        self.deploy
            .kubectl
            .as_ref()
            .map(|k| k.manifests.as_slice())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load and validate the pipeline config at `path`.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with path +
/// line context) if malformed YAML. Relative paths are made absolute against
/// the config file's directory.
pub fn load_at(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let mut config: PipelineConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if config.api_version != API_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: config.api_version,
            expected: API_VERSION,
        });
    }

    let mut seen = HashSet::new();
    for artifact in &config.build.artifacts {
        if !seen.insert(&artifact.image) {
            return Err(ConfigError::DuplicateImage {
                image: artifact.image.clone(),
            });
        }
    }

    let base = absolute_dir_of(path)?;
    make_file_paths_absolute(&mut config, &base);
    Ok(config)
}

/// Rewrite every relative path in `config` to an absolute one rooted at `base`.
///
/// Artifact contexts and kubectl manifests are rewritten; sync and test paths
/// stay relative to their artifact context. Absolute paths are normalised but
/// otherwise untouched.
pub fn make_file_paths_absolute(config: &mut PipelineConfig, base: &Path) {
    for artifact in &mut config.build.artifacts {
        artifact.context = absolutize(base, &artifact.context);
    }
    if let Some(kubectl) = config.deploy.kubectl.as_mut() {
        for manifest in &mut kubectl.manifests {
            *manifest = absolutize(base, manifest);
        }
    }
}

fn absolute_dir_of(path: &Path) -> Result<PathBuf, ConfigError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if dir.is_absolute() {
        return Ok(dir);
    }
    let cwd = std::env::current_dir().map_err(|e| io_err(&dir, e))?;
    Ok(absolutize(&cwd, &dir))
}

/// Lexically join and normalise, without touching the filesystem.
fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// Operator-supplied settings for one `kelp` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub config_file: PathBuf,
    /// Namespace override, applied to kubectl and added to the target set.
    pub namespace: Option<String>,
    pub kube_context: Option<String>,
    pub render_only: bool,
    pub status_check: StatusCheck,
    pub auto_build: bool,
    pub auto_sync: bool,
    pub auto_deploy: bool,
    pub cache_artifacts: bool,
    /// Cache file override; `None` uses `~/.kelp/cache.json`.
    pub cache_file: Option<PathBuf>,
    /// Overrides `build.push` from the config when set.
    pub push: Option<bool>,
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(CONFIG_FILE_NAME),
            namespace: None,
            kube_context: None,
            render_only: false,
            status_check: StatusCheck::Default,
            auto_build: true,
            auto_sync: true,
            auto_deploy: true,
            cache_artifacts: true,
            cache_file: None,
            push: None,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl RunOptions {
    pub fn push(&self, config: &PipelineConfig) -> bool {
        self.push.unwrap_or(config.build.push)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
