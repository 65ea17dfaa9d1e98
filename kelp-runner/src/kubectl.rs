//! kubectl-backed deployer and status checker.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use tokio::process::Command;

use kelp_core::TaggedArtifact;

use crate::deploy::{Deployer, StatusChecker};
use crate::error::{tool_io_err, DeployError, ToolError};
use crate::exec;

// ---------------------------------------------------------------------------
// CLI wrapper
// ---------------------------------------------------------------------------

/// `kubectl` invocation settings shared by every adapter.
#[derive(Debug, Clone, Default)]
pub struct KubectlCli {
    pub kube_context: Option<String>,
    /// Namespace passed when a command has no explicit one.
    pub namespace: Option<String>,
}

impl KubectlCli {
    pub fn new(kube_context: Option<String>, namespace: Option<String>) -> Self {
        Self {
            kube_context,
            namespace,
        }
    }

    /// `kubectl [--context C] [--namespace N] <args>`.
    pub fn command(&self, namespace: Option<&str>, args: &[&str]) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(context) = &self.kube_context {
            cmd.arg("--context").arg(context);
        }
        if let Some(ns) = namespace.or(self.namespace.as_deref()) {
            cmd.arg("--namespace").arg(ns);
        }
        cmd.args(args);
        cmd
    }

    pub(crate) async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        namespace: Option<&str>,
        args: &[&str],
    ) -> Result<T, ToolError> {
        let output = exec::run(self.command(namespace, args), None).await?;
        serde_json::from_slice(&output.stdout).map_err(|source| ToolError::Output {
            program: "kubectl".to_string(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Kubernetes JSON shapes (only the fields read here)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct List<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ObjectMeta {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodStatus {
    #[serde(default)]
    pub phase: String,
}

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

/// A `kind: Deployment` object from the rendered manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutTarget {
    /// `None` when the manifest leaves the namespace to the kubectl default.
    pub namespace: Option<String>,
    pub name: String,
}

/// Rollout targets of the latest apply, written by [`KubectlDeployer`] and
/// read by [`KubectlStatusChecker`].
#[derive(Debug, Clone, Default)]
pub struct AppliedDeployments(Arc<Mutex<Vec<RolloutTarget>>>);

impl AppliedDeployments {
    pub fn replace(&self, targets: Vec<RolloutTarget>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = targets;
    }

    pub fn snapshot(&self) -> Vec<RolloutTarget> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Applies plain manifest files with `kubectl apply`.
#[derive(Debug, Clone)]
pub struct KubectlDeployer {
    cli: KubectlCli,
    manifests: Vec<PathBuf>,
    applied: AppliedDeployments,
}

/// Manifests with built image references substituted.
#[derive(Debug, Default, PartialEq)]
pub struct RenderedManifests {
    pub yaml: String,
    pub namespaces: Vec<String>,
    pub deployments: Vec<RolloutTarget>,
}

impl KubectlDeployer {
    pub fn new(cli: KubectlCli, manifests: Vec<PathBuf>, applied: AppliedDeployments) -> Self {
        Self {
            cli,
            manifests,
            applied,
        }
    }

    async fn render_manifests(
        &self,
        builds: &[TaggedArtifact],
    ) -> Result<RenderedManifests, ToolError> {
        let files = manifest_files(&self.manifests).await?;
        let mut sources = Vec::with_capacity(files.len());
        for file in files {
            let text = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| tool_io_err(&file, e))?;
            sources.push((file, text));
        }
        render(&sources, builds)
    }
}

#[async_trait]
impl Deployer for KubectlDeployer {
    async fn render(
        &self,
        out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<(), DeployError> {
        let rendered = self
            .render_manifests(builds)
            .await
            .map_err(DeployError::Render)?;
        out.write_all(rendered.yaml.as_bytes())
            .map_err(DeployError::Output)
    }

    async fn deploy(
        &self,
        out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<Vec<String>, DeployError> {
        let rendered = self
            .render_manifests(builds)
            .await
            .map_err(DeployError::Render)?;
        self.applied.replace(Vec::new());
        if rendered.yaml.trim().is_empty() {
            tracing::warn!("no manifests to apply");
            return Ok(rendered.namespaces);
        }

        let cmd = self.cli.command(None, &["apply", "-f", "-"]);
        exec::run_to(out, cmd, Some(rendered.yaml.into_bytes()))
            .await
            .map_err(DeployError::Apply)?;

        let targets = rendered
            .deployments
            .into_iter()
            .map(|target| RolloutTarget {
                namespace: target.namespace.or_else(|| self.cli.namespace.clone()),
                name: target.name,
            })
            .collect();
        self.applied.replace(targets);
        Ok(rendered.namespaces)
    }
}

/// Expand manifest paths: files are kept, directories contribute their
/// `*.yaml` / `*.yml` entries in name order.
async fn manifest_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>, ToolError> {
    let mut files = Vec::new();
    for path in paths {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| tool_io_err(path, e))?;
        if !meta.is_dir() {
            files.push(path.clone());
            continue;
        }
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| tool_io_err(path, e))?;
        let mut in_dir = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| tool_io_err(path, e))?
        {
            let entry_path = entry.path();
            if is_yaml(&entry_path) {
                in_dir.push(entry_path);
            }
        }
        in_dir.sort();
        files.extend(in_dir);
    }
    Ok(files)
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Split every source into documents, point `image:` fields at built tags,
/// and collect `metadata.namespace` values and Deployment names in
/// first-seen order.
pub fn render(
    sources: &[(PathBuf, String)],
    builds: &[TaggedArtifact],
) -> Result<RenderedManifests, ToolError> {
    let replacements: HashMap<&str, &str> = builds
        .iter()
        .map(|b| (b.image_name.as_str(), b.tag.as_str()))
        .collect();

    let mut rendered = RenderedManifests::default();
    for (path, text) in sources {
        for document in serde_yaml::Deserializer::from_str(text) {
            let mut value = Value::deserialize(document).map_err(|source| ToolError::Manifest {
                path: path.clone(),
                source,
            })?;
            if value.is_null() {
                continue;
            }
            replace_images(&mut value, &replacements);

            let metadata = value.get("metadata");
            let namespace = metadata
                .and_then(|m| m.get("namespace"))
                .and_then(Value::as_str);
            if let Some(ns) = namespace {
                if !rendered.namespaces.iter().any(|known| known == ns) {
                    rendered.namespaces.push(ns.to_string());
                }
            }
            let kind = value.get("kind").and_then(Value::as_str);
            let name = metadata.and_then(|m| m.get("name")).and_then(Value::as_str);
            if let (Some("Deployment"), Some(name)) = (kind, name) {
                let target = RolloutTarget {
                    namespace: namespace.map(str::to_string),
                    name: name.to_string(),
                };
                if !rendered.deployments.contains(&target) {
                    rendered.deployments.push(target);
                }
            }

            let yaml = serde_yaml::to_string(&value).map_err(|source| ToolError::Manifest {
                path: path.clone(),
                source,
            })?;
            if !rendered.yaml.is_empty() {
                rendered.yaml.push_str("---\n");
            }
            rendered.yaml.push_str(&yaml);
        }
    }
    Ok(rendered)
}

fn replace_images(value: &mut Value, replacements: &HashMap<&str, &str>) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                if key.as_str() == Some("image") {
                    if let Some(current) = child.as_str() {
                        if let Some(tag) = replacements.get(image_without_tag(current)) {
                            *child = Value::String((*tag).to_string());
                        }
                        continue;
                    }
                }
                replace_images(child, replacements);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                replace_images(item, replacements);
            }
        }
        Value::Tagged(tagged) => replace_images(&mut tagged.value, replacements),
        _ => {}
    }
}

/// `registry:5000/app:v1@sha256:..` → `registry:5000/app`.
fn image_without_tag(reference: &str) -> &str {
    let reference = reference.split('@').next().unwrap_or(reference);
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(colon) => &reference[..name_start + colon],
        None => reference,
    }
}

// ---------------------------------------------------------------------------
// Status checker
// ---------------------------------------------------------------------------

/// Waits on `kubectl rollout status` for each Deployment the last apply created.
///
/// Deployments in the cluster that the manifests do not declare are ignored.
#[derive(Debug, Clone)]
pub struct KubectlStatusChecker {
    cli: KubectlCli,
    deadline: Duration,
    applied: AppliedDeployments,
}

impl KubectlStatusChecker {
    pub fn new(cli: KubectlCli, deadline: Duration, applied: AppliedDeployments) -> Self {
        Self {
            cli,
            deadline,
            applied,
        }
    }

    fn rollout_command(&self, target: &RolloutTarget) -> Command {
        let resource = format!("deployment/{}", target.name);
        let timeout = format!("--timeout={}s", self.deadline.as_secs());
        let args = ["rollout", "status", resource.as_str(), timeout.as_str()];
        self.cli.command(target.namespace.as_deref(), &args)
    }

    async fn wait_all(
        &self,
        out: &mut (dyn Write + Send),
        namespaces: &[String],
    ) -> Result<(), ToolError> {
        let targets = self.applied.snapshot();
        tracing::debug!(?namespaces, deployments = targets.len(), "checking rollouts");

        for target in &targets {
            exec::run(self.rollout_command(target), None).await?;
            writeln!(
                out,
                " - {}:deployment/{} is ready.",
                target
                    .namespace
                    .as_deref()
                    .or(self.cli.namespace.as_deref())
                    .unwrap_or("default"),
                target.name
            )
            .map_err(|e| tool_io_err("status output", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StatusChecker for KubectlStatusChecker {
    async fn check(
        &self,
        out: &mut (dyn Write + Send),
        namespaces: &[String],
    ) -> Result<(), ToolError> {
        tokio::time::timeout(self.deadline, self.wait_all(out, namespaces))
            .await
            .map_err(|_| ToolError::Timeout {
                what: "deployments to stabilize".to_string(),
                after: self.deadline,
            })?
    }
}
