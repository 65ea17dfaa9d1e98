//! File sync into running containers.

use std::io::Write;

use async_trait::async_trait;

use kelp_core::SyncItem;

use crate::error::{tool_io_err, ToolError};
use crate::exec;
use crate::kubectl::{KubectlCli, List, Pod};

/// Pushes changed files into containers running `reference`.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn sync(
        &self,
        out: &mut (dyn Write + Send),
        item: &SyncItem,
        reference: &str,
    ) -> Result<(), ToolError>;
}

#[derive(Debug, Clone)]
pub struct KubectlSyncer {
    cli: KubectlCli,
    namespaces: Vec<String>,
}

/// One container to copy into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub namespace: Option<String>,
    pub pod: String,
    pub container: String,
}

impl KubectlSyncer {
    pub fn new(cli: KubectlCli, namespaces: Vec<String>) -> Self {
        Self { cli, namespaces }
    }

    async fn targets(&self, reference: &str) -> Result<Vec<SyncTarget>, ToolError> {
        let namespaces: Vec<Option<String>> = if self.namespaces.is_empty() {
            vec![None]
        } else {
            self.namespaces.iter().cloned().map(Some).collect()
        };

        let mut targets = Vec::new();
        for namespace in namespaces {
            let pods: List<Pod> = self
                .cli
                .get_json(namespace.as_deref(), &["get", "pods", "-o", "json"])
                .await?;
            targets.extend(running_containers(namespace.as_deref(), &pods.items, reference));
        }
        Ok(targets)
    }

    async fn sync_target(
        &self,
        out: &mut (dyn Write + Send),
        target: &SyncTarget,
        item: &SyncItem,
    ) -> Result<(), ToolError> {
        let ns = target.namespace.as_deref();
        for (local, dest) in &item.copy {
            let local = local.to_string_lossy();
            let remote = format!("{}:{dest}", target.pod);
            let args = [
                "cp",
                local.as_ref(),
                remote.as_str(),
                "-c",
                target.container.as_str(),
            ];
            let cmd = self.cli.command(ns, &args);
            exec::run(cmd, None).await?;
        }

        if !item.delete.is_empty() {
            let mut args = vec![
                "exec",
                target.pod.as_str(),
                "-c",
                target.container.as_str(),
                "--",
                "rm",
                "-rf",
                "--",
            ];
            args.extend(item.delete.iter().map(String::as_str));
            exec::run(self.cli.command(ns, &args), None).await?;
        }

        writeln!(
            out,
            " - Synced {} file(s) to {}/{}",
            item.copy.len() + item.delete.len(),
            target.pod,
            target.container
        )
        .map_err(|e| tool_io_err("sync output", e))
    }
}

#[async_trait]
impl Syncer for KubectlSyncer {
    async fn sync(
        &self,
        out: &mut (dyn Write + Send),
        item: &SyncItem,
        reference: &str,
    ) -> Result<(), ToolError> {
        if item.is_empty() {
            return Ok(());
        }
        let targets = self.targets(reference).await?;
        if targets.is_empty() {
            tracing::warn!(image = %item.image, reference, "no running containers to sync into");
            return Ok(());
        }
        for target in &targets {
            self.sync_target(out, target, item).await?;
        }
        Ok(())
    }
}

/// Containers in running pods whose image is exactly `reference`.
pub(crate) fn running_containers(
    namespace: Option<&str>,
    pods: &[Pod],
    reference: &str,
) -> Vec<SyncTarget> {
    pods.iter()
        .filter(|pod| pod.status.phase == "Running")
        .flat_map(|pod| {
            pod.spec
                .containers
                .iter()
                .filter(|c| c.image == reference)
                .map(|c| SyncTarget {
                    namespace: namespace.map(str::to_string),
                    pod: pod.metadata.name.clone(),
                    container: c.name.clone(),
                })
        })
        .collect()
}
