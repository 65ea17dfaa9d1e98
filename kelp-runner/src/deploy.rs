//! Deploy orchestration: apply, collect namespaces, verify.
//!
//! One call moves through `Rendering → Applying → (StatusChecking) → Done`.
//! An apply failure ends the call before any status check. A status-check
//! failure is reported as [`DeployError::StatusCheck`] while the applied
//! manifests stay in the cluster.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexSet;

use kelp_core::{StatusCheck, TaggedArtifact};

use crate::error::{DeployError, ToolError};

pub const STABILIZE_MESSAGE: &str = "Waiting for deployments to stabilize...";

/// Applies manifests for a set of built images.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Write the manifests that `deploy` would apply, without touching the cluster.
    async fn render(
        &self,
        out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<(), DeployError>;

    /// Apply manifests and return the namespaces they declared.
    async fn deploy(
        &self,
        out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<Vec<String>, DeployError>;
}

/// Blocking post-deploy readiness verification.
#[async_trait]
pub trait StatusChecker: Send + Sync {
    async fn check(
        &self,
        out: &mut (dyn Write + Send),
        namespaces: &[String],
    ) -> Result<(), ToolError>;
}

pub struct Deployment {
    deployers: Vec<Arc<dyn Deployer>>,
    status_checker: Arc<dyn StatusChecker>,
    status_check: StatusCheck,
    render_only: bool,
    configured_namespaces: Vec<String>,
    namespace_override: Option<String>,
}

impl Deployment {
    pub fn new(deployers: Vec<Arc<dyn Deployer>>, status_checker: Arc<dyn StatusChecker>) -> Self {
        Self {
            deployers,
            status_checker,
            status_check: StatusCheck::Default,
            render_only: false,
            configured_namespaces: Vec::new(),
            namespace_override: None,
        }
    }

    pub fn with_status_check(mut self, status_check: StatusCheck) -> Self {
        self.status_check = status_check;
        self
    }

    pub fn with_render_only(mut self, render_only: bool) -> Self {
        self.render_only = render_only;
        self
    }

    pub fn with_namespaces(mut self, configured: Vec<String>, operator: Option<String>) -> Self {
        self.configured_namespaces = configured;
        self.namespace_override = operator;
        self
    }

    /// Render manifests to `out` without applying anything.
    pub async fn render(
        &self,
        out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<(), DeployError> {
        for deployer in &self.deployers {
            deployer.render(out, builds).await?;
        }
        Ok(())
    }

    /// Apply every deployer, then wait for stabilization when enabled.
    ///
    /// Returns the namespaces targeted by this deploy, configured ones first.
    pub async fn deploy(
        &self,
        out: &mut (dyn Write + Send),
        builds: &[TaggedArtifact],
    ) -> Result<Vec<String>, DeployError> {
        if self.render_only {
            self.render(out, builds).await?;
            return Ok(Vec::new());
        }

        let mut discovered = Vec::new();
        for deployer in &self.deployers {
            discovered.extend(deployer.deploy(out, builds).await?);
        }
        let namespaces = self.target_namespaces(discovered);
        tracing::debug!(namespaces = ?namespaces, "deploy applied");

        if !self.status_check.is_enabled() {
            return Ok(namespaces);
        }

        writeln!(out, "{STABILIZE_MESSAGE}").map_err(DeployError::Output)?;
        self.status_checker
            .check(out, &namespaces)
            .await
            .map_err(DeployError::StatusCheck)?;
        Ok(namespaces)
    }

    fn target_namespaces(&self, discovered: Vec<String>) -> Vec<String> {
        let ordered: IndexSet<String> = self
            .configured_namespaces
            .iter()
            .cloned()
            .chain(self.namespace_override.clone())
            .chain(discovered)
            .filter(|ns| !ns.is_empty())
            .collect();
        ordered.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDeployer;

    #[async_trait]
    impl Deployer for NullDeployer {
        async fn render(
            &self,
            _out: &mut (dyn Write + Send),
            _builds: &[TaggedArtifact],
        ) -> Result<(), DeployError> {
            Ok(())
        }

        async fn deploy(
            &self,
            _out: &mut (dyn Write + Send),
            _builds: &[TaggedArtifact],
        ) -> Result<Vec<String>, DeployError> {
            Ok(vec!["b".to_string(), "a".to_string(), String::new()])
        }
    }

    struct NullChecker;

    #[async_trait]
    impl StatusChecker for NullChecker {
        async fn check(
            &self,
            _out: &mut (dyn Write + Send),
            _namespaces: &[String],
        ) -> Result<(), ToolError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn override_sits_between_configured_and_discovered() {
        let deployment = Deployment::new(vec![Arc::new(NullDeployer)], Arc::new(NullChecker))
            .with_namespaces(vec!["a".to_string()], Some("ops".to_string()));

        let namespaces = deployment
            .deploy(&mut Vec::<u8>::new(), &[])
            .await
            .expect("deploy");
        assert_eq!(namespaces, vec!["a", "ops", "b"]);
    }
}
