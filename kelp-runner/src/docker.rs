//! docker CLI build backend and test runner.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use kelp_cache::{BuildAndTest, BuildError};
use kelp_core::{Artifact, ImageTags, TaggedArtifact};

use crate::dev::Tester;
use crate::exec;

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Default)]
pub struct DockerBuilder {
    push: bool,
}

impl DockerBuilder {
    pub fn new(push: bool) -> Self {
        Self { push }
    }

    /// `name:tag` for `artifact`, falling back to `latest` when untagged.
    pub fn reference(artifact: &Artifact, tags: &ImageTags) -> String {
        let tag = tags
            .get(&artifact.image)
            .map(String::as_str)
            .unwrap_or(DEFAULT_TAG);
        format!("{}:{tag}", artifact.image)
    }

    pub fn build_command(artifact: &Artifact, reference: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("build").arg("--tag").arg(reference);
        cmd.arg("--file")
            .arg(artifact.context.join(&artifact.docker.dockerfile));
        for (key, value) in &artifact.docker.build_args {
            cmd.arg("--build-arg").arg(format!("{key}={value}"));
        }
        if let Some(target) = &artifact.docker.target {
            cmd.arg("--target").arg(target);
        }
        cmd.arg(&artifact.context);
        cmd
    }

    async fn build_one(
        &self,
        out: &mut (dyn Write + Send),
        artifact: &Artifact,
        reference: &str,
    ) -> Result<(), BuildError> {
        let failed = |err: crate::error::ToolError| BuildError::Failed {
            image: artifact.image.clone(),
            message: err.to_string(),
        };

        tracing::info!(image = %artifact.image, reference, "building image");
        exec::run_to(out, Self::build_command(artifact, reference), None)
            .await
            .map_err(failed)?;

        if self.push {
            let mut push = Command::new("docker");
            push.arg("push").arg(reference);
            exec::run_to(out, push, None).await.map_err(failed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BuildAndTest for DockerBuilder {
    async fn build_and_test(
        &self,
        out: &mut (dyn Write + Send),
        tags: &ImageTags,
        artifacts: &[Arc<Artifact>],
    ) -> Result<Vec<TaggedArtifact>, BuildError> {
        let mut results = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let reference = Self::reference(artifact, tags);
            self.build_one(out, artifact, &reference).await?;
            self.test(out, artifact, &reference).await?;
            results.push(TaggedArtifact::new(artifact.image.clone(), reference));
        }
        Ok(results)
    }
}

#[async_trait]
impl Tester for DockerBuilder {
    /// Run each test command through `sh -c` in the artifact context with
    /// `IMAGE` set to the built reference.
    async fn test(
        &self,
        out: &mut (dyn Write + Send),
        artifact: &Artifact,
        reference: &str,
    ) -> Result<(), BuildError> {
        for command in artifact.test_commands() {
            tracing::info!(image = %artifact.image, command = %command, "running test");
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .current_dir(&artifact.context)
                .env("IMAGE", reference);
            exec::run_to(out, cmd, None)
                .await
                .map_err(|err| BuildError::TestFailed {
                    image: artifact.image.clone(),
                    message: err.to_string(),
                })?;
        }
        Ok(())
    }
}
