//! External tool invocation.
//!
//! Every child is spawned with `kill_on_drop`, so dropping the returned future
//! (e.g. losing a `select!` against shutdown) terminates the process instead of
//! leaving it running in the background.

use std::io::Write;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{tool_io_err, ToolError};

/// Captured output of a successful tool run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run `cmd` to completion, optionally feeding `stdin`, and fail on non-zero exit.
pub async fn run(mut cmd: Command, stdin: Option<Vec<u8>>) -> Result<ToolOutput, ToolError> {
    let program = program_name(&cmd);
    cmd.kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    tracing::debug!(command = ?cmd.as_std(), "running tool");
    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;

    let feeder = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => Some(tokio::spawn(async move {
            let written = pipe.write_all(&input).await;
            drop(pipe);
            written
        })),
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

    if let Some(feeder) = feeder {
        match feeder.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(program = %program, error = %err, "stdin closed early"),
            Err(err) => tracing::debug!(program = %program, error = %err, "stdin feeder aborted"),
        }
    }

    if !output.status.success() {
        return Err(ToolError::Failed {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(ToolOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// [`run`], then copy the tool's stdout and stderr to `out`.
pub async fn run_to(
    out: &mut (dyn Write + Send),
    cmd: Command,
    stdin: Option<Vec<u8>>,
) -> Result<ToolOutput, ToolError> {
    let output = run(cmd, stdin).await?;
    out.write_all(&output.stdout)
        .and_then(|()| out.write_all(&output.stderr))
        .map_err(|e| tool_io_err("tool output", e))?;
    Ok(output)
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}
