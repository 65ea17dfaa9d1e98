//! `kelp trigger`, `kelp auto`, `kelp stop`: requests to a running dev loop.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use kelp_core::Category;
use kelp_runner::{request_auto, request_stop, request_trigger, RunnerError};

use super::GlobalArgs;

/// Arguments for `kelp trigger`.
#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Category to fire: build, sync or deploy.
    pub category: Category,
}

impl TriggerArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        request_trigger(&global.socket(), self.category)
            .with_context(|| format!("failed to trigger {}", self.category))?;
        println!("{} triggered", self.category);
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

/// Arguments for `kelp auto`.
#[derive(Args, Debug)]
pub struct AutoArgs {
    /// Category to switch: build, sync or deploy.
    pub category: Category,

    #[arg(value_enum)]
    pub state: Toggle,
}

impl AutoArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let enabled = self.state == Toggle::On;
        request_auto(&global.socket(), self.category, enabled)
            .with_context(|| format!("failed to switch auto {}", self.category))?;
        let mode = if enabled { "auto" } else { "manual" };
        println!("{} is now {mode}", self.category);
        Ok(())
    }
}

pub fn stop(global: &GlobalArgs) -> Result<()> {
    match request_stop(&global.socket()) {
        Ok(()) => println!("dev loop stop requested"),
        Err(RunnerError::NotRunning { .. }) => println!("dev loop is not running"),
        Err(err) => return Err(err).context("failed to stop dev loop"),
    }
    Ok(())
}
