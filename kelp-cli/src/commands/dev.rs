//! `kelp dev`: the continuous loop, in the foreground.

use anyhow::{Context, Result};

use kelp_runner::start_blocking;

use super::GlobalArgs;

pub fn run(global: &GlobalArgs) -> Result<()> {
    start_blocking(global.run_options()).context("dev loop exited with error")
}
