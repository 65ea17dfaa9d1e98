//! `kelp run` and `kelp render`: one build followed by a deploy or a render.

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;

use kelp_runner::{block_on, docker_kubectl, init_tracing, Runner};

use super::GlobalArgs;

pub fn run(global: &GlobalArgs) -> Result<()> {
    init_tracing();
    let namespaces = block_on(async {
        let mut runner = Runner::load(global.run_options(), Arc::new(docker_kubectl))?;
        runner.run_once(&mut std::io::stdout()).await
    })
    .context("failed to start async runtime")?
    .context("run failed")?;

    if namespaces.is_empty() {
        println!("{}", "Deploy complete.".green());
    } else {
        println!(
            "{} namespaces: {}",
            "Deploy complete.".green(),
            namespaces.join(", ")
        );
    }
    Ok(())
}

/// Build progress goes to stderr so stdout carries only the manifests.
pub fn render(global: &GlobalArgs) -> Result<()> {
    init_tracing();
    let mut options = global.run_options();
    options.render_only = true;

    block_on(async {
        let mut runner = Runner::load(options, Arc::new(docker_kubectl))?;
        runner.build_all(&mut std::io::stderr()).await?;
        runner.render(&mut std::io::stdout()).await
    })
    .context("failed to start async runtime")?
    .context("render failed")
}
