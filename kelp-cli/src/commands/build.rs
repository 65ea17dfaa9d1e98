//! `kelp build`: one build pass through the cache.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use kelp_core::TaggedArtifact;
use kelp_runner::{block_on, docker_kubectl, init_tracing, Runner};

use super::GlobalArgs;

/// Arguments for `kelp build`.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Print the built references as JSON; build output goes to stderr.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct BuildOutputJson {
    builds: Vec<BuildJson>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildJson {
    image_name: String,
    tag: String,
}

#[derive(Tabled)]
struct BuildRow {
    #[tabled(rename = "image")]
    image: String,
    #[tabled(rename = "reference")]
    tag: String,
}

impl BuildArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        init_tracing();
        let mut out: Box<dyn Write + Send> = if self.json {
            Box::new(std::io::stderr())
        } else {
            Box::new(std::io::stdout())
        };

        let builds = block_on(async {
            let mut runner = Runner::load(global.run_options(), Arc::new(docker_kubectl))?;
            runner.build_all(&mut *out).await
        })
        .context("failed to start async runtime")?
        .context("build failed")?;

        if self.json {
            print_json(builds)
        } else {
            print_table(builds);
            Ok(())
        }
    }
}

fn print_json(builds: Vec<TaggedArtifact>) -> Result<()> {
    let payload = BuildOutputJson {
        builds: builds
            .into_iter()
            .map(|b| BuildJson {
                image_name: b.image_name.0,
                tag: b.tag,
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize build JSON")?
    );
    Ok(())
}

fn print_table(builds: Vec<TaggedArtifact>) {
    if builds.is_empty() {
        println!("No artifacts to build.");
        return;
    }
    let rows: Vec<BuildRow> = builds
        .into_iter()
        .map(|b| BuildRow {
            image: b.image_name.0,
            tag: b.tag,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
