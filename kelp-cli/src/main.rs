//! kelp: continuous build, sync and deploy for Kubernetes workloads.
//!
//! # Usage
//!
//! ```text
//! kelp dev                       watch, rebuild, sync and redeploy until stopped
//! kelp build [--json]            build every artifact once
//! kelp run                       build and deploy once
//! kelp render                    build and print the manifests that would be applied
//! kelp trigger <category>        fire build|sync|deploy in a running `kelp dev`
//! kelp auto <category> <on|off>  switch a category between auto and manual
//! kelp status [--json]           state of a running `kelp dev`
//! kelp stop                      stop a running `kelp dev`
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    build::BuildArgs,
    control::{AutoArgs, TriggerArgs},
    status::StatusArgs,
    GlobalArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "kelp",
    version,
    about = "Continuous build, sync and deploy for Kubernetes workloads",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the workspace and rebuild, sync and redeploy on change.
    Dev,

    /// Build every artifact once, reusing cached results.
    Build(BuildArgs),

    /// Build every artifact, then deploy once.
    Run,

    /// Build, then print the rendered manifests without applying them.
    Render,

    /// Fire one category on the next poll of a running dev loop.
    Trigger(TriggerArgs),

    /// Switch a category of a running dev loop between auto and manual.
    Auto(AutoArgs),

    /// Show the state of a running dev loop.
    Status(StatusArgs),

    /// Ask a running dev loop to shut down.
    Stop,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let global = cli.global;
    match cli.command {
        Commands::Dev => commands::dev::run(&global),
        Commands::Build(args) => args.run(&global),
        Commands::Run => commands::deploy::run(&global),
        Commands::Render => commands::deploy::render(&global),
        Commands::Trigger(args) => args.run(&global),
        Commands::Auto(args) => args.run(&global),
        Commands::Status(args) => args.run(&global),
        Commands::Stop => commands::control::stop(&global),
    }
}
