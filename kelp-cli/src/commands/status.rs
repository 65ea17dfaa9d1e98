//! `kelp status`: intents, pending work and latest builds of a running dev loop.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use kelp_core::Category;
use kelp_runner::{request_status, RunnerError};

use super::GlobalArgs;

/// Arguments for `kelp status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct BuildRow {
    #[tabled(rename = "image")]
    image: String,
    #[tabled(rename = "reference")]
    tag: String,
}

impl StatusArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let socket = global.socket();
        let status = match request_status(&socket) {
            Ok(status) => status,
            Err(RunnerError::NotRunning { .. }) => json!({
                "running": false,
                "socket": socket.display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query dev loop status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render status JSON")?
            );
            return Ok(());
        }

        print_human(&status);
        Ok(())
    }
}

fn print_human(status: &Value) {
    if !status["running"].as_bool().unwrap_or(false) {
        println!("{}", "kelp dev is not running".yellow());
        return;
    }

    println!(
        "kelp dev | started {} | {} cycles",
        status["started_at"].as_str().unwrap_or("?"),
        status["cycles"].as_u64().unwrap_or(0),
    );

    for category in Category::ALL {
        let key = category.to_string();
        let auto = status["auto"][&key].as_bool().unwrap_or(false);
        let due = status["intents"][&key].as_bool().unwrap_or(false);
        let mode = if auto { "auto".green() } else { "manual".yellow() };
        let marker = if due { "■".green() } else { "■".bright_black() };
        println!("  {marker} {key:<7} {mode}");
    }

    let pending = &status["pending"];
    let mut queued = Vec::new();
    for key in ["rebuild", "resync", "retest"] {
        let images = string_list(&pending[key]);
        if !images.is_empty() {
            queued.push(format!("{key}: {}", images.join(", ")));
        }
    }
    for key in ["redeploy", "reload"] {
        if pending[key].as_bool().unwrap_or(false) {
            queued.push(key.to_string());
        }
    }
    if queued.is_empty() {
        println!("Nothing pending.");
    } else {
        println!("Pending: {}", queued.join(" | "));
    }

    let rows: Vec<BuildRow> = status["builds"]
        .as_array()
        .map(|builds| {
            builds
                .iter()
                .map(|b| BuildRow {
                    image: b["image_name"].as_str().unwrap_or_default().to_string(),
                    tag: b["tag"].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    if !rows.is_empty() {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    if let Some(errors) = status["last_cycle"]["errors"].as_array() {
        for error in errors.iter().filter_map(Value::as_str) {
            println!("{} {error}", "error:".red().bold());
        }
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
