//! deployd: operator CLI over the release ledger.
//!
//! Reads `deployd.toml`, opens the redb ledger, and prints runs, actions,
//! and releases as JSON for auditing. `recover` closes out work a crashed
//! process left open and must run before the orchestrator admits new work.
//!
//! # Usage
//!
//! ```text
//! deployd --config /etc/deployd/deployd.toml check-config
//! deployd --data-dir /var/lib/deployd runs shop-api
//! deployd run 6f1c2a9e-...
//! deployd recover
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use deploy_core::DeploydConfig;
use deployd_ledger::{Ledger, RedbLedger};

#[derive(Parser)]
#[command(name = "deployd", about = "deployd release orchestrator")]
struct Cli {
    /// Path to deployd.toml. Missing file means defaults.
    #[arg(long, default_value = "/etc/deployd/deployd.toml")]
    config: PathBuf,

    /// Data directory; overrides `[ledger] path` with `<dir>/ledger.redb`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse the config and print the resolved policies.
    CheckConfig,
    /// List runs for a deployment, oldest first.
    Runs {
        deployment: String,
    },
    /// Show one pipeline run.
    Run {
        id: String,
    },
    /// List all action executions.
    Actions {
        /// Only actions targeting this deployment.
        #[arg(long)]
        deployment: Option<String>,
    },
    /// Show one action execution.
    Action {
        id: String,
    },
    /// Show the last healthy release of a deployment.
    Release {
        deployment: String,
    },
    /// Mark runs and actions left open by a previous process as failed.
    Recover,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = DeploydConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::CheckConfig => {
            let pipeline = config.pipeline_policy()?;
            let actions = config.action_policy()?;
            info!(path = %cli.config.display(), "config is valid");
            print_json(&serde_json::json!({
                "ledger": ledger_path(&config, cli.data_dir.as_deref()),
                "pipeline": {
                    "gate": pipeline.gate,
                    "retry_delay_ms": pipeline.retry_delay.as_millis() as u64,
                    "scan_timeout_ms": pipeline.scan_timeout.as_millis() as u64,
                    "build_timeout_ms": pipeline.build_timeout.as_millis() as u64,
                    "deploy_timeout_ms": pipeline.deploy_timeout.as_millis() as u64,
                    "rollback_timeout_ms": pipeline.rollback_timeout.as_millis() as u64,
                    "probe_timeout_ms": pipeline.probe_timeout.as_millis() as u64,
                },
                "actions": {
                    "timeout_ms": actions.timeout.as_millis() as u64,
                    "poll_interval_ms": actions.poll_interval.as_millis() as u64,
                },
                "events": { "capacity": config.events.capacity },
            }))
        }
        Command::Runs { deployment } => {
            let ledger = open_ledger(&config, cli.data_dir.as_deref())?;
            print_json(&ledger.list_runs_for_deployment(&deployment)?)
        }
        Command::Run { id } => {
            let ledger = open_ledger(&config, cli.data_dir.as_deref())?;
            let run = ledger
                .get_run(&id)?
                .with_context(|| format!("no pipeline run {id}"))?;
            print_json(&run)
        }
        Command::Actions { deployment } => {
            let ledger = open_ledger(&config, cli.data_dir.as_deref())?;
            let mut actions = ledger.list_actions()?;
            if let Some(deployment) = deployment {
                actions.retain(|a| a.targets_deployment(&deployment));
            }
            print_json(&actions)
        }
        Command::Action { id } => {
            let ledger = open_ledger(&config, cli.data_dir.as_deref())?;
            let action = ledger
                .get_action(&id)?
                .with_context(|| format!("no action execution {id}"))?;
            print_json(&action)
        }
        Command::Release { deployment } => {
            let ledger = open_ledger(&config, cli.data_dir.as_deref())?;
            let release = ledger
                .latest_release(&deployment)?
                .with_context(|| format!("no release recorded for {deployment}"))?;
            print_json(&release)
        }
        Command::Recover => {
            let ledger = open_ledger(&config, cli.data_dir.as_deref())?;
            let report = ledger.recover_interrupted()?;
            if report.runs.is_empty() && report.actions.is_empty() {
                info!("nothing to recover");
            } else {
                warn!(
                    runs = report.runs.len(),
                    actions = report.actions.len(),
                    "interrupted executions marked failed"
                );
            }
            print_json(&report)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,deployd=debug"));
    // stdout carries only the JSON output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn ledger_path(config: &DeploydConfig, data_dir: Option<&Path>) -> PathBuf {
    match data_dir {
        Some(dir) => dir.join("ledger.redb"),
        None => config.ledger.path.clone(),
    }
}

fn open_ledger(config: &DeploydConfig, data_dir: Option<&Path>) -> anyhow::Result<RedbLedger> {
    let path = ledger_path(config, data_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let ledger = RedbLedger::open(&path).with_context(|| format!("opening ledger {}", path.display()))?;
    info!(path = %path.display(), "ledger opened");
    Ok(ledger)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
