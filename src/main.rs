//! Purser CLI entry point.
//!
//! Provides `run` for driving simulated requests through the full pipeline
//! and `check-config` for validating and printing the resolved
//! configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use purser::config::{self, Config};
use purser::pipeline::{OutcomeStatus, Pipeline, ProcessRequest};

/// Extra time allowed after the last expected COMPLETE checkpoint.
const COMMIT_GRACE: Duration = Duration::from_secs(5);

/// Purser: timed request lifecycle engine.
#[derive(Parser)]
#[command(name = "purser", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Drive simulated requests through the pipeline until they commit.
    Run {
        /// Number of simulated requests.
        #[arg(long, default_value_t = 3)]
        requests: u32,
        /// Config file (defaults to `$PURSER_CONFIG_PATH` or `./purser.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory for JSON log files (defaults to `~/.purser/logs`).
        #[arg(long)]
        logs_dir: Option<PathBuf>,
    },
    /// Validate the configuration and print it.
    CheckConfig {
        /// Config file (defaults to `$PURSER_CONFIG_PATH` or `./purser.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            requests,
            config,
            logs_dir,
        } => handle_run(requests, config.as_deref(), logs_dir).await,
        Command::CheckConfig { config } => handle_check_config(config.as_deref()),
    }
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

/// Validate configuration and print the resolved TOML.
fn handle_check_config(path: Option<&Path>) -> anyhow::Result<()> {
    purser::logging::init_cli();
    let config = resolve_config(path)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    println!("{rendered}");
    println!("configuration OK");
    Ok(())
}

/// Run simulated traffic through the pipeline.
async fn handle_run(
    requests: u32,
    config_path: Option<&Path>,
    logs_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let logs_dir = match logs_dir {
        Some(dir) => dir,
        None => config::config_dir()?.join("logs"),
    };
    let _logging_guard = purser::logging::init_production(&logs_dir)?;

    let config = resolve_config(config_path)?;
    let pipeline = Arc::new(Pipeline::from_config(&config).context("failed to build pipeline")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut committed_rx = pipeline.commits().subscribe();
    let handles = pipeline.spawn_background(shutdown_rx);

    let mut rng = rand::thread_rng();
    let mut approved = 0u32;
    let mut longest = Duration::ZERO;
    for n in 0..requests {
        let participants = rng.gen_range(1..=3u32);
        let duration = Duration::from_millis(rng.gen_range(2_000..=10_000u64));
        let request = ProcessRequest {
            request_id: format!("req-{n}"),
            participant_ids: (0..participants).map(|p| format!("passenger-{n}-{p}")).collect(),
            estimated_duration: duration,
            payload: serde_json::json!({ "request": n, "manifest": participants }),
        };
        match pipeline.process_request(request) {
            Ok(outcome) if outcome.status == OutcomeStatus::Approved => {
                approved = approved.saturating_add(1);
                longest = longest.max(duration);
                info!(
                    ticket_id = %outcome.ticket_id,
                    schedule_id = ?outcome.schedule_id,
                    warnings = outcome.warnings.len(),
                    "request scheduled"
                );
            }
            Ok(outcome) => {
                warn!(
                    ticket_id = %outcome.ticket_id,
                    reason = ?outcome.reason,
                    retryable = outcome.retryable,
                    "request rejected"
                );
            }
            Err(e) => warn!(error = %e, "request failed"),
        }
    }

    let lead = Duration::from_millis(config.timing.lead_time_ms);
    let deadline = lead.saturating_add(longest).saturating_add(COMMIT_GRACE);
    info!(approved, deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX), "waiting for commits");

    let mut committed = 0u32;
    let wait = async {
        while committed < approved {
            match committed_rx.recv().await {
                Ok(record) => {
                    committed = committed.saturating_add(1);
                    info!(
                        verification_id = %record.verification_id,
                        token_id = ?record.token_id,
                        "request committed"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "commit notifications lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    if tokio::time::timeout(deadline, wait).await.is_err() {
        warn!("timed out waiting for commits");
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task failed");
        }
    }

    let pending = pipeline.commits().pending_reviews().len();
    println!("requests: {requests}, approved: {approved}, committed: {committed}, awaiting review: {pending}");
    Ok(())
}
