//! Log routing for the `purser` binary.
//!
//! A long-running `run` writes three streams:
//! - `purser.log.YYYY-MM-DD`: every diagnostic event as JSON, filtered by `RUST_LOG`
//! - `lifecycle.log.YYYY-MM-DD`: only [`LIFECYCLE_TARGET`] events, always at `info`
//! - stderr: human-readable, filtered by `RUST_LOG`
//!
//! One-shot subcommands log to stderr only ([`init_cli`]).

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Target carried by every lifecycle event emitted through `tracing`.
pub const LIFECYCLE_TARGET: &str = "purser::lifecycle";

/// File prefix of the diagnostic log.
pub const APP_LOG_FILE: &str = "purser.log";

/// File prefix of the lifecycle event log.
pub const LIFECYCLE_LOG_FILE: &str = "lifecycle.log";

const DEFAULT_DIRECTIVES: &str = "info";

/// Keeps the non-blocking file writers alive.
///
/// Dropping it flushes both log files.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Filter for the lifecycle log: [`LIFECYCLE_TARGET`] at `info` and nothing else.
///
/// Independent of `RUST_LOG`, so quieting diagnostics never drops lifecycle
/// history.
pub fn lifecycle_filter() -> Targets {
    Targets::new().with_target(LIFECYCLE_TARGET, Level::INFO)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the production subscriber for `run`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let (app_writer, app_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, APP_LOG_FILE));
    let (lifecycle_writer, lifecycle_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(logs_dir, LIFECYCLE_LOG_FILE),
    );

    let app_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(app_writer)
        .with_filter(env_filter());

    let lifecycle_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(lifecycle_writer)
        .with_filter(lifecycle_filter());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(app_layer)
        .with(lifecycle_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard {
        _guards: vec![app_guard, lifecycle_guard],
    })
}

/// Console-only logging for one-shot subcommands, filtered by `RUST_LOG`.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}
