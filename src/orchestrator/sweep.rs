//! Reconciliation sweep loop.
//!
//! Runs as a background Tokio task, ticking at a fixed interval. Each tick
//! fires every due checkpoint that its timer missed (clock drift, process
//! pause, suppressed or never-armed timer). Timers make checkpoints prompt;
//! the sweep makes them certain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Orchestrator;

/// Run the sweep until the shutdown signal is received or the watch
/// channel closes.
pub async fn run_sweep(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    info!(interval_ms, "reconciliation sweep started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fired = orchestrator.sweep_once();
                debug!(fired, "sweep tick");
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("reconciliation sweep shutting down");
                    break;
                }
            }
        }
    }

    info!("reconciliation sweep stopped");
}
