//! One-shot checkpoint timers.
//!
//! Each pending checkpoint gets a tokio task that sleeps until its
//! `scheduled_at` and then fires it through the orchestrator. Timers are an
//! optimization: a timer that never runs (no runtime, aborted, process
//! pause) is covered by the reconciliation sweep.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::schedule::{CheckpointKind, FireSource};
use super::Orchestrator;

/// Armed timers of one schedule, keyed by checkpoint.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    handles: HashMap<CheckpointKind, AbortHandle>,
}

impl TimerSet {
    /// Arm a timer that fires `kind` after `delay`.
    ///
    /// Does nothing outside a tokio runtime; the sweep fires the checkpoint
    /// instead.
    pub(crate) fn arm(
        &mut self,
        orchestrator: Weak<Orchestrator>,
        schedule_id: &str,
        kind: CheckpointKind,
        delay: Duration,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(schedule_id, checkpoint = %kind, "no runtime, leaving checkpoint to the sweep");
            return;
        };
        let schedule_id = schedule_id.to_owned();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(orchestrator) = orchestrator.upgrade() else {
                return;
            };
            if let Err(e) = orchestrator.fire_checkpoint(&schedule_id, kind, FireSource::Timer) {
                trace!(schedule_id = %schedule_id, checkpoint = %kind, error = %e, "timer fire skipped");
            }
        });
        if let Some(previous) = self.handles.insert(kind, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Forget the timer for `kind` without aborting it.
    ///
    /// Used by the timer task itself once it has fired.
    pub(crate) fn forget(&mut self, kind: CheckpointKind) {
        self.handles.remove(&kind);
    }

    /// Abort the timer for `kind`. Returns whether one was armed.
    pub(crate) fn disarm(&mut self, kind: CheckpointKind) -> bool {
        match self.handles.remove(&kind) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every armed timer. Returns how many were aborted.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let count = self.handles.len();
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
        count
    }

    /// Number of armed timers that have not finished.
    pub(crate) fn pending(&self) -> usize {
        self.handles.values().filter(|h| !h.is_finished()).count()
    }
}
