//! The orchestrator ("purser"): checkpoint schedules, timers, and the sweep.
//!
//! Every schedule lives behind its own lock. Timer tasks, the
//! reconciliation sweep, and cancellation all take that lock before
//! touching the schedule, so a sweep racing a timer fires each checkpoint
//! exactly once. Firing a checkpoint first fires any earlier checkpoint
//! that is still pending, so actions always run in timeline order.
//!
//! Lock order is schedule lock, then registry, pool, active-index, or
//! outbox locks. Nothing in the registry or pools calls back into the
//! orchestrator.
//!
//! Finished executions that do not fit in the verification channel wait in
//! an outbox and are re-offered on every sweep.

pub mod schedule;
pub mod sweep;
mod timer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use chrono::Duration;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::authorization::RevocationListener;
use crate::clock::{self, Clock};
use crate::events::{EventSink, LifecycleEvent};
use crate::metrics;
use crate::pool::ResourcePool;
use crate::reservation::{BoardingStatus, ReservationRegistry};
use crate::types::{new_id, IdKind};
use crate::verification::ExecutionArtifacts;

pub use schedule::{
    compute_checkpoints, is_strictly_increasing, Checkpoint, CheckpointKind, CheckpointStatus,
    FireSource, Schedule, ScheduleStatus, ScheduleWarning, Timing,
};
pub use sweep::run_sweep;

use timer::TimerSet;

/// Errors raised by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Bad caller input.
    #[error("invalid schedule request: {0}")]
    InvalidRequest(String),

    /// Unknown schedule.
    #[error("schedule {0} not found")]
    NotFound(String),
}

/// A finished execution handed to verification.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Request identifier.
    pub request_id: String,
    /// Schedule that ran.
    pub schedule_id: String,
    /// Execution identifier assigned at DEPART.
    pub execution_id: String,
    /// Evidence for the verification checks.
    pub artifacts: ExecutionArtifacts,
}

/// Result of [`Orchestrator::schedule`].
#[derive(Debug, Clone)]
pub struct Scheduled {
    /// The new schedule.
    pub schedule: Schedule,
    /// Non-fatal warnings raised while computing the timeline.
    pub warnings: Vec<ScheduleWarning>,
}

struct Tracked {
    schedule: Schedule,
    timers: TimerSet,
    payload: Value,
}

type TrackedHandle = Arc<Mutex<Tracked>>;

fn lock(handle: &TrackedHandle) -> MutexGuard<'_, Tracked> {
    match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drives schedules through their checkpoints.
pub struct Orchestrator {
    timing: Timing,
    clock: Arc<dyn Clock>,
    registry: Arc<ReservationRegistry>,
    pools: Vec<Arc<ResourcePool>>,
    events: Arc<dyn EventSink>,
    executions: Option<mpsc::Sender<ExecutionReport>>,
    schedules: RwLock<HashMap<String, TrackedHandle>>,
    active: Mutex<HashSet<String>>,
    outbox: Mutex<VecDeque<ExecutionReport>>,
    weak_self: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// Finished executions are sent to `executions` when provided.
    pub fn new(
        timing: Timing,
        clock: Arc<dyn Clock>,
        registry: Arc<ReservationRegistry>,
        pools: Vec<Arc<ResourcePool>>,
        events: Arc<dyn EventSink>,
        executions: Option<mpsc::Sender<ExecutionReport>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            timing,
            clock,
            registry,
            pools,
            events,
            executions,
            schedules: RwLock::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            outbox: Mutex::new(VecDeque::new()),
            weak_self: weak_self.clone(),
        })
    }

    fn tracked(&self, schedule_id: &str) -> Result<TrackedHandle, ScheduleError> {
        let schedules = match self.schedules.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        schedules
            .get(schedule_id)
            .cloned()
            .ok_or_else(|| ScheduleError::NotFound(schedule_id.to_owned()))
    }

    fn active_ids(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pending_reports(&self) -> MutexGuard<'_, VecDeque<ExecutionReport>> {
        match self.outbox.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Handles of schedules that are still active.
    fn active_tracked(&self) -> Vec<TrackedHandle> {
        let ids: Vec<String> = self.active_ids().iter().cloned().collect();
        let schedules = match self.schedules.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        ids.iter()
            .filter_map(|id| schedules.get(id).cloned())
            .collect()
    }

    fn deactivate(&self, schedule_id: &str) {
        self.active_ids().remove(schedule_id);
    }

    fn pool_for(&self, allocation_id: &str) -> Option<&Arc<ResourcePool>> {
        self.pools.iter().find(|p| p.owns(allocation_id))
    }

    /// Compute a schedule, arm its timers, and start tracking it.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidRequest`] when the ticket is unknown
    /// or an allocation does not belong to any pool.
    pub fn schedule(
        &self,
        request_id: &str,
        ticket_id: &str,
        clearance_id: &str,
        allocation_ids: Vec<String>,
        estimated_duration: std::time::Duration,
    ) -> Result<Scheduled, ScheduleError> {
        let ticket = self
            .registry
            .ticket(ticket_id)
            .ok_or_else(|| ScheduleError::InvalidRequest(format!("unknown ticket {ticket_id}")))?;
        if allocation_ids.is_empty() {
            return Err(ScheduleError::InvalidRequest(
                "schedule requires at least one allocation".to_owned(),
            ));
        }
        if let Some(unknown) = allocation_ids
            .iter()
            .find(|id| self.pool_for(id.as_str()).is_none())
        {
            return Err(ScheduleError::InvalidRequest(format!(
                "unknown allocation {unknown}"
            )));
        }
        let duration = Duration::from_std(estimated_duration).map_err(|_| {
            ScheduleError::InvalidRequest("estimated duration out of range".to_owned())
        })?;

        let now = self.clock.now();
        let (checkpoints, warning) = compute_checkpoints(now, duration, self.timing)?;
        let warnings: Vec<ScheduleWarning> = warning.into_iter().collect();
        let schedule = Schedule {
            id: new_id(IdKind::Schedule),
            request_id: request_id.to_owned(),
            ticket_id: ticket_id.to_owned(),
            clearance_id: clearance_id.to_owned(),
            allocation_ids,
            checkpoints,
            status: ScheduleStatus::Active,
            progress: None,
            execution_id: None,
            degenerate: !warnings.is_empty(),
            created_at: now,
            cancel_reason: None,
        };
        for w in &warnings {
            warn!(schedule_id = %schedule.id, request_id, warning = %w, "schedule collapsed");
        }

        let handle = Arc::new(Mutex::new(Tracked {
            schedule: schedule.clone(),
            timers: TimerSet::default(),
            payload: ticket.payload,
        }));
        {
            let mut tracked = lock(&handle);
            match self.schedules.write() {
                Ok(mut s) => s.insert(schedule.id.clone(), Arc::clone(&handle)),
                Err(poisoned) => poisoned
                    .into_inner()
                    .insert(schedule.id.clone(), Arc::clone(&handle)),
            };
            self.active_ids().insert(schedule.id.clone());
            for cp in &schedule.checkpoints {
                let delay = clock::until(self.clock.as_ref(), cp.scheduled_at);
                tracked
                    .timers
                    .arm(self.weak_self.clone(), &schedule.id, cp.kind, delay);
            }
        }

        info!(
            schedule_id = %schedule.id,
            request_id,
            ticket_id,
            departs_at = ?schedule.departs_at(),
            degenerate = schedule.degenerate,
            "schedule created"
        );
        self.events.emit(&LifecycleEvent::ScheduleCreated {
            schedule_id: schedule.id.clone(),
            request_id: request_id.to_owned(),
            degenerate: schedule.degenerate,
        });
        Ok(Scheduled { schedule, warnings })
    }

    /// Fire `kind` (and any earlier pending checkpoint) on a schedule.
    ///
    /// Returns how many checkpoints fired; zero when `kind` already fired
    /// or the schedule is no longer active.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::NotFound`] for unknown schedules.
    pub fn fire_checkpoint(
        &self,
        schedule_id: &str,
        kind: CheckpointKind,
        source: FireSource,
    ) -> Result<usize, ScheduleError> {
        let handle = self.tracked(schedule_id)?;
        let mut tracked = lock(&handle);
        if source == FireSource::Timer {
            tracked.timers.forget(kind);
        }
        if tracked.schedule.status.is_terminal() {
            return Ok(0);
        }
        let already_fired = tracked
            .schedule
            .checkpoint(kind)
            .is_some_and(|c| c.status == CheckpointStatus::Fired);
        if already_fired {
            return Ok(0);
        }
        Ok(self.fire_through(&mut tracked, kind.index(), source))
    }

    /// Fire every pending checkpoint up to and including index `last`.
    fn fire_through(&self, tracked: &mut Tracked, last: usize, source: FireSource) -> usize {
        let mut fired = 0usize;
        for index in 0..=last {
            if tracked.schedule.status.is_terminal() {
                break;
            }
            let Some(cp) = tracked.schedule.checkpoints.get_mut(index) else {
                break;
            };
            if cp.status == CheckpointStatus::Fired {
                continue;
            }
            let kind = cp.kind;
            cp.status = CheckpointStatus::Fired;
            cp.fired_at = Some(self.clock.now());
            cp.fired_by = Some(source);
            if source == FireSource::Sweep {
                tracked.timers.disarm(kind);
            }
            fired = fired.saturating_add(1);

            debug!(
                schedule_id = %tracked.schedule.id,
                checkpoint = %kind,
                source = source.label(),
                "checkpoint fired"
            );
            metrics::checkpoint_fired(kind.label(), source.label());
            self.events.emit(&LifecycleEvent::CheckpointFired {
                schedule_id: tracked.schedule.id.clone(),
                checkpoint: kind.label().to_owned(),
                source: source.label().to_owned(),
            });
            self.apply(tracked, kind);
        }
        fired
    }

    fn apply(&self, tracked: &mut Tracked, kind: CheckpointKind) {
        let schedule_id = tracked.schedule.id.clone();
        match kind {
            CheckpointKind::Stage => {
                if let Err(e) = self
                    .registry
                    .update_boarding_status(&tracked.schedule.ticket_id, BoardingStatus::Staging)
                {
                    warn!(schedule_id = %schedule_id, error = %e, "staging transition rejected");
                }
            }
            CheckpointKind::FinalCheck => {}
            CheckpointKind::Depart => {
                let execution_id = new_id(IdKind::Execution);
                info!(schedule_id = %schedule_id, execution_id = %execution_id, "execution started");
                tracked.schedule.execution_id = Some(execution_id);
                tracked.schedule.progress = kind.progress();
            }
            CheckpointKind::Midpoint | CheckpointKind::Approach => {
                tracked.schedule.progress = kind.progress();
            }
            CheckpointKind::Complete => {
                tracked.schedule.progress = kind.progress();
                tracked.schedule.status = ScheduleStatus::Completed;
                tracked.timers.cancel_all();
                self.deactivate(&schedule_id);
                for allocation_id in &tracked.schedule.allocation_ids {
                    let result = match self.pool_for(allocation_id) {
                        Some(pool) => pool.complete(allocation_id).map(|_| ()),
                        None => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!(schedule_id = %schedule_id, allocation_id = %allocation_id, error = %e, "allocation completion failed");
                    }
                }
                self.finish_execution(tracked);
            }
        }
    }

    fn finish_execution(&self, tracked: &Tracked) {
        let schedule = &tracked.schedule;
        let execution_id = schedule
            .execution_id
            .clone()
            .unwrap_or_else(|| new_id(IdKind::Execution));
        info!(schedule_id = %schedule.id, execution_id = %execution_id, "schedule completed");
        self.events.emit(&LifecycleEvent::ScheduleCompleted {
            schedule_id: schedule.id.clone(),
            execution_id: execution_id.clone(),
        });

        let Some(tx) = &self.executions else {
            return;
        };
        let expected_payload = self
            .registry
            .ticket(&schedule.ticket_id)
            .map(|t| t.payload)
            .unwrap_or(Value::Null);
        let report = ExecutionReport {
            request_id: schedule.request_id.clone(),
            schedule_id: schedule.id.clone(),
            execution_id,
            artifacts: ExecutionArtifacts {
                checkpoints: schedule.checkpoints.clone(),
                progress: schedule.progress.unwrap_or(0.0),
                expected_payload,
                delivered_payload: tracked.payload.clone(),
            },
        };
        self.pending_reports().push_back(report);
        self.deliver_pending(tx);
    }

    /// Offer queued execution reports to verification, oldest first.
    ///
    /// Reports that do not fit stay queued. Returns how many were delivered.
    fn deliver_pending(&self, tx: &mpsc::Sender<ExecutionReport>) -> usize {
        let mut outbox = self.pending_reports();
        let mut delivered = 0usize;
        while let Some(report) = outbox.pop_front() {
            match tx.try_send(report) {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(TrySendError::Full(report)) => {
                    debug!(
                        schedule_id = %report.schedule_id,
                        queued = outbox.len().saturating_add(1),
                        "verification channel full, keeping report"
                    );
                    outbox.push_front(report);
                    break;
                }
                Err(TrySendError::Closed(report)) => {
                    warn!(
                        schedule_id = %report.schedule_id,
                        dropped = outbox.len().saturating_add(1),
                        "verification channel closed, dropping execution reports"
                    );
                    outbox.clear();
                    break;
                }
            }
        }
        delivered
    }

    /// Number of finished executions waiting for room in the verification
    /// channel.
    pub fn undelivered_count(&self) -> usize {
        self.pending_reports().len()
    }

    /// Fire every due checkpoint a timer has not fired yet.
    ///
    /// Returns the number of checkpoints fired.
    ///
    /// Queued execution reports are re-offered to verification first.
    pub fn sweep_once(&self) -> usize {
        if let Some(tx) = &self.executions {
            let delivered = self.deliver_pending(tx);
            if delivered > 0 {
                info!(delivered, "sweep delivered queued execution reports");
            }
        }
        let now = self.clock.now();
        let mut fired = 0usize;
        for handle in self.active_tracked() {
            let mut tracked = lock(&handle);
            if tracked.schedule.status.is_terminal() {
                continue;
            }
            let last_due = tracked
                .schedule
                .checkpoints
                .iter()
                .rposition(|c| c.is_due(now));
            if let Some(last) = last_due {
                let n = self.fire_through(&mut tracked, last, FireSource::Sweep);
                fired = fired.saturating_add(n);
            }
        }
        if fired > 0 {
            info!(fired, "sweep fired overdue checkpoints");
            metrics::sweep_repairs(u64::try_from(fired).unwrap_or(u64::MAX));
        }
        fired
    }

    /// Cancel a schedule, abort its timers, and release its allocations.
    ///
    /// Cancelling a finished schedule is a no-op that returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::NotFound`] for unknown schedules.
    pub fn cancel_schedule(&self, schedule_id: &str, reason: &str) -> Result<Schedule, ScheduleError> {
        let handle = self.tracked(schedule_id)?;
        let mut tracked = lock(&handle);
        if tracked.schedule.status.is_terminal() {
            return Ok(tracked.schedule.clone());
        }
        tracked.schedule.status = ScheduleStatus::Cancelled;
        tracked.schedule.cancel_reason = Some(reason.to_owned());
        let aborted = tracked.timers.cancel_all();
        self.deactivate(schedule_id);

        for allocation_id in &tracked.schedule.allocation_ids {
            let result = match self.pool_for(allocation_id) {
                Some(pool) => pool.release(allocation_id, reason).map(|_| ()),
                None => Ok(()),
            };
            if let Err(e) = result {
                warn!(schedule_id, allocation_id = %allocation_id, error = %e, "allocation release failed");
            }
        }

        info!(schedule_id, reason, aborted_timers = aborted, "schedule cancelled");
        self.events.emit(&LifecycleEvent::ScheduleCancelled {
            schedule_id: schedule_id.to_owned(),
            reason: reason.to_owned(),
        });
        Ok(tracked.schedule.clone())
    }

    /// Disarm the timer of one checkpoint without firing it.
    ///
    /// The checkpoint stays pending and is picked up by the sweep. Returns
    /// whether a timer was armed.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::NotFound`] for unknown schedules.
    pub fn suppress_timer(
        &self,
        schedule_id: &str,
        kind: CheckpointKind,
    ) -> Result<bool, ScheduleError> {
        let handle = self.tracked(schedule_id)?;
        let disarmed = lock(&handle).timers.disarm(kind);
        debug!(schedule_id, checkpoint = %kind, disarmed, "timer suppressed");
        Ok(disarmed)
    }

    /// Snapshot of a schedule.
    pub fn schedule_of(&self, schedule_id: &str) -> Option<Schedule> {
        self.tracked(schedule_id)
            .ok()
            .map(|h| lock(&h).schedule.clone())
    }

    /// Snapshots of every active schedule.
    pub fn active_schedules(&self) -> Vec<Schedule> {
        self.active_tracked()
            .iter()
            .map(|h| lock(h).schedule.clone())
            .filter(|s| s.status == ScheduleStatus::Active)
            .collect()
    }

    /// Number of armed timers that have not finished, across all schedules.
    pub fn pending_timer_count(&self) -> usize {
        self.active_tracked()
            .iter()
            .map(|h| lock(h).timers.pending())
            .sum()
    }
}

impl RevocationListener for Orchestrator {
    fn on_revoked(&self, clearance_id: &str, reason: &str) {
        let affected: Vec<String> = self
            .active_tracked()
            .iter()
            .filter_map(|h| {
                let tracked = lock(h);
                let matches = tracked.schedule.clearance_id == clearance_id
                    && !tracked.schedule.status.is_terminal();
                let id = matches.then(|| tracked.schedule.id.clone());
                id
            })
            .collect();
        for schedule_id in affected {
            let reason = format!("clearance revoked: {reason}");
            if let Err(e) = self.cancel_schedule(&schedule_id, &reason) {
                warn!(schedule_id = %schedule_id, clearance_id, error = %e, "cascade cancel failed");
            }
        }
    }
}
