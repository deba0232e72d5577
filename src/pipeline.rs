//! Request pipeline facade.
//!
//! Composes the registry, authorization, both pools, and the orchestrator
//! into [`Pipeline::process_request`], and owns the background tasks (the
//! reconciliation sweep and the execution consumer feeding verification).
//!
//! A request that fails after acquiring resources is unwound before the
//! outcome is returned: allocations released, clearance revoked, ticket
//! cancelled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authorization::{AuthorizationError, AuthorizationService, ProfileStore};
use crate::clock::{Clock, MonotonicClock};
use crate::commit::{CommitService, Ledger, LocalLedger};
use crate::config::Config;
use crate::error::PurserError;
use crate::events::{EventSink, FanoutSink, JournalSink, TracingSink};
use crate::orchestrator::{run_sweep, ExecutionReport, Orchestrator, ScheduleWarning};
use crate::pool::{Allocation, PoolError, ResourcePool};
use crate::reservation::{BoardingStatus, ReservationRegistry};
use crate::verification::VerificationPipeline;

/// Identifier of the staging (gate) pool.
pub const STAGING_POOL: &str = "staging";
/// Identifier of the launch pool.
pub const LAUNCH_POOL: &str = "launch";

/// Inbound request.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Caller-chosen request identifier.
    pub request_id: String,
    /// Participants travelling with the request.
    pub participant_ids: Vec<String>,
    /// Expected execution time.
    pub estimated_duration: Duration,
    /// Opaque payload carried through execution.
    pub payload: Value,
}

/// Outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    /// Scheduled for execution.
    Approved,
    /// Refused; every acquired resource was released.
    Rejected,
}

/// Result of [`Pipeline::process_request`].
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Approved or rejected.
    pub status: OutcomeStatus,
    /// Ticket issued for the request.
    pub ticket_id: String,
    /// Clearance, when one was issued.
    pub clearance_id: Option<String>,
    /// Allocations acquired, staging first.
    pub allocation_ids: Vec<String>,
    /// Schedule, when the request was approved.
    pub schedule_id: Option<String>,
    /// Why the request was rejected.
    pub reason: Option<PurserError>,
    /// Whether the caller may retry with backoff.
    pub retryable: bool,
    /// Non-fatal scheduling warnings.
    pub warnings: Vec<ScheduleWarning>,
}

impl ProcessOutcome {
    fn rejected(
        ticket_id: String,
        clearance_id: Option<String>,
        allocation_ids: Vec<String>,
        reason: PurserError,
    ) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            ticket_id,
            clearance_id,
            allocation_ids,
            schedule_id: None,
            retryable: reason.is_retryable(),
            reason: Some(reason),
            warnings: Vec::new(),
        }
    }
}

/// The composed request lifecycle engine.
pub struct Pipeline {
    config: Config,
    clock: Arc<dyn Clock>,
    registry: Arc<ReservationRegistry>,
    authorization: Arc<AuthorizationService>,
    staging: Arc<ResourcePool>,
    launch: Arc<ResourcePool>,
    orchestrator: Arc<Orchestrator>,
    commits: Arc<CommitService>,
    verification: Arc<VerificationPipeline>,
    executions_rx: Mutex<Option<mpsc::Receiver<ExecutionReport>>>,
}

impl Pipeline {
    /// Wire every component from `config`.
    ///
    /// Events go to `tracing` and, when `events.journal_path` is set, to a
    /// JSONL journal. Commits use the in-process [`LocalLedger`].
    ///
    /// # Errors
    ///
    /// Returns an error if the journal file cannot be opened.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
        if let Some(path) = &config.events.journal_path {
            sinks.push(Arc::new(JournalSink::open(path, clock.clone())?));
        }
        Ok(Self::new(
            config,
            clock,
            Arc::new(FanoutSink::new(sinks)),
            Arc::new(LocalLedger::new()),
        ))
    }

    /// Wire every component with explicit clock, event sink, and ledger.
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let registry = Arc::new(ReservationRegistry::new(
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let authorization = Arc::new(AuthorizationService::new(
            ProfileStore::new(
                config.authorization.default_cleared,
                config.authorization.denied_participants.clone(),
            ),
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let staging = Arc::new(ResourcePool::new(
            STAGING_POOL,
            &config.pools.staging.slots,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let launch = Arc::new(ResourcePool::new(
            LAUNCH_POOL,
            &config.pools.launch.slots,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));

        let (executions_tx, executions_rx) = mpsc::channel(config.runtime.channel_buffer_size);
        let orchestrator = Orchestrator::new(
            config.timing.timing(),
            Arc::clone(&clock),
            Arc::clone(&registry),
            vec![Arc::clone(&staging), Arc::clone(&launch)],
            Arc::clone(&events),
            Some(executions_tx),
        );

        // Schedules go first so no timer fires against a released slot.
        authorization.subscribe(orchestrator.clone());
        authorization.subscribe(staging.clone());
        authorization.subscribe(launch.clone());

        let commits = Arc::new(CommitService::new(
            config.commit.approval_threshold,
            ledger,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let verification = Arc::new(VerificationPipeline::with_default_checks(
            Arc::clone(&commits),
            events,
        ));

        Self {
            config: config.clone(),
            clock,
            registry,
            authorization,
            staging,
            launch,
            orchestrator,
            commits,
            verification,
            executions_rx: Mutex::new(Some(executions_rx)),
        }
    }

    /// Run a request through reservation, clearance, allocation, and
    /// scheduling.
    ///
    /// Policy and capacity failures come back as a `Rejected` outcome with
    /// everything acquired so far released.
    ///
    /// # Errors
    ///
    /// Returns [`PurserError::InvalidRequest`] for malformed input.
    pub fn process_request(&self, request: ProcessRequest) -> Result<ProcessOutcome, PurserError> {
        let ProcessRequest {
            request_id,
            participant_ids,
            estimated_duration,
            payload,
        } = request;

        let ticket = self
            .registry
            .create_ticket(&request_id, &participant_ids, payload)?;

        let clearance = match self.authorization.issue_clearance(
            &ticket.id,
            &participant_ids,
            self.config.timing.clearance_ttl(),
        ) {
            Ok(clearance) => clearance,
            Err(AuthorizationError::ClearanceDenied { participant }) => {
                if let Err(e) = self
                    .registry
                    .update_boarding_status(&ticket.id, BoardingStatus::Denied)
                {
                    warn!(ticket_id = %ticket.id, error = %e, "failed to mark ticket denied");
                }
                self.cancel_ticket(&ticket.id, "clearance denied");
                info!(request_id = %request_id, participant = %participant, "request rejected: clearance denied");
                return Ok(ProcessOutcome::rejected(
                    ticket.id,
                    None,
                    Vec::new(),
                    PurserError::ClearanceDenied { participant },
                ));
            }
            Err(e) => {
                self.cancel_ticket(&ticket.id, "clearance failed");
                return Err(e.into());
            }
        };

        if let Err(e) = self.registry.check_in(&ticket.id) {
            warn!(ticket_id = %ticket.id, error = %e, "check-in rejected");
        }

        let mut allocations: Vec<Allocation> = Vec::with_capacity(2);
        for pool in [&self.staging, &self.launch] {
            match pool.allocate(&ticket.id, &clearance.id) {
                Ok(allocation) => allocations.push(allocation),
                Err(PoolError::PoolExhausted { pool: pool_id }) => {
                    let reason = format!("pool {pool_id} exhausted");
                    let allocation_ids = self.unwind(&ticket.id, &clearance.id, &allocations, &reason);
                    info!(request_id = %request_id, pool = %pool_id, "request rejected: pool exhausted");
                    return Ok(ProcessOutcome::rejected(
                        ticket.id,
                        Some(clearance.id),
                        allocation_ids,
                        PurserError::PoolExhausted { pool: pool_id },
                    ));
                }
                Err(e) => {
                    self.unwind(&ticket.id, &clearance.id, &allocations, "allocation failed");
                    return Err(e.into());
                }
            }
        }
        let allocation_ids: Vec<String> = allocations.iter().map(|a| a.id.clone()).collect();

        let scheduled = match self.orchestrator.schedule(
            &request_id,
            &ticket.id,
            &clearance.id,
            allocation_ids.clone(),
            estimated_duration,
        ) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                self.unwind(&ticket.id, &clearance.id, &allocations, "scheduling failed");
                return Err(e.into());
            }
        };

        info!(
            request_id = %request_id,
            ticket_id = %ticket.id,
            clearance_id = %clearance.id,
            schedule_id = %scheduled.schedule.id,
            "request approved"
        );
        Ok(ProcessOutcome {
            status: OutcomeStatus::Approved,
            ticket_id: ticket.id,
            clearance_id: Some(clearance.id),
            allocation_ids,
            schedule_id: Some(scheduled.schedule.id),
            reason: None,
            retryable: false,
            warnings: scheduled.warnings,
        })
    }

    /// Release allocations, revoke the clearance, and cancel the ticket.
    ///
    /// Returns the ids of the released allocations.
    fn unwind(
        &self,
        ticket_id: &str,
        clearance_id: &str,
        allocations: &[Allocation],
        reason: &str,
    ) -> Vec<String> {
        let ids: Vec<String> = allocations.iter().map(|a| a.id.clone()).collect();
        for allocation in allocations {
            let pool = if allocation.pool_id == STAGING_POOL {
                &self.staging
            } else {
                &self.launch
            };
            if let Err(e) = pool.release(&allocation.id, reason) {
                warn!(allocation_id = %allocation.id, error = %e, "release during unwind failed");
            }
        }
        if let Err(e) = self.authorization.revoke(clearance_id, reason) {
            warn!(clearance_id, error = %e, "revoke during unwind failed");
        }
        self.cancel_ticket(ticket_id, reason);
        debug!(ticket_id, clearance_id, released = ids.len(), "request unwound");
        ids
    }

    fn cancel_ticket(&self, ticket_id: &str, reason: &str) {
        if let Err(e) = self.registry.cancel_ticket(ticket_id, reason) {
            warn!(ticket_id, error = %e, "ticket cancellation failed");
        }
    }

    /// Revoke a clearance; dependent allocations and schedules are
    /// released before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`PurserError::NotFound`] for unknown clearances.
    pub fn revoke_clearance(&self, clearance_id: &str, reason: &str) -> Result<(), PurserError> {
        self.authorization.revoke(clearance_id, reason)?;
        Ok(())
    }

    /// Cancel a scheduled request and release its allocations.
    ///
    /// # Errors
    ///
    /// Returns [`PurserError::NotFound`] for unknown schedules.
    pub fn cancel_request(&self, schedule_id: &str, reason: &str) -> Result<(), PurserError> {
        let schedule = self.orchestrator.cancel_schedule(schedule_id, reason)?;
        self.cancel_ticket(&schedule.ticket_id, reason);
        Ok(())
    }

    /// Start the reconciliation sweep and the execution consumer.
    ///
    /// Both tasks stop when `shutdown_rx` flips to `true` or its sender is
    /// dropped. The execution consumer is started only by the first call.
    pub fn spawn_background(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        handles.push(tokio::spawn(run_sweep(
            Arc::clone(&self.orchestrator),
            self.config.timing.sweep_interval(),
            shutdown_rx.clone(),
        )));

        let receiver = match self.executions_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match receiver {
            Some(rx) => {
                let verification = Arc::clone(&self.verification);
                handles.push(tokio::spawn(consume_executions(verification, rx, shutdown_rx)));
            }
            None => warn!("execution consumer already running"),
        }
        handles
    }

    /// Resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Clock shared by every component.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reservation registry.
    pub fn registry(&self) -> &Arc<ReservationRegistry> {
        &self.registry
    }

    /// Authorization service.
    pub fn authorization(&self) -> &Arc<AuthorizationService> {
        &self.authorization
    }

    /// Staging pool.
    pub fn staging(&self) -> &Arc<ResourcePool> {
        &self.staging
    }

    /// Launch pool.
    pub fn launch(&self) -> &Arc<ResourcePool> {
        &self.launch
    }

    /// Orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Commit service.
    pub fn commits(&self) -> &Arc<CommitService> {
        &self.commits
    }

    /// Verification pipeline.
    pub fn verification(&self) -> &Arc<VerificationPipeline> {
        &self.verification
    }
}

/// Feed finished executions into verification until shutdown.
async fn consume_executions(
    verification: Arc<VerificationPipeline>,
    mut rx: mpsc::Receiver<ExecutionReport>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("execution consumer started");
    loop {
        tokio::select! {
            report = rx.recv() => {
                let Some(report) = report else {
                    break;
                };
                let record = verification
                    .verify_to_completion(&report.request_id, &report.execution_id, &report.artifacts)
                    .await;
                debug!(
                    schedule_id = %report.schedule_id,
                    verification_id = %record.id,
                    status = %record.status,
                    "execution verified"
                );
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("execution consumer stopped");
}
