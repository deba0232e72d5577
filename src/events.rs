//! Lifecycle events: one structured event per checkpoint or state transition.
//!
//! Components emit [`LifecycleEvent`]s into an [`EventSink`]. The default
//! sink forwards to `tracing`; [`JournalSink`] appends JSON lines to a file
//! for offline inspection, and [`MemorySink`] captures events in tests.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;

/// A state transition inside the request lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Reservation confirmed and ticket issued.
    TicketIssued {
        /// Request the ticket belongs to.
        request_id: String,
        /// New ticket.
        ticket_id: String,
        /// Backing reservation.
        reservation_id: String,
    },
    /// Ticket checked in after clearance.
    TicketCheckedIn {
        /// Ticket identifier.
        ticket_id: String,
    },
    /// Ticket cancelled.
    TicketCancelled {
        /// Ticket identifier.
        ticket_id: String,
        /// Cancellation reason.
        reason: String,
    },
    /// Boarding status moved forward.
    BoardingStatusChanged {
        /// Ticket identifier.
        ticket_id: String,
        /// Previous status label.
        from: String,
        /// New status label.
        to: String,
    },
    /// Clearance issued for a ticket.
    ClearanceIssued {
        /// Ticket identifier.
        ticket_id: String,
        /// New clearance.
        clearance_id: String,
    },
    /// Clearance refused by policy.
    ClearanceDenied {
        /// Ticket identifier.
        ticket_id: String,
        /// Participant that failed the check.
        participant: String,
    },
    /// Clearance revoked.
    ClearanceRevoked {
        /// Clearance identifier.
        clearance_id: String,
        /// Revocation reason.
        reason: String,
    },
    /// Slot allocated in a pool.
    AllocationCreated {
        /// Pool identifier.
        pool: String,
        /// Slot identifier.
        slot: String,
        /// New allocation.
        allocation_id: String,
    },
    /// Allocation reached a terminal state.
    AllocationFinished {
        /// Pool identifier.
        pool: String,
        /// Allocation identifier.
        allocation_id: String,
        /// Terminal status label.
        status: String,
    },
    /// Checkpoint schedule created.
    ScheduleCreated {
        /// Schedule identifier.
        schedule_id: String,
        /// Request identifier.
        request_id: String,
        /// Whether checkpoints had to be collapsed.
        degenerate: bool,
    },
    /// Checkpoint fired.
    CheckpointFired {
        /// Schedule identifier.
        schedule_id: String,
        /// Checkpoint name.
        checkpoint: String,
        /// What fired it (`timer` or `sweep`).
        source: String,
    },
    /// Schedule reached COMPLETE.
    ScheduleCompleted {
        /// Schedule identifier.
        schedule_id: String,
        /// Execution identifier.
        execution_id: String,
    },
    /// Schedule cancelled.
    ScheduleCancelled {
        /// Schedule identifier.
        schedule_id: String,
        /// Cancellation reason.
        reason: String,
    },
    /// Verification finished.
    VerificationCompleted {
        /// Verification record identifier.
        verification_id: String,
        /// Final status label.
        status: String,
        /// Mean block confidence.
        aggregate_confidence: f64,
    },
    /// Oversight decision recorded.
    ApprovalDecided {
        /// Verification record identifier.
        verification_id: String,
        /// Decision label.
        decision: String,
    },
    /// Commit record written.
    CommitRecorded {
        /// Verification record identifier.
        verification_id: String,
        /// Commit record identifier.
        commit_id: String,
        /// Record status label.
        status: String,
    },
}

impl LifecycleEvent {
    /// Snake-case event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TicketIssued { .. } => "ticket_issued",
            Self::TicketCheckedIn { .. } => "ticket_checked_in",
            Self::TicketCancelled { .. } => "ticket_cancelled",
            Self::BoardingStatusChanged { .. } => "boarding_status_changed",
            Self::ClearanceIssued { .. } => "clearance_issued",
            Self::ClearanceDenied { .. } => "clearance_denied",
            Self::ClearanceRevoked { .. } => "clearance_revoked",
            Self::AllocationCreated { .. } => "allocation_created",
            Self::AllocationFinished { .. } => "allocation_finished",
            Self::ScheduleCreated { .. } => "schedule_created",
            Self::CheckpointFired { .. } => "checkpoint_fired",
            Self::ScheduleCompleted { .. } => "schedule_completed",
            Self::ScheduleCancelled { .. } => "schedule_cancelled",
            Self::VerificationCompleted { .. } => "verification_completed",
            Self::ApprovalDecided { .. } => "approval_decided",
            Self::CommitRecorded { .. } => "commit_recorded",
        }
    }
}

/// Destination for lifecycle events.
pub trait EventSink: Send + Sync {
    /// Record one event. Sinks must not block for long and must not panic.
    fn emit(&self, event: &LifecycleEvent);
}

/// Forwards events to `tracing` under the `purser::lifecycle` target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(
                target: crate::logging::LIFECYCLE_TARGET,
                event = event.name(),
                details = %json
            ),
            Err(e) => warn!(event = event.name(), error = %e, "failed to serialise lifecycle event"),
        }
    }
}

#[derive(Debug, Serialize)]
struct JournalEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a LifecycleEvent,
}

/// Appends events as JSON lines to a writer.
///
/// Entries are stamped with the injected clock, so a journal written under
/// a manual clock lines up with the schedule it describes.
pub struct JournalSink {
    writer: Mutex<Box<dyn Write + Send>>,
    clock: Arc<dyn Clock>,
}

impl JournalSink {
    /// Open (or create) an append-only journal file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open journal {}: {e}", path.display()))?;
        Ok(Self::from_writer(Box::new(file), clock))
    }

    /// Journal into an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer: Mutex::new(writer),
            clock,
        }
    }

    fn write_entry(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let entry = JournalEntry {
            timestamp: self.clock.now().to_rfc3339(),
            event,
        };
        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("journal lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl EventSink for JournalSink {
    fn emit(&self, event: &LifecycleEvent) {
        if let Err(e) = self.write_entry(event) {
            warn!(event = event.name(), error = %e, "failed to write journal entry");
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Names of the recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(LifecycleEvent::name).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Broadcasts each event to several sinks.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Create a fanout over the given sinks.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &LifecycleEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
