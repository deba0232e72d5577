//! Oversight approval and the idempotent commit ledger.
//!
//! [`CommitService::request_approval`] approves when the aggregate
//! confidence reaches the configured threshold and otherwise parks the
//! verification in a review queue; it never rejects on its own. A human
//! (or another system) clears the queue with
//! [`CommitService::approve_review`].
//!
//! [`CommitService::commit`] is idempotent per verification: once a record
//! is `Committed`, later calls return it unchanged and no new token is
//! minted.

pub mod ledger;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::events::{EventSink, LifecycleEvent};
use crate::metrics;
use crate::types::{new_id, IdKind};
use crate::verification::{aggregate_confidence, VerificationBlock};

pub use ledger::{Ledger, LedgerError, LocalLedger};

/// Approver recorded for threshold-based approvals.
pub const AUTO_APPROVER: &str = "oversight:auto";

/// Capacity of the committed-record broadcast channel.
const NOTIFY_CAPACITY: usize = 64;

/// Oversight decision for a verified execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    /// Confidence met the threshold.
    Approved {
        /// Mean block confidence.
        aggregate: f64,
    },
    /// Waiting for a reviewer.
    PendingReview {
        /// Mean block confidence.
        aggregate: f64,
        /// Threshold that was not met.
        threshold: f64,
    },
}

impl ApprovalDecision {
    /// Label used in events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approved { .. } => "APPROVED",
            Self::PendingReview { .. } => "PENDING_REVIEW",
        }
    }
}

/// Commit record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitStatus {
    /// Being written.
    Pending,
    /// Sealed with a token.
    Committed,
    /// The ledger refused; may be retried.
    Failed,
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Final record for a verified execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    /// Record identifier.
    pub id: String,
    /// Verification this record seals.
    pub verification_id: String,
    /// Who approved the commit.
    pub approved_by: String,
    /// Token minted on first successful commit.
    pub token_id: Option<String>,
    /// Record status.
    pub status: CommitStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Ledger error for failed records.
    pub error: Option<String>,
}

/// A verification waiting for a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingReview {
    /// Verification identifier.
    pub verification_id: String,
    /// Mean block confidence.
    pub aggregate: f64,
    /// When the review was requested.
    pub requested_at: DateTime<Utc>,
}

/// Errors raised by the commit service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// No approval recorded for the verification.
    #[error("verification {0} has not been approved")]
    NotApproved(String),

    /// No review is waiting for the verification.
    #[error("no pending review for verification {0}")]
    ReviewNotFound(String),

    /// The ledger failed to mint a token.
    #[error("ledger failure: {0}")]
    Ledger(String),
}

#[derive(Debug, Default)]
struct CommitState {
    approvals: HashMap<String, String>,
    reviews: HashMap<String, PendingReview>,
    records: HashMap<String, CommitRecord>,
}

/// Oversight gate plus local commit ledger.
pub struct CommitService {
    threshold: f64,
    ledger: Arc<dyn Ledger>,
    state: Mutex<CommitState>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    notify: broadcast::Sender<CommitRecord>,
}

impl CommitService {
    /// Create a service approving at `threshold` and minting through `ledger`.
    pub fn new(
        threshold: f64,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            threshold,
            ledger,
            state: Mutex::new(CommitState::default()),
            clock,
            events,
            notify,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CommitState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Approval threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Receive every record that reaches `Committed`.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitRecord> {
        self.notify.subscribe()
    }

    /// Decide whether a verification may be committed.
    pub fn request_approval(
        &self,
        verification_id: &str,
        blocks: &[VerificationBlock],
    ) -> ApprovalDecision {
        let aggregate = aggregate_confidence(blocks);
        let decision = {
            let mut state = self.lock();
            if aggregate >= self.threshold {
                state.reviews.remove(verification_id);
                state
                    .approvals
                    .insert(verification_id.to_owned(), AUTO_APPROVER.to_owned());
                ApprovalDecision::Approved { aggregate }
            } else {
                state.reviews.insert(
                    verification_id.to_owned(),
                    PendingReview {
                        verification_id: verification_id.to_owned(),
                        aggregate,
                        requested_at: self.clock.now(),
                    },
                );
                ApprovalDecision::PendingReview {
                    aggregate,
                    threshold: self.threshold,
                }
            }
        };

        info!(
            verification_id,
            aggregate,
            decision = decision.label(),
            "approval decided"
        );
        self.events.emit(&LifecycleEvent::ApprovalDecided {
            verification_id: verification_id.to_owned(),
            decision: decision.label().to_owned(),
        });
        decision
    }

    /// Approve a verification parked for review.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::ReviewNotFound`] if nothing is waiting.
    pub fn approve_review(&self, verification_id: &str, approver: &str) -> Result<(), CommitError> {
        {
            let mut state = self.lock();
            if state.reviews.remove(verification_id).is_none() {
                return Err(CommitError::ReviewNotFound(verification_id.to_owned()));
            }
            state
                .approvals
                .insert(verification_id.to_owned(), approver.to_owned());
        }
        info!(verification_id, approver, "review approved");
        self.events.emit(&LifecycleEvent::ApprovalDecided {
            verification_id: verification_id.to_owned(),
            decision: "APPROVED".to_owned(),
        });
        Ok(())
    }

    /// Verifications waiting for a reviewer.
    pub fn pending_reviews(&self) -> Vec<PendingReview> {
        self.lock().reviews.values().cloned().collect()
    }

    /// Seal an approved verification with a token.
    ///
    /// Returns the existing record if the verification is already committed.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::NotApproved`] without a recorded approval, and
    /// [`CommitError::Ledger`] if minting fails (a `Failed` record is kept).
    pub fn commit(&self, verification_id: &str, approved_by: &str) -> Result<CommitRecord, CommitError> {
        let result = {
            let mut state = self.lock();
            if let Some(existing) = state.records.get(verification_id) {
                if existing.status == CommitStatus::Committed {
                    return Ok(existing.clone());
                }
            }
            if !state.approvals.contains_key(verification_id) {
                return Err(CommitError::NotApproved(verification_id.to_owned()));
            }

            let mut record = CommitRecord {
                id: new_id(IdKind::Commit),
                verification_id: verification_id.to_owned(),
                approved_by: approved_by.to_owned(),
                token_id: None,
                status: CommitStatus::Pending,
                created_at: self.clock.now(),
                error: None,
            };
            let minted = self.ledger.mint(verification_id);
            match &minted {
                Ok(token) => {
                    record.token_id = Some(token.clone());
                    record.status = CommitStatus::Committed;
                }
                Err(e) => {
                    record.status = CommitStatus::Failed;
                    record.error = Some(e.to_string());
                }
            }
            state
                .records
                .insert(verification_id.to_owned(), record.clone());
            minted.map(|_| record.clone()).map_err(|e| (record, e))
        };

        match result {
            Ok(record) => {
                info!(
                    verification_id,
                    commit_id = %record.id,
                    token_id = ?record.token_id,
                    "commit recorded"
                );
                metrics::commit_record("committed");
                self.emit_recorded(&record);
                // No receivers is fine.
                let _ = self.notify.send(record.clone());
                Ok(record)
            }
            Err((record, e)) => {
                warn!(verification_id, error = %e, "ledger refused commit");
                metrics::commit_record("failed");
                self.emit_recorded(&record);
                Err(CommitError::Ledger(e.to_string()))
            }
        }
    }

    fn emit_recorded(&self, record: &CommitRecord) {
        self.events.emit(&LifecycleEvent::CommitRecorded {
            verification_id: record.verification_id.clone(),
            commit_id: record.id.clone(),
            status: record.status.to_string(),
        });
    }

    /// Latest commit record for a verification.
    pub fn record(&self, verification_id: &str) -> Option<CommitRecord> {
        self.lock().records.get(verification_id).cloned()
    }

    /// All committed records.
    pub fn committed(&self) -> Vec<CommitRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| r.status == CommitStatus::Committed)
            .cloned()
            .collect()
    }
}
