//! Post-execution verification.
//!
//! [`VerificationPipeline::verify`] records a `Pending` result immediately
//! and runs every [`VerificationCheck`] in the background. The record is
//! `Verified` only if every block is valid; the aggregate confidence is the
//! mean of block confidences. Verified records go straight to oversight
//! and, when approved, to the commit ledger.

pub mod checks;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::commit::{ApprovalDecision, CommitService, AUTO_APPROVER};
use crate::events::{EventSink, LifecycleEvent};
use crate::orchestrator::Checkpoint;
use crate::types::{new_id, IdKind};

/// Evidence gathered from a finished execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionArtifacts {
    /// Final state of the schedule's checkpoints.
    pub checkpoints: Vec<Checkpoint>,
    /// Progress reached, in `[0, 1]`.
    pub progress: f64,
    /// Payload recorded on the ticket.
    pub expected_payload: Value,
    /// Payload carried through execution.
    pub delivered_payload: Value,
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockResult {
    /// Check passed.
    Valid,
    /// Check failed.
    Invalid,
}

/// Result of one verification check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationBlock {
    /// Aspect examined, e.g. `data_integrity`.
    pub aspect: String,
    /// Pass or fail.
    pub result: BlockResult,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable explanation.
    pub detail: String,
}

impl VerificationBlock {
    /// A passing block.
    pub fn valid(aspect: &str, confidence: f64, detail: impl Into<String>) -> Self {
        Self {
            aspect: aspect.to_owned(),
            result: BlockResult::Valid,
            confidence: confidence.clamp(0.0, 1.0),
            detail: detail.into(),
        }
    }

    /// A failing block with zero confidence.
    pub fn invalid(aspect: &str, detail: impl Into<String>) -> Self {
        Self {
            aspect: aspect.to_owned(),
            result: BlockResult::Invalid,
            confidence: 0.0,
            detail: detail.into(),
        }
    }
}

/// Mean confidence of `blocks`; zero for an empty slice.
pub fn aggregate_confidence(blocks: &[VerificationBlock]) -> f64 {
    let Ok(count) = u32::try_from(blocks.len()) else {
        return 0.0;
    };
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = blocks.iter().map(|b| b.confidence).sum();
    sum / f64::from(count)
}

/// Verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Checks still running.
    Pending,
    /// Every block valid.
    Verified,
    /// At least one block invalid.
    Rejected,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Verified => "VERIFIED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

/// Verification outcome for one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationRecord {
    /// Record identifier.
    pub id: String,
    /// Request identifier.
    pub request_id: String,
    /// Execution identifier.
    pub execution_id: String,
    /// One block per check.
    pub blocks: Vec<VerificationBlock>,
    /// Mean confidence once checks finish.
    pub aggregate_confidence: Option<f64>,
    /// Aspects whose block is invalid.
    pub failing_aspects: Vec<String>,
    /// Current status.
    pub status: VerificationStatus,
    /// Oversight decision for verified records.
    pub approval: Option<ApprovalDecision>,
}

/// A pluggable verification check.
#[async_trait]
pub trait VerificationCheck: Send + Sync {
    /// Aspect name reported on the block.
    fn aspect(&self) -> &str;

    /// Examine the artifacts and produce one block.
    async fn check(&self, artifacts: &ExecutionArtifacts) -> VerificationBlock;
}

/// Runs checks and hands verified records to oversight.
pub struct VerificationPipeline {
    checks: Vec<Arc<dyn VerificationCheck>>,
    commits: Arc<CommitService>,
    records: Mutex<HashMap<String, VerificationRecord>>,
    events: Arc<dyn EventSink>,
}

impl VerificationPipeline {
    /// Create a pipeline with the given checks.
    pub fn new(
        checks: Vec<Arc<dyn VerificationCheck>>,
        commits: Arc<CommitService>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            checks,
            commits,
            records: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Create a pipeline with [`checks::default_checks`].
    pub fn with_default_checks(commits: Arc<CommitService>, events: Arc<dyn EventSink>) -> Self {
        Self::new(checks::default_checks(), commits, events)
    }

    fn store(&self) -> MutexGuard<'_, HashMap<String, VerificationRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert_pending(&self, request_id: &str, execution_id: &str) -> VerificationRecord {
        let record = VerificationRecord {
            id: new_id(IdKind::Verification),
            request_id: request_id.to_owned(),
            execution_id: execution_id.to_owned(),
            blocks: Vec::new(),
            aggregate_confidence: None,
            failing_aspects: Vec::new(),
            status: VerificationStatus::Pending,
            approval: None,
        };
        self.store().insert(record.id.clone(), record.clone());
        record
    }

    /// Start verification and return the `Pending` record.
    ///
    /// Checks run on a spawned task; poll [`Self::record`] for the result.
    pub fn verify(
        self: &Arc<Self>,
        request_id: &str,
        execution_id: &str,
        artifacts: ExecutionArtifacts,
    ) -> VerificationRecord {
        let record = self.insert_pending(request_id, execution_id);
        let pipeline = Arc::clone(self);
        let id = record.id.clone();
        tokio::spawn(async move {
            pipeline.evaluate(&id, &artifacts).await;
        });
        record
    }

    /// Run verification inline and return the finished record.
    pub async fn verify_to_completion(
        &self,
        request_id: &str,
        execution_id: &str,
        artifacts: &ExecutionArtifacts,
    ) -> VerificationRecord {
        let record = self.insert_pending(request_id, execution_id);
        self.evaluate(&record.id, artifacts).await
    }

    async fn evaluate(&self, id: &str, artifacts: &ExecutionArtifacts) -> VerificationRecord {
        let mut blocks = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            blocks.push(check.check(artifacts).await);
        }
        let aggregate = aggregate_confidence(&blocks);
        let failing: Vec<String> = blocks
            .iter()
            .filter(|b| b.result == BlockResult::Invalid)
            .map(|b| b.aspect.clone())
            .collect();
        let status = if failing.is_empty() && !blocks.is_empty() {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Rejected
        };

        let approval = if status == VerificationStatus::Verified {
            Some(self.commits.request_approval(id, &blocks))
        } else {
            None
        };

        let record = {
            let mut records = self.store();
            let record = records
                .entry(id.to_owned())
                .or_insert_with(|| VerificationRecord {
                    id: id.to_owned(),
                    request_id: String::new(),
                    execution_id: String::new(),
                    blocks: Vec::new(),
                    aggregate_confidence: None,
                    failing_aspects: Vec::new(),
                    status: VerificationStatus::Pending,
                    approval: None,
                });
            record.blocks = blocks;
            record.aggregate_confidence = Some(aggregate);
            record.failing_aspects = failing;
            record.status = status;
            record.approval = approval.clone();
            record.clone()
        };

        if status == VerificationStatus::Verified {
            info!(verification_id = id, aggregate, "verification passed");
        } else {
            warn!(
                verification_id = id,
                failing = ?record.failing_aspects,
                "verification rejected"
            );
        }
        self.events.emit(&LifecycleEvent::VerificationCompleted {
            verification_id: id.to_owned(),
            status: status.to_string(),
            aggregate_confidence: aggregate,
        });

        if let Some(ApprovalDecision::Approved { .. }) = approval {
            if let Err(e) = self.commits.commit(id, AUTO_APPROVER) {
                warn!(verification_id = id, error = %e, "automatic commit failed");
            }
        }
        record
    }

    /// Look up a verification record.
    pub fn record(&self, verification_id: &str) -> Option<VerificationRecord> {
        self.store().get(verification_id).cloned()
    }

    /// Verification records for an execution.
    pub fn records_for_execution(&self, execution_id: &str) -> Vec<VerificationRecord> {
        self.store()
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect()
    }
}
