//! Built-in verification checks.

use std::sync::Arc;

use async_trait::async_trait;

use super::{BlockResult, ExecutionArtifacts, VerificationBlock, VerificationCheck};
use crate::orchestrator::{is_strictly_increasing, CheckpointKind, CheckpointStatus};

/// Confidence reported by a passing sequence check.
pub const SEQUENCE_CONFIDENCE: f64 = 0.98;
/// Confidence reported by a passing data check.
pub const DATA_CONFIDENCE: f64 = 0.95;
/// Confidence reported by a passing outcome check.
pub const OUTCOME_CONFIDENCE: f64 = 0.97;

/// The default check set: sequence, data, and outcome.
pub fn default_checks() -> Vec<Arc<dyn VerificationCheck>> {
    vec![
        Arc::new(SequenceIntegrity),
        Arc::new(DataIntegrity),
        Arc::new(OutcomeConsistency),
    ]
}

/// Every checkpoint fired, in timeline order.
#[derive(Debug, Default)]
pub struct SequenceIntegrity;

#[async_trait]
impl VerificationCheck for SequenceIntegrity {
    fn aspect(&self) -> &str {
        "sequence_integrity"
    }

    async fn check(&self, artifacts: &ExecutionArtifacts) -> VerificationBlock {
        let cps = &artifacts.checkpoints;
        let complete_timeline = cps.len() == CheckpointKind::ALL.len()
            && cps
                .iter()
                .zip(CheckpointKind::ALL)
                .all(|(cp, kind)| cp.kind == kind);
        let all_fired = cps.iter().all(|c| c.status == CheckpointStatus::Fired);
        let fired_in_order = cps
            .windows(2)
            .all(|w| match (w[0].fired_at, w[1].fired_at) {
                (Some(a), Some(b)) => a <= b,
                _ => false,
            });

        if complete_timeline && all_fired && fired_in_order && is_strictly_increasing(cps) {
            VerificationBlock::valid(self.aspect(), SEQUENCE_CONFIDENCE, "all checkpoints fired in order")
        } else {
            VerificationBlock::invalid(
                self.aspect(),
                format!(
                    "timeline complete={complete_timeline} fired={all_fired} ordered={fired_in_order}"
                ),
            )
        }
    }
}

/// The payload delivered by the execution matches the ticket's payload.
#[derive(Debug, Default)]
pub struct DataIntegrity;

#[async_trait]
impl VerificationCheck for DataIntegrity {
    fn aspect(&self) -> &str {
        "data_integrity"
    }

    async fn check(&self, artifacts: &ExecutionArtifacts) -> VerificationBlock {
        if artifacts.expected_payload == artifacts.delivered_payload {
            VerificationBlock::valid(self.aspect(), DATA_CONFIDENCE, "payload delivered unchanged")
        } else {
            VerificationBlock::invalid(self.aspect(), "delivered payload differs from ticket payload")
        }
    }
}

/// The execution reached full progress.
#[derive(Debug, Default)]
pub struct OutcomeConsistency;

#[async_trait]
impl VerificationCheck for OutcomeConsistency {
    fn aspect(&self) -> &str {
        "outcome_consistency"
    }

    async fn check(&self, artifacts: &ExecutionArtifacts) -> VerificationBlock {
        if (artifacts.progress - 1.0).abs() < f64::EPSILON {
            VerificationBlock::valid(self.aspect(), OUTCOME_CONFIDENCE, "execution reached completion")
        } else {
            VerificationBlock {
                aspect: self.aspect().to_owned(),
                result: BlockResult::Invalid,
                confidence: artifacts.progress.clamp(0.0, 1.0),
                detail: format!("execution stopped at progress {}", artifacts.progress),
            }
        }
    }
}
