//! Oversight approval and idempotent commits.

use std::sync::Arc;

use purser::clock::MonotonicClock;
use purser::commit::{
    ApprovalDecision, CommitError, CommitService, CommitStatus, LocalLedger, AUTO_APPROVER,
};
use purser::events::MemorySink;
use purser::verification::VerificationBlock;

fn service(ledger: Arc<LocalLedger>) -> CommitService {
    CommitService::new(
        0.90,
        ledger,
        Arc::new(MonotonicClock::new()),
        Arc::new(MemorySink::new()),
    )
}

fn blocks(confidences: &[f64]) -> Vec<VerificationBlock> {
    confidences
        .iter()
        .enumerate()
        .map(|(n, c)| VerificationBlock::valid(&format!("aspect-{n}"), *c, "ok"))
        .collect()
}

#[test]
fn scenario_d_high_confidence_is_approved_and_committed() {
    let ledger = Arc::new(LocalLedger::new());
    let svc = service(ledger.clone());

    let decision = svc.request_approval("ver-1", &blocks(&[0.98, 0.95, 0.97]));
    let ApprovalDecision::Approved { aggregate } = decision else {
        panic!("expected approval, got {decision:?}");
    };
    assert!((aggregate - 0.9667).abs() < 1e-4);

    let record = svc.commit("ver-1", AUTO_APPROVER).expect("commit");
    assert_eq!(record.status, CommitStatus::Committed);
    assert!(record.token_id.as_deref().is_some_and(|t| !t.is_empty()));
    assert_eq!(record.approved_by, AUTO_APPROVER);
    assert_eq!(ledger.minted(), 1);
}

#[test]
fn commit_twice_returns_same_token() {
    let ledger = Arc::new(LocalLedger::new());
    let svc = service(ledger.clone());
    svc.request_approval("ver-1", &blocks(&[0.99]));

    let first = svc.commit("ver-1", AUTO_APPROVER).expect("first");
    let second = svc.commit("ver-1", "someone-else").expect("second");
    assert_eq!(first.token_id, second.token_id);
    assert_eq!(first.id, second.id);
    assert_eq!(ledger.minted(), 1);
    assert_eq!(svc.committed().len(), 1);
}

#[test]
fn low_confidence_waits_for_review() {
    let svc = service(Arc::new(LocalLedger::new()));
    let decision = svc.request_approval("ver-1", &blocks(&[0.80, 0.85]));
    assert_eq!(decision.label(), "PENDING_REVIEW");
    assert!(matches!(
        decision,
        ApprovalDecision::PendingReview { threshold, .. } if (threshold - 0.90).abs() < f64::EPSILON
    ));

    assert_eq!(
        svc.commit("ver-1", "alice").expect_err("not yet approved"),
        CommitError::NotApproved("ver-1".to_owned())
    );
    let pending = svc.pending_reviews();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].verification_id, "ver-1");

    svc.approve_review("ver-1", "alice").expect("review");
    assert!(svc.pending_reviews().is_empty());
    let record = svc.commit("ver-1", "alice").expect("commit");
    assert_eq!(record.approved_by, "alice");
}

#[test]
fn approving_unknown_review_fails() {
    let svc = service(Arc::new(LocalLedger::new()));
    assert_eq!(
        svc.approve_review("ver-missing", "alice")
            .expect_err("nothing queued"),
        CommitError::ReviewNotFound("ver-missing".to_owned())
    );
}

#[tokio::test]
async fn committed_records_are_broadcast() {
    let svc = service(Arc::new(LocalLedger::new()));
    let mut rx = svc.subscribe();
    svc.request_approval("ver-1", &blocks(&[0.95]));
    let record = svc.commit("ver-1", AUTO_APPROVER).expect("commit");

    let received = rx.recv().await.expect("broadcast");
    assert_eq!(received, record);
}
