//! Clearance issue, expiry, and the revocation cascade.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use purser::authorization::{
    AuthorizationError, AuthorizationService, ClearanceStatus, ProfileStore, RevocationListener,
};
use purser::clock::{Clock, ManualClock};
use purser::events::MemorySink;
use purser::pool::{AllocationStatus, ResourcePool, SlotSpec};
use purser::types::Priority;

fn participants(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|p| (*p).to_owned()).collect()
}

fn service(profiles: ProfileStore) -> (AuthorizationService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let svc = AuthorizationService::new(profiles, clock.clone(), Arc::new(MemorySink::new()));
    (svc, clock)
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, String)>>,
}

impl RevocationListener for Recorder {
    fn on_revoked(&self, clearance_id: &str, reason: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((clearance_id.to_owned(), reason.to_owned()));
        }
    }
}

#[test]
fn issue_sets_expiry_from_ttl() {
    let (svc, clock) = service(ProfileStore::new(true, Vec::new()));
    let clearance = svc
        .issue_clearance("tkt-1", &participants(&["p1", "p2"]), Duration::hours(4))
        .expect("cleared participants");

    assert!(clearance.id.starts_with("clr-"));
    assert_eq!(clearance.status, ClearanceStatus::Approved);
    assert_eq!(clearance.expires_at, clock.now() + Duration::hours(4));
}

#[test]
fn validate_is_false_at_expiry() {
    let (svc, clock) = service(ProfileStore::new(true, Vec::new()));
    let clearance = svc
        .issue_clearance("tkt-1", &participants(&["p1"]), Duration::seconds(30))
        .expect("issue");

    clock.advance(Duration::seconds(29));
    assert!(svc.validate(&clearance.id));
    clock.advance(Duration::seconds(1));
    assert!(!svc.validate(&clearance.id), "now == expires_at is expired");
    assert!(!svc.validate("clr-unknown"));
}

#[test]
fn first_uncleared_participant_is_reported() {
    let profiles = ProfileStore::new(true, participants(&["p2", "p3"]));
    let (svc, _) = service(profiles);
    let err = svc
        .issue_clearance("tkt-1", &participants(&["p1", "p2", "p3"]), Duration::hours(1))
        .expect_err("p2 is denied");
    assert_eq!(
        err,
        AuthorizationError::ClearanceDenied {
            participant: "p2".to_owned()
        }
    );
}

#[test]
fn profiles_are_created_lazily_and_can_be_updated() {
    let (svc, _) = service(ProfileStore::new(false, Vec::new()));
    assert!(svc.profiles().is_empty());

    let denied = svc.issue_clearance("tkt-1", &participants(&["p1"]), Duration::hours(1));
    assert!(denied.is_err());
    assert_eq!(svc.profiles().len(), 1);

    svc.set_profile("p1", true);
    assert!(svc
        .issue_clearance("tkt-1", &participants(&["p1"]), Duration::hours(1))
        .is_ok());
}

#[test]
fn revoke_notifies_listeners_before_returning() {
    let (svc, _) = service(ProfileStore::new(true, Vec::new()));
    let recorder = Arc::new(Recorder::default());
    svc.subscribe(recorder.clone());

    let clearance = svc
        .issue_clearance("tkt-1", &participants(&["p1"]), Duration::hours(1))
        .expect("issue");
    svc.revoke(&clearance.id, "security hold").expect("revoke");

    let calls = recorder.calls.lock().expect("lock").clone();
    assert_eq!(calls, vec![(clearance.id.clone(), "security hold".to_owned())]);
    assert!(!svc.validate(&clearance.id));

    svc.revoke(&clearance.id, "again").expect("second revoke is a no-op");
    assert_eq!(recorder.calls.lock().expect("lock").len(), 1);
    let stored = svc.clearance(&clearance.id).expect("clearance");
    assert_eq!(stored.revoke_reason.as_deref(), Some("security hold"));
}

#[test]
fn revoke_unknown_is_not_found() {
    let (svc, _) = service(ProfileStore::new(true, Vec::new()));
    let err = svc.revoke("clr-missing", "x").expect_err("unknown");
    assert_eq!(err, AuthorizationError::NotFound("clr-missing".to_owned()));
}

#[test]
fn revoke_releases_pool_allocations_in_same_call() {
    let (svc, clock) = service(ProfileStore::new(true, Vec::new()));
    let pool = Arc::new(ResourcePool::new(
        "launch",
        &[SlotSpec {
            name: "pad".to_owned(),
            capacity: 2,
            priority: Priority::Standard,
        }],
        clock,
        Arc::new(MemorySink::new()),
    ));
    svc.subscribe(pool.clone());

    let clearance = svc
        .issue_clearance("tkt-1", &participants(&["p1"]), Duration::hours(1))
        .expect("issue");
    let held = pool.allocate("tkt-1", &clearance.id).expect("allocate");
    let other = pool.allocate("tkt-2", "clr-other").expect("allocate");

    svc.revoke(&clearance.id, "revoked").expect("revoke");

    let held = pool.allocation(&held.id).expect("allocation");
    assert_eq!(held.status, AllocationStatus::Revoked);
    let other = pool.allocation(&other.id).expect("allocation");
    assert_eq!(other.status, AllocationStatus::Allocated);
    assert_eq!(pool.available(), 1);
}
