//! Slot allocation, release, and the one-holder-per-slot invariant.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use purser::clock::MonotonicClock;
use purser::events::MemorySink;
use purser::pool::{AllocationStatus, PoolError, ResourcePool, SlotSpec};
use purser::types::Priority;

fn spec(name: &str, capacity: u32, priority: Priority) -> SlotSpec {
    SlotSpec {
        name: name.to_owned(),
        capacity,
        priority,
    }
}

fn pool(specs: &[SlotSpec]) -> Arc<ResourcePool> {
    Arc::new(ResourcePool::new(
        "staging",
        specs,
        Arc::new(MonotonicClock::new()),
        Arc::new(MemorySink::new()),
    ))
}

#[test]
fn exhausted_pool_fails_fast() {
    let p = pool(&[spec("gate", 1, Priority::Standard)]);
    p.allocate("t1", "c1").expect("first");
    let err = p.allocate("t2", "c2").expect_err("full");
    assert_eq!(
        err,
        PoolError::PoolExhausted {
            pool: "staging".to_owned()
        }
    );
}

#[test]
fn high_priority_slots_are_used_after_standard() {
    let p = pool(&[
        spec("gate", 2, Priority::Standard),
        spec("gate-priority", 1, Priority::High),
    ]);
    let slots: Vec<String> = (0..3)
        .map(|n| {
            p.allocate(&format!("t{n}"), "c1")
                .expect("slot available")
                .slot_id
        })
        .collect();
    assert_eq!(slots, vec!["gate-0", "gate-1", "gate-priority-0"]);
}

#[test]
fn complete_and_release_are_idempotent() {
    let p = pool(&[spec("gate", 2, Priority::Standard)]);
    let a = p.allocate("t1", "c1").expect("allocate");

    let completed = p.complete(&a.id).expect("complete");
    assert_eq!(completed.status, AllocationStatus::Completed);
    assert!(completed.released_at.is_some());

    let again = p.release(&a.id, "late cancel").expect("no-op");
    assert_eq!(again.status, AllocationStatus::Completed);
    assert!(again.reason.is_none());
    assert_eq!(p.available(), 2);
}

#[test]
fn release_records_reason() {
    let p = pool(&[spec("gate", 1, Priority::Standard)]);
    let a = p.allocate("t1", "c1").expect("allocate");
    let released = p.release(&a.id, "weather").expect("release");
    assert_eq!(released.status, AllocationStatus::Revoked);
    assert_eq!(released.reason.as_deref(), Some("weather"));
    assert_eq!(p.active_count(), 0);
}

#[test]
fn unknown_allocation_is_not_found() {
    let p = pool(&[spec("gate", 1, Priority::Standard)]);
    assert_eq!(
        p.complete("alc-missing").expect_err("unknown"),
        PoolError::NotFound("alc-missing".to_owned())
    );
}

#[test]
fn release_for_clearance_frees_only_matching_allocations() {
    let p = pool(&[spec("gate", 3, Priority::Standard)]);
    let a = p.allocate("t1", "clr-a").expect("allocate");
    let b = p.allocate("t2", "clr-a").expect("allocate");
    let c = p.allocate("t3", "clr-b").expect("allocate");
    p.complete(&b.id).expect("complete");

    let released = p.release_for_clearance("clr-a", "revoked");
    assert_eq!(released, vec![a.id.clone()]);
    assert_eq!(p.active_count(), 1);
    assert!(p.owns(&c.id));
}

#[test]
fn concurrent_allocations_never_share_a_slot() {
    let p = pool(&[
        spec("gate", 6, Priority::Standard),
        spec("gate-priority", 2, Priority::High),
    ]);

    let handles: Vec<_> = (0..32)
        .map(|n| {
            let p = Arc::clone(&p);
            thread::spawn(move || p.allocate(&format!("t{n}"), &format!("c{n}")).ok())
        })
        .collect();
    let granted: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().expect("thread should not panic"))
        .collect();

    assert_eq!(granted.len(), 8);
    let slots: HashSet<&str> = granted.iter().map(|a| a.slot_id.as_str()).collect();
    assert_eq!(slots.len(), 8, "each slot has at most one holder");
    assert_eq!(p.occupancy().len(), 8);
    assert_eq!(p.available(), 0);
}
