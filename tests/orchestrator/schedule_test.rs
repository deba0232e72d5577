//! Schedule creation, checkpoint actions, and cancellation.
//!
//! These run without a tokio runtime, so no timers are armed and every
//! checkpoint is fired explicitly or by `sweep_once`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use purser::authorization::{AuthorizationService, ProfileStore};
use purser::clock::ManualClock;
use purser::events::MemorySink;
use purser::orchestrator::{
    is_strictly_increasing, CheckpointKind, CheckpointStatus, ExecutionReport, FireSource,
    Orchestrator, ScheduleError, ScheduleStatus, ScheduleWarning, Timing,
};
use purser::pool::{AllocationStatus, ResourcePool, SlotSpec};
use purser::reservation::{BoardingStatus, ReservationRegistry};
use purser::types::Priority;
use serde_json::json;
use tokio::sync::mpsc;

struct Harness {
    clock: Arc<ManualClock>,
    registry: Arc<ReservationRegistry>,
    staging: Arc<ResourcePool>,
    launch: Arc<ResourcePool>,
    orchestrator: Arc<Orchestrator>,
    executions: mpsc::Receiver<ExecutionReport>,
    events: Arc<MemorySink>,
}

struct Booked {
    ticket_id: String,
    allocation_ids: Vec<String>,
}

fn pool(id: &str, clock: &Arc<ManualClock>, events: &Arc<MemorySink>) -> Arc<ResourcePool> {
    Arc::new(ResourcePool::new(
        id,
        &[SlotSpec {
            name: id.to_owned(),
            capacity: 2,
            priority: Priority::Standard,
        }],
        clock.clone(),
        events.clone(),
    ))
}

fn harness() -> Harness {
    harness_with_channel(8)
}

fn harness_with_channel(capacity: usize) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = Arc::new(MemorySink::new());
    let registry = Arc::new(ReservationRegistry::new(clock.clone(), events.clone()));
    let staging = pool("staging", &clock, &events);
    let launch = pool("launch", &clock, &events);
    let (tx, executions) = mpsc::channel(capacity);
    let orchestrator = Orchestrator::new(
        Timing {
            lead_time: Duration::minutes(5),
            unit_lead: Duration::minutes(1),
        },
        clock.clone(),
        registry.clone(),
        vec![staging.clone(), launch.clone()],
        events.clone(),
        Some(tx),
    );
    Harness {
        clock,
        registry,
        staging,
        launch,
        orchestrator,
        executions,
        events,
    }
}

fn book(h: &Harness, clearance_id: &str) -> Booked {
    let ticket = h
        .registry
        .create_ticket("req-1", &["p1".to_owned()], json!({"cargo": 3}))
        .expect("ticket");
    let staging = h.staging.allocate(&ticket.id, clearance_id).expect("staging");
    let launch = h.launch.allocate(&ticket.id, clearance_id).expect("launch");
    Booked {
        ticket_id: ticket.id,
        allocation_ids: vec![staging.id, launch.id],
    }
}

fn thirty_minutes() -> std::time::Duration {
    std::time::Duration::from_secs(1800)
}

#[test]
fn schedule_produces_strictly_increasing_timeline() {
    let h = harness();
    let booked = book(&h, "clr-1");
    let scheduled = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            booked.allocation_ids,
            thirty_minutes(),
        )
        .expect("schedule");

    let schedule = scheduled.schedule;
    assert!(schedule.id.starts_with("sch-"));
    assert!(scheduled.warnings.is_empty());
    assert!(!schedule.degenerate);
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.checkpoints.len(), 6);
    assert!(is_strictly_increasing(&schedule.checkpoints));
    assert!(schedule
        .checkpoints
        .iter()
        .all(|c| c.status == CheckpointStatus::Pending));
}

#[test]
fn short_duration_is_degenerate_but_accepted() {
    let h = harness();
    let booked = book(&h, "clr-1");
    let scheduled = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            booked.allocation_ids,
            std::time::Duration::from_secs(30),
        )
        .expect("degenerate schedules are not errors");

    assert_eq!(
        scheduled.warnings,
        vec![ScheduleWarning::DegenerateSchedule {
            duration_ms: 30_000
        }]
    );
    assert!(scheduled.schedule.degenerate);
    assert!(is_strictly_increasing(&scheduled.schedule.checkpoints));
}

#[test]
fn unknown_ticket_or_allocation_is_rejected() {
    let h = harness();
    let err = h
        .orchestrator
        .schedule("req-1", "tkt-missing", "clr-1", vec![], thirty_minutes())
        .expect_err("unknown ticket");
    assert!(matches!(err, ScheduleError::InvalidRequest(_)));

    let booked = book(&h, "clr-1");
    let err = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            vec!["alc-missing".to_owned()],
            thirty_minutes(),
        )
        .expect_err("unknown allocation");
    assert!(matches!(err, ScheduleError::InvalidRequest(_)));
}

#[test]
fn firing_a_checkpoint_catches_up_earlier_ones() {
    let h = harness();
    let booked = book(&h, "clr-1");
    let schedule = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            booked.allocation_ids,
            thirty_minutes(),
        )
        .expect("schedule")
        .schedule;

    let fired = h
        .orchestrator
        .fire_checkpoint(&schedule.id, CheckpointKind::Midpoint, FireSource::Timer)
        .expect("fire");
    assert_eq!(fired, 4);

    let snapshot = h.orchestrator.schedule_of(&schedule.id).expect("schedule");
    assert_eq!(snapshot.progress, Some(0.5));
    assert!(snapshot.execution_id.is_some());
    let fired_at: Vec<_> = snapshot
        .checkpoints
        .iter()
        .take(4)
        .map(|c| c.fired_at.expect("fired"))
        .collect();
    assert!(fired_at.windows(2).all(|w| w[0] <= w[1]));

    let ticket = h.registry.ticket(&booked.ticket_id).expect("ticket");
    assert_eq!(ticket.boarding_status, BoardingStatus::Staging);

    let again = h
        .orchestrator
        .fire_checkpoint(&schedule.id, CheckpointKind::Stage, FireSource::Sweep)
        .expect("fire");
    assert_eq!(again, 0, "checkpoints fire exactly once");
}

#[test]
fn sweep_runs_schedule_to_completion() {
    let mut h = harness();
    let booked = book(&h, "clr-1");
    let schedule = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            booked.allocation_ids.clone(),
            thirty_minutes(),
        )
        .expect("schedule")
        .schedule;

    assert_eq!(h.orchestrator.sweep_once(), 0);
    h.clock.advance(Duration::minutes(2));
    assert_eq!(h.orchestrator.sweep_once(), 1, "only STAGE is due");

    h.clock.advance(Duration::minutes(40));
    assert_eq!(h.orchestrator.sweep_once(), 5);

    let done = h.orchestrator.schedule_of(&schedule.id).expect("schedule");
    assert_eq!(done.status, ScheduleStatus::Completed);
    assert_eq!(done.progress, Some(1.0));
    assert!(done
        .checkpoints
        .iter()
        .all(|c| c.fired_by == Some(FireSource::Sweep)));
    assert!(h.orchestrator.active_schedules().is_empty());

    for id in &booked.allocation_ids {
        let status = h
            .staging
            .allocation(id)
            .or_else(|| h.launch.allocation(id))
            .expect("allocation")
            .status;
        assert_eq!(status, AllocationStatus::Completed);
    }

    let report = h.executions.try_recv().expect("execution report");
    assert_eq!(report.schedule_id, schedule.id);
    assert_eq!(Some(report.execution_id), done.execution_id);
    assert_eq!(report.artifacts.expected_payload, json!({"cargo": 3}));
    assert_eq!(report.artifacts.delivered_payload, json!({"cargo": 3}));
    assert!(h.events.names().contains(&"schedule_completed"));
}

#[test]
fn cancel_releases_allocations_and_stops_firing() {
    let h = harness();
    let booked = book(&h, "clr-1");
    let schedule = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            booked.allocation_ids.clone(),
            thirty_minutes(),
        )
        .expect("schedule")
        .schedule;

    let cancelled = h
        .orchestrator
        .cancel_schedule(&schedule.id, "operator abort")
        .expect("cancel");
    assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("operator abort"));
    assert_eq!(h.staging.available(), 2);
    assert_eq!(h.launch.available(), 2);

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.orchestrator.sweep_once(), 0);

    let again = h
        .orchestrator
        .cancel_schedule(&schedule.id, "second")
        .expect("no-op");
    assert_eq!(again.cancel_reason.as_deref(), Some("operator abort"));
    assert!(matches!(
        h.orchestrator.cancel_schedule("sch-missing", "x"),
        Err(ScheduleError::NotFound(_))
    ));
}

#[test]
fn revocation_cancels_schedule_in_same_call() {
    let h = harness();
    let auth = AuthorizationService::new(
        ProfileStore::new(true, Vec::new()),
        h.clock.clone(),
        h.events.clone(),
    );
    auth.subscribe(h.orchestrator.clone());
    auth.subscribe(h.staging.clone());
    auth.subscribe(h.launch.clone());

    let ticket = h
        .registry
        .create_ticket("req-1", &["p1".to_owned()], json!(null))
        .expect("ticket");
    let clearance = auth
        .issue_clearance(&ticket.id, &["p1".to_owned()], Duration::hours(4))
        .expect("clearance");
    let staging = h.staging.allocate(&ticket.id, &clearance.id).expect("staging");
    let launch = h.launch.allocate(&ticket.id, &clearance.id).expect("launch");
    let schedule = h
        .orchestrator
        .schedule(
            "req-1",
            &ticket.id,
            &clearance.id,
            vec![staging.id.clone(), launch.id.clone()],
            thirty_minutes(),
        )
        .expect("schedule")
        .schedule;

    auth.revoke(&clearance.id, "no-fly").expect("revoke");

    let snapshot = h.orchestrator.schedule_of(&schedule.id).expect("schedule");
    assert_eq!(snapshot.status, ScheduleStatus::Cancelled);
    assert_eq!(
        snapshot.cancel_reason.as_deref(),
        Some("clearance revoked: no-fly")
    );
    let staging = h.staging.allocation(&staging.id).expect("allocation");
    assert_eq!(staging.status, AllocationStatus::Revoked);
    let launch = h.launch.allocation(&launch.id).expect("allocation");
    assert_eq!(launch.status, AllocationStatus::Revoked);
}

#[test]
fn completed_executions_wait_for_room_in_verification_channel() {
    let mut h = harness_with_channel(1);
    let mut schedule_ids = Vec::new();
    for _ in 0..2 {
        let booked = book(&h, "clr-1");
        let schedule = h
            .orchestrator
            .schedule(
                "req-1",
                &booked.ticket_id,
                "clr-1",
                booked.allocation_ids,
                thirty_minutes(),
            )
            .expect("schedule")
            .schedule;
        schedule_ids.push(schedule.id);
    }

    h.clock.advance(Duration::hours(2));
    assert_eq!(h.orchestrator.sweep_once(), 12);
    assert_eq!(h.orchestrator.undelivered_count(), 1);

    let first = h.executions.try_recv().expect("first report");
    assert!(h.executions.try_recv().is_err(), "second report is queued");

    assert_eq!(h.orchestrator.sweep_once(), 0, "nothing left to fire");
    assert_eq!(h.orchestrator.undelivered_count(), 0);
    let second = h.executions.try_recv().expect("queued report delivered");

    let mut delivered = vec![first.schedule_id, second.schedule_id];
    delivered.sort();
    schedule_ids.sort();
    assert_eq!(delivered, schedule_ids);
}

#[test]
fn duration_beyond_representable_time_is_rejected() {
    let h = harness();
    let booked = book(&h, "clr-1");
    let err = h
        .orchestrator
        .schedule(
            "req-1",
            &booked.ticket_id,
            "clr-1",
            booked.allocation_ids,
            // Converts to a chrono duration but lands past the last representable date.
            std::time::Duration::from_secs(365 * 24 * 3600 * 270_000),
        )
        .expect_err("completion time overflows");
    assert!(matches!(err, ScheduleError::InvalidRequest(_)));
    assert!(h.orchestrator.active_schedules().is_empty());
}

#[test]
fn finished_schedules_leave_the_active_set() {
    let h = harness();
    let mut ids = Vec::new();
    for _ in 0..2 {
        let booked = book(&h, "clr-1");
        let schedule = h
            .orchestrator
            .schedule(
                "req-1",
                &booked.ticket_id,
                "clr-1",
                booked.allocation_ids,
                thirty_minutes(),
            )
            .expect("schedule")
            .schedule;
        ids.push(schedule.id);
    }

    h.orchestrator
        .cancel_schedule(&ids[0], "operator abort")
        .expect("cancel");
    let active: Vec<String> = h
        .orchestrator
        .active_schedules()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(active, vec![ids[1].clone()]);

    h.clock.advance(Duration::hours(2));
    assert_eq!(h.orchestrator.sweep_once(), 6, "only the live schedule fires");
    assert!(h.orchestrator.active_schedules().is_empty());

    let cancelled = h.orchestrator.schedule_of(&ids[0]).expect("still queryable");
    assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
    let completed = h.orchestrator.schedule_of(&ids[1]).expect("still queryable");
    assert_eq!(completed.status, ScheduleStatus::Completed);
}
