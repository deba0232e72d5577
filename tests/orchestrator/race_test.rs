//! Timer callbacks and the sweep racing on a multi-threaded runtime.

use std::collections::HashMap;
use std::sync::{Arc, Barrier};

use chrono::{Duration, Utc};
use purser::clock::ManualClock;
use purser::events::{LifecycleEvent, MemorySink};
use purser::orchestrator::{CheckpointKind, FireSource, Orchestrator, ScheduleStatus, Timing};
use purser::pool::{ResourcePool, SlotSpec};
use purser::reservation::ReservationRegistry;
use purser::types::Priority;
use serde_json::json;
use tokio::sync::mpsc;

const SCHEDULES: usize = 4;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_checkpoint_fires_once_when_timers_and_sweeps_collide() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = Arc::new(MemorySink::new());
    let registry = Arc::new(ReservationRegistry::new(clock.clone(), events.clone()));
    let pool = Arc::new(ResourcePool::new(
        "launch",
        &[SlotSpec {
            name: "pad".to_owned(),
            capacity: 4,
            priority: Priority::Standard,
        }],
        clock.clone(),
        events.clone(),
    ));
    let (tx, mut executions) = mpsc::channel(SCHEDULES);
    let orchestrator = Orchestrator::new(
        Timing {
            lead_time: Duration::minutes(5),
            unit_lead: Duration::minutes(1),
        },
        clock.clone(),
        registry.clone(),
        vec![pool.clone()],
        events.clone(),
        Some(tx),
    );

    let mut ids = Vec::new();
    for _ in 0..SCHEDULES {
        let ticket = registry
            .create_ticket("req-1", &["p1".to_owned()], json!({"n": 1}))
            .expect("ticket");
        let allocation = pool.allocate(&ticket.id, "clr-1").expect("allocate");
        let schedule = orchestrator
            .schedule(
                "req-1",
                &ticket.id,
                "clr-1",
                vec![allocation.id],
                std::time::Duration::from_secs(1800),
            )
            .expect("schedule")
            .schedule;
        ids.push(schedule.id);
    }

    // Armed timers sleep for real minutes; the manual clock makes every
    // checkpoint overdue so each caller below competes for the same work.
    clock.advance(Duration::hours(2));

    let callers = SCHEDULES * 3 + 4;
    let barrier = Arc::new(Barrier::new(callers));
    let mut tasks = Vec::with_capacity(callers);
    for id in &ids {
        for kind in [
            CheckpointKind::Complete,
            CheckpointKind::Complete,
            CheckpointKind::Midpoint,
        ] {
            let orchestrator = orchestrator.clone();
            let barrier = barrier.clone();
            let id = id.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                barrier.wait();
                orchestrator
                    .fire_checkpoint(&id, kind, FireSource::Timer)
                    .expect("known schedule")
            }));
        }
    }
    for _ in 0..4 {
        let orchestrator = orchestrator.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            barrier.wait();
            orchestrator.sweep_once()
        }));
    }

    let mut total = 0usize;
    for task in tasks {
        total += task.await.expect("caller finished");
    }
    assert_eq!(total, SCHEDULES * 6);

    let mut fired: HashMap<(String, String), usize> = HashMap::new();
    let mut completed: HashMap<String, usize> = HashMap::new();
    for event in events.events() {
        match event {
            LifecycleEvent::CheckpointFired {
                schedule_id,
                checkpoint,
                ..
            } => *fired.entry((schedule_id, checkpoint)).or_default() += 1,
            LifecycleEvent::ScheduleCompleted { schedule_id, .. } => {
                *completed.entry(schedule_id).or_default() += 1;
            }
            _ => {}
        }
    }
    assert_eq!(fired.len(), SCHEDULES * 6);
    assert!(fired.values().all(|&n| n == 1), "{fired:?}");
    assert_eq!(completed.len(), SCHEDULES);
    assert!(completed.values().all(|&n| n == 1), "{completed:?}");

    for id in &ids {
        let schedule = orchestrator.schedule_of(id).expect("schedule");
        assert_eq!(schedule.status, ScheduleStatus::Completed);
    }
    for _ in 0..SCHEDULES {
        executions.try_recv().expect("one report per schedule");
    }
    assert!(executions.try_recv().is_err());
    assert_eq!(pool.active_count(), 0);
}
