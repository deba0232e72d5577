//! Ticket issuance, boarding transitions, and cancellation.

use std::sync::Arc;

use purser::clock::MonotonicClock;
use purser::events::MemorySink;
use purser::reservation::{
    BoardingStatus, ReservationError, ReservationRegistry, ReservationStatus, TicketStatus,
};
use serde_json::json;

fn registry() -> (ReservationRegistry, Arc<MemorySink>) {
    let events = Arc::new(MemorySink::new());
    let registry = ReservationRegistry::new(Arc::new(MonotonicClock::new()), events.clone());
    (registry, events)
}

fn participants(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|p| (*p).to_owned()).collect()
}

#[test]
fn create_ticket_confirms_reservation() {
    let (registry, events) = registry();
    let ticket = registry
        .create_ticket("req-1", &participants(&["p1", "p2"]), json!({"seat": "4A"}))
        .expect("ticket should be issued");

    assert!(ticket.id.starts_with("tkt-"));
    assert_eq!(ticket.status, TicketStatus::Issued);
    assert_eq!(ticket.boarding_status, BoardingStatus::NotReady);

    let reservation = registry
        .reservation(&ticket.reservation_id)
        .expect("reservation should exist");
    assert!(reservation.id.starts_with("rsv-"));
    assert_eq!(reservation.status, ReservationStatus::Confirmed);
    assert_eq!(reservation.participant_ids.len(), 2);
    assert_eq!(events.names(), vec!["ticket_issued"]);
}

#[test]
fn empty_participants_are_rejected() {
    let (registry, _) = registry();
    let err = registry
        .create_ticket("req-1", &[], json!(null))
        .expect_err("no participants");
    assert!(matches!(err, ReservationError::InvalidRequest(_)));
}

#[test]
fn blank_identifiers_are_rejected() {
    let (registry, _) = registry();
    assert!(registry
        .create_ticket("  ", &participants(&["p1"]), json!(null))
        .is_err());
    assert!(registry
        .create_ticket("req-1", &participants(&["p1", ""]), json!(null))
        .is_err());
}

#[test]
fn boarding_moves_forward_only() {
    let (registry, _) = registry();
    let ticket = registry
        .create_ticket("req-1", &participants(&["p1"]), json!(null))
        .expect("ticket");

    registry
        .update_boarding_status(&ticket.id, BoardingStatus::Staging)
        .expect("NOT_READY -> STAGING");
    let repeated = registry.update_boarding_status(&ticket.id, BoardingStatus::Staging);
    assert!(matches!(
        repeated,
        Err(ReservationError::InvalidTransition { .. })
    ));
    let backward = registry.update_boarding_status(&ticket.id, BoardingStatus::NotReady);
    assert!(backward.is_err());

    let ready = registry
        .update_boarding_status(&ticket.id, BoardingStatus::Ready)
        .expect("STAGING -> READY");
    assert_eq!(ready.boarding_status, BoardingStatus::Ready);
}

#[test]
fn denied_is_terminal() {
    let (registry, _) = registry();
    let ticket = registry
        .create_ticket("req-1", &participants(&["p1"]), json!(null))
        .expect("ticket");
    registry
        .update_boarding_status(&ticket.id, BoardingStatus::Denied)
        .expect("any -> DENIED");
    let err = registry
        .update_boarding_status(&ticket.id, BoardingStatus::Ready)
        .expect_err("nothing leaves DENIED");
    assert_eq!(
        err,
        ReservationError::InvalidTransition {
            ticket_id: ticket.id.clone(),
            from: "DENIED".to_owned(),
            to: "READY".to_owned(),
        }
    );
}

#[test]
fn unknown_ticket_is_not_found() {
    let (registry, _) = registry();
    let err = registry
        .update_boarding_status("tkt-missing", BoardingStatus::Staging)
        .expect_err("unknown");
    assert_eq!(err, ReservationError::TicketNotFound("tkt-missing".to_owned()));
}

#[test]
fn cancel_is_idempotent_and_blocks_transitions() {
    let (registry, events) = registry();
    let ticket = registry
        .create_ticket("req-1", &participants(&["p1"]), json!(null))
        .expect("ticket");

    registry
        .cancel_ticket(&ticket.id, "customer request")
        .expect("first cancel");
    registry
        .cancel_ticket(&ticket.id, "again")
        .expect("second cancel is a no-op");

    let cancelled = registry.ticket(&ticket.id).expect("ticket");
    assert_eq!(cancelled.status, TicketStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("customer request"));
    let reservation = registry
        .reservation(&ticket.reservation_id)
        .expect("reservation");
    assert_eq!(reservation.status, ReservationStatus::Cancelled);

    assert!(registry
        .update_boarding_status(&ticket.id, BoardingStatus::Staging)
        .is_err());
    let cancels = events
        .names()
        .into_iter()
        .filter(|n| *n == "ticket_cancelled")
        .count();
    assert_eq!(cancels, 1);
}

#[test]
fn check_in_only_from_issued() {
    let (registry, _) = registry();
    let ticket = registry
        .create_ticket("req-1", &participants(&["p1"]), json!(null))
        .expect("ticket");

    let checked_in = registry.check_in(&ticket.id).expect("check in");
    assert_eq!(checked_in.status, TicketStatus::CheckedIn);
    assert!(registry.check_in(&ticket.id).is_err());
}
