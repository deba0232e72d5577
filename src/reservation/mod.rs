//! Reservation registry: reservations, tickets, and boarding status.
//!
//! The registry is the only mutation path for [`Reservation`] and
//! [`Ticket`] records. Boarding status only moves forward
//! (`NotReady -> Staging -> Ready`) or to `Denied`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::events::{EventSink, LifecycleEvent};
use crate::types::{new_id, IdKind};

/// Reservation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Created, not yet confirmed.
    Pending,
    /// Confirmed and backing a ticket.
    Confirmed,
    /// Cancelled with its ticket.
    Cancelled,
}

/// A reservation made for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    /// Reservation identifier.
    pub id: String,
    /// Request this reservation belongs to.
    pub request_id: String,
    /// Participants covered by the reservation.
    pub participant_ids: Vec<String>,
    /// Current status.
    pub status: ReservationStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Ticket status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Issued, awaiting check-in.
    Issued,
    /// Checked in after clearance.
    CheckedIn,
    /// Cancelled.
    Cancelled,
}

/// Boarding progress of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardingStatus {
    /// Initial state.
    NotReady,
    /// Set by the STAGE checkpoint.
    Staging,
    /// Ready to depart.
    Ready,
    /// Boarding refused; terminal.
    Denied,
}

impl BoardingStatus {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Denied, _) => false,
            (_, Self::Denied) => true,
            (from, to) => to > from,
        }
    }
}

impl fmt::Display for BoardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotReady => "NOT_READY",
            Self::Staging => "STAGING",
            Self::Ready => "READY",
            Self::Denied => "DENIED",
        };
        f.write_str(label)
    }
}

/// A ticket issued against a confirmed reservation.
#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    /// Ticket identifier.
    pub id: String,
    /// Backing reservation.
    pub reservation_id: String,
    /// Request this ticket belongs to.
    pub request_id: String,
    /// Ticket status.
    pub status: TicketStatus,
    /// Boarding progress.
    pub boarding_status: BoardingStatus,
    /// Opaque request payload carried through execution.
    pub payload: Value,
    /// Why the ticket was cancelled, if it was.
    pub cancel_reason: Option<String>,
}

/// Errors raised by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    /// Bad caller input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Ticket state change out of order.
    #[error("ticket {ticket_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        /// Ticket identifier.
        ticket_id: String,
        /// Current state label.
        from: String,
        /// Requested state label.
        to: String,
    },

    /// Unknown ticket.
    #[error("ticket {0} not found")]
    TicketNotFound(String),
}

#[derive(Debug, Default)]
struct RegistryStore {
    reservations: HashMap<String, Reservation>,
    tickets: HashMap<String, Ticket>,
}

/// Owns reservations and tickets.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
pub struct ReservationRegistry {
    store: Mutex<RegistryStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl ReservationRegistry {
    /// Create an empty registry.
    pub fn new(clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store: Mutex::new(RegistryStore::default()),
            clock,
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryStore> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a confirmed reservation and issue a ticket for it.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvalidRequest`] when the request id is
    /// blank or the participant list is empty or contains a blank id.
    pub fn create_ticket(
        &self,
        request_id: &str,
        participant_ids: &[String],
        payload: Value,
    ) -> Result<Ticket, ReservationError> {
        if request_id.trim().is_empty() {
            return Err(ReservationError::InvalidRequest(
                "request id must not be empty".to_owned(),
            ));
        }
        if participant_ids.is_empty() {
            return Err(ReservationError::InvalidRequest(
                "at least one participant is required".to_owned(),
            ));
        }
        if participant_ids.iter().any(|p| p.trim().is_empty()) {
            return Err(ReservationError::InvalidRequest(
                "participant ids must not be empty".to_owned(),
            ));
        }

        let reservation = Reservation {
            id: new_id(IdKind::Reservation),
            request_id: request_id.to_owned(),
            participant_ids: participant_ids.to_vec(),
            status: ReservationStatus::Confirmed,
            created_at: self.clock.now(),
        };
        let ticket = Ticket {
            id: new_id(IdKind::Ticket),
            reservation_id: reservation.id.clone(),
            request_id: request_id.to_owned(),
            status: TicketStatus::Issued,
            boarding_status: BoardingStatus::NotReady,
            payload,
            cancel_reason: None,
        };

        {
            let mut store = self.lock();
            store
                .reservations
                .insert(reservation.id.clone(), reservation.clone());
            store.tickets.insert(ticket.id.clone(), ticket.clone());
        }

        info!(
            request_id,
            ticket_id = %ticket.id,
            participants = participant_ids.len(),
            "ticket issued"
        );
        self.events.emit(&LifecycleEvent::TicketIssued {
            request_id: request_id.to_owned(),
            ticket_id: ticket.id.clone(),
            reservation_id: reservation.id,
        });
        Ok(ticket)
    }

    /// Advance a ticket's boarding status.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvalidTransition`] for backward or
    /// repeated moves, or any move on a cancelled ticket, and
    /// [`ReservationError::TicketNotFound`] for unknown tickets.
    pub fn update_boarding_status(
        &self,
        ticket_id: &str,
        status: BoardingStatus,
    ) -> Result<Ticket, ReservationError> {
        let (from, ticket) = {
            let mut store = self.lock();
            let ticket = store
                .tickets
                .get_mut(ticket_id)
                .ok_or_else(|| ReservationError::TicketNotFound(ticket_id.to_owned()))?;
            let from = ticket.boarding_status;
            if ticket.status == TicketStatus::Cancelled || !from.can_transition_to(status) {
                return Err(ReservationError::InvalidTransition {
                    ticket_id: ticket_id.to_owned(),
                    from: from.to_string(),
                    to: status.to_string(),
                });
            }
            ticket.boarding_status = status;
            (from, ticket.clone())
        };

        debug!(ticket_id, %from, to = %status, "boarding status changed");
        self.events.emit(&LifecycleEvent::BoardingStatusChanged {
            ticket_id: ticket_id.to_owned(),
            from: from.to_string(),
            to: status.to_string(),
        });
        Ok(ticket)
    }

    /// Check in an issued ticket.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvalidTransition`] unless the ticket is
    /// `Issued`.
    pub fn check_in(&self, ticket_id: &str) -> Result<Ticket, ReservationError> {
        let ticket = {
            let mut store = self.lock();
            let ticket = store
                .tickets
                .get_mut(ticket_id)
                .ok_or_else(|| ReservationError::TicketNotFound(ticket_id.to_owned()))?;
            if ticket.status != TicketStatus::Issued {
                return Err(ReservationError::InvalidTransition {
                    ticket_id: ticket_id.to_owned(),
                    from: format!("{:?}", ticket.status),
                    to: "CheckedIn".to_owned(),
                });
            }
            ticket.status = TicketStatus::CheckedIn;
            ticket.clone()
        };

        self.events.emit(&LifecycleEvent::TicketCheckedIn {
            ticket_id: ticket_id.to_owned(),
        });
        Ok(ticket)
    }

    /// Cancel a ticket and its reservation. Cancelling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::TicketNotFound`] for unknown tickets.
    pub fn cancel_ticket(&self, ticket_id: &str, reason: &str) -> Result<(), ReservationError> {
        {
            let mut store = self.lock();
            let ticket = store
                .tickets
                .get_mut(ticket_id)
                .ok_or_else(|| ReservationError::TicketNotFound(ticket_id.to_owned()))?;
            if ticket.status == TicketStatus::Cancelled {
                return Ok(());
            }
            ticket.status = TicketStatus::Cancelled;
            ticket.cancel_reason = Some(reason.to_owned());
            let reservation_id = ticket.reservation_id.clone();
            if let Some(reservation) = store.reservations.get_mut(&reservation_id) {
                reservation.status = ReservationStatus::Cancelled;
            }
        }

        info!(ticket_id, reason, "ticket cancelled");
        self.events.emit(&LifecycleEvent::TicketCancelled {
            ticket_id: ticket_id.to_owned(),
            reason: reason.to_owned(),
        });
        Ok(())
    }

    /// Look up a ticket.
    pub fn ticket(&self, ticket_id: &str) -> Option<Ticket> {
        self.lock().tickets.get(ticket_id).cloned()
    }

    /// Look up a reservation.
    pub fn reservation(&self, reservation_id: &str) -> Option<Reservation> {
        self.lock().reservations.get(reservation_id).cloned()
    }
}
