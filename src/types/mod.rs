//! Shared identifier helpers and small value types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity kinds that receive generated identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// Reservation created for a request.
    Reservation,
    /// Ticket issued against a reservation.
    Ticket,
    /// Time-bound clearance.
    Clearance,
    /// Pool slot allocation.
    Allocation,
    /// Checkpoint schedule.
    Schedule,
    /// Execution tracked between DEPART and COMPLETE.
    Execution,
    /// Post-execution verification record.
    Verification,
    /// Commit ledger record.
    Commit,
    /// Token minted by the ledger.
    Token,
}

impl IdKind {
    /// Short prefix used in generated identifiers.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Reservation => "rsv",
            Self::Ticket => "tkt",
            Self::Clearance => "clr",
            Self::Allocation => "alc",
            Self::Schedule => "sch",
            Self::Execution => "exe",
            Self::Verification => "ver",
            Self::Commit => "cmt",
            Self::Token => "tok",
        }
    }
}

/// Generate a fresh prefixed identifier, e.g. `tkt-3f0c...`.
pub fn new_id(kind: IdKind) -> String {
    format!("{}-{}", kind.prefix(), Uuid::new_v4().simple())
}

/// Priority tier of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Scanned first.
    Standard,
    /// Scanned after every standard slot is taken.
    High,
}
