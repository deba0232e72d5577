//! Crate-level error taxonomy.
//!
//! Each component raises its own `thiserror` enum; [`PurserError`] folds
//! them into the kinds callers act on. Only [`PurserError::PoolExhausted`]
//! is retryable.

use crate::authorization::AuthorizationError;
use crate::commit::CommitError;
use crate::orchestrator::ScheduleError;
use crate::pool::PoolError;
use crate::reservation::ReservationError;

/// Error kinds surfaced by the pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PurserError {
    /// Bad input from the caller; not retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A participant failed the clearance policy.
    #[error("clearance denied for participant {participant}")]
    ClearanceDenied {
        /// Participant whose profile lacks clearance.
        participant: String,
    },

    /// No free slot in the named pool; retry with backoff.
    #[error("pool {pool} exhausted")]
    PoolExhausted {
        /// Pool identifier.
        pool: String,
    },

    /// A state transition was attempted out of order.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Commit attempted without a recorded approval.
    #[error("verification {0} has not been approved")]
    NotApproved(String),

    /// The commit ledger failed to mint a token.
    #[error("ledger failure: {0}")]
    Ledger(String),
}

impl PurserError {
    /// Whether the caller may retry the same call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

impl From<ReservationError> for PurserError {
    fn from(err: ReservationError) -> Self {
        match err {
            ReservationError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            ReservationError::InvalidTransition { .. } => Self::InvalidTransition(err.to_string()),
            ReservationError::TicketNotFound(id) => Self::NotFound { kind: "ticket", id },
        }
    }
}

impl From<AuthorizationError> for PurserError {
    fn from(err: AuthorizationError) -> Self {
        match err {
            AuthorizationError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            AuthorizationError::ClearanceDenied { participant } => {
                Self::ClearanceDenied { participant }
            }
            AuthorizationError::NotFound(id) => Self::NotFound {
                kind: "clearance",
                id,
            },
        }
    }
}

impl From<PoolError> for PurserError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolExhausted { pool } => Self::PoolExhausted { pool },
            PoolError::NotFound(id) => Self::NotFound {
                kind: "allocation",
                id,
            },
        }
    }
}

impl From<ScheduleError> for PurserError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            ScheduleError::NotFound(id) => Self::NotFound {
                kind: "schedule",
                id,
            },
        }
    }
}

impl From<CommitError> for PurserError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::NotApproved(id) => Self::NotApproved(id),
            CommitError::ReviewNotFound(id) => Self::NotFound {
                kind: "review",
                id,
            },
            CommitError::Ledger(msg) => Self::Ledger(msg),
        }
    }
}
