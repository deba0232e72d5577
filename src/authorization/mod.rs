//! Time-bound clearances and the revocation cascade.
//!
//! A [`Clearance`] is usable only while it is `Approved` and the clock is
//! before `expires_at`. Revocation is synchronous: every registered
//! [`RevocationListener`] runs before [`AuthorizationService::revoke`]
//! returns, so callers never observe allocations or schedules still
//! hanging off a revoked clearance.

pub mod profile;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::events::{EventSink, LifecycleEvent};
use crate::metrics;
use crate::types::{new_id, IdKind};

pub use profile::{ProfileStore, SecurityProfile};

/// Clearance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClearanceStatus {
    /// Issued and not revoked.
    Approved,
    /// Revoked; terminal.
    Revoked,
}

/// Authorization for a ticket's participants, valid until `expires_at`.
#[derive(Debug, Clone, Serialize)]
pub struct Clearance {
    /// Clearance identifier.
    pub id: String,
    /// Ticket this clearance covers.
    pub ticket_id: String,
    /// Participants that passed the profile check.
    pub participant_ids: Vec<String>,
    /// Current status.
    pub status: ClearanceStatus,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time (exclusive).
    pub expires_at: DateTime<Utc>,
    /// Why the clearance was revoked, if it was.
    pub revoke_reason: Option<String>,
}

impl Clearance {
    /// Whether the clearance may be used at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ClearanceStatus::Approved && now < self.expires_at
    }
}

/// Errors raised by the authorization service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    /// Bad caller input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A participant's profile lacks clearance.
    #[error("clearance denied for participant {participant}")]
    ClearanceDenied {
        /// The first participant that failed the check.
        participant: String,
    },

    /// Unknown clearance.
    #[error("clearance {0} not found")]
    NotFound(String),
}

/// Reacts to a revoked clearance before `revoke` returns.
///
/// Implementations must be idempotent and must not call back into the
/// [`AuthorizationService`].
pub trait RevocationListener: Send + Sync {
    /// Unwind everything that depends on `clearance_id`.
    fn on_revoked(&self, clearance_id: &str, reason: &str);
}

/// Issues, validates, and revokes clearances.
pub struct AuthorizationService {
    clearances: Mutex<HashMap<String, Clearance>>,
    profiles: ProfileStore,
    listeners: RwLock<Vec<Arc<dyn RevocationListener>>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl AuthorizationService {
    /// Create a service backed by the given profile store.
    pub fn new(profiles: ProfileStore, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            clearances: Mutex::new(HashMap::new()),
            profiles,
            listeners: RwLock::new(Vec::new()),
            clock,
            events,
        }
    }

    fn store(&self) -> MutexGuard<'_, HashMap<String, Clearance>> {
        match self.clearances.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a listener for the revocation cascade.
    ///
    /// Listeners run in registration order.
    pub fn subscribe(&self, listener: Arc<dyn RevocationListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Security profiles consulted at issue time.
    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// Set a participant's clearance flag, creating the profile if needed.
    pub fn set_profile(&self, participant_id: &str, cleared: bool) {
        self.profiles.set(participant_id, cleared, self.clock.now());
    }

    /// Issue a clearance for every participant on a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError::ClearanceDenied`] naming the first
    /// participant without clearance; nothing is issued in that case.
    pub fn issue_clearance(
        &self,
        ticket_id: &str,
        participant_ids: &[String],
        ttl: Duration,
    ) -> Result<Clearance, AuthorizationError> {
        if participant_ids.is_empty() {
            return Err(AuthorizationError::InvalidRequest(
                "clearance requires at least one participant".to_owned(),
            ));
        }
        if ttl <= Duration::zero() {
            return Err(AuthorizationError::InvalidRequest(
                "clearance ttl must be positive".to_owned(),
            ));
        }

        let now = self.clock.now();
        for participant in participant_ids {
            let profile = self.profiles.get_or_create(participant, now);
            if !profile.cleared {
                warn!(ticket_id, participant = %participant, "clearance denied");
                metrics::clearance_denied();
                self.events.emit(&LifecycleEvent::ClearanceDenied {
                    ticket_id: ticket_id.to_owned(),
                    participant: participant.clone(),
                });
                return Err(AuthorizationError::ClearanceDenied {
                    participant: participant.clone(),
                });
            }
        }

        let clearance = Clearance {
            id: new_id(IdKind::Clearance),
            ticket_id: ticket_id.to_owned(),
            participant_ids: participant_ids.to_vec(),
            status: ClearanceStatus::Approved,
            issued_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
            revoke_reason: None,
        };
        self.store()
            .insert(clearance.id.clone(), clearance.clone());

        info!(
            ticket_id,
            clearance_id = %clearance.id,
            expires_at = %clearance.expires_at,
            "clearance issued"
        );
        self.events.emit(&LifecycleEvent::ClearanceIssued {
            ticket_id: ticket_id.to_owned(),
            clearance_id: clearance.id.clone(),
        });
        Ok(clearance)
    }

    /// Whether a clearance exists, is approved, and has not expired.
    pub fn validate(&self, clearance_id: &str) -> bool {
        let now = self.clock.now();
        self.store()
            .get(clearance_id)
            .is_some_and(|c| c.is_usable_at(now))
    }

    /// Revoke a clearance and run the cascade.
    ///
    /// Revoking an already revoked clearance is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError::NotFound`] for unknown clearances.
    pub fn revoke(&self, clearance_id: &str, reason: &str) -> Result<(), AuthorizationError> {
        {
            let mut clearances = self.store();
            let clearance = clearances
                .get_mut(clearance_id)
                .ok_or_else(|| AuthorizationError::NotFound(clearance_id.to_owned()))?;
            if clearance.status == ClearanceStatus::Revoked {
                return Ok(());
            }
            clearance.status = ClearanceStatus::Revoked;
            clearance.revoke_reason = Some(reason.to_owned());
        }

        info!(clearance_id, reason, "clearance revoked");
        self.events.emit(&LifecycleEvent::ClearanceRevoked {
            clearance_id: clearance_id.to_owned(),
            reason: reason.to_owned(),
        });

        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener.on_revoked(clearance_id, reason);
        }
        Ok(())
    }

    /// Look up a clearance.
    pub fn clearance(&self, clearance_id: &str) -> Option<Clearance> {
        self.store().get(clearance_id).cloned()
    }
}
