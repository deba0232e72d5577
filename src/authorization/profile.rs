//! Security profiles, created lazily on first lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Clearance profile of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityProfile {
    /// Participant identifier.
    pub participant_id: String,
    /// Whether the participant may receive clearances.
    pub cleared: bool,
    /// When the profile was first seen.
    pub created_at: DateTime<Utc>,
}

/// Profile store with a default policy for unseen participants.
#[derive(Debug)]
pub struct ProfileStore {
    profiles: Mutex<HashMap<String, SecurityProfile>>,
    default_cleared: bool,
    denied: HashSet<String>,
}

impl ProfileStore {
    /// Create a store. New profiles are cleared per `default_cleared`,
    /// except participants in `denied`, which are never cleared on creation.
    pub fn new(default_cleared: bool, denied: Vec<String>) -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            default_cleared,
            denied: denied.into_iter().collect(),
        }
    }

    /// Fetch a profile, creating it from the default policy if absent.
    pub fn get_or_create(&self, participant_id: &str, now: DateTime<Utc>) -> SecurityProfile {
        let mut profiles = match self.profiles.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        profiles
            .entry(participant_id.to_owned())
            .or_insert_with(|| SecurityProfile {
                participant_id: participant_id.to_owned(),
                cleared: self.default_cleared && !self.denied.contains(participant_id),
                created_at: now,
            })
            .clone()
    }

    /// Set a participant's clearance flag.
    pub fn set(&self, participant_id: &str, cleared: bool, now: DateTime<Utc>) {
        let mut profiles = match self.profiles.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        profiles
            .entry(participant_id.to_owned())
            .and_modify(|p| p.cleared = cleared)
            .or_insert_with(|| SecurityProfile {
                participant_id: participant_id.to_owned(),
                cleared,
                created_at: now,
            });
    }

    /// Look up an existing profile without creating one.
    pub fn get(&self, participant_id: &str) -> Option<SecurityProfile> {
        self.profiles
            .lock()
            .ok()
            .and_then(|p| p.get(participant_id).cloned())
    }

    /// Number of known profiles.
    pub fn len(&self) -> usize {
        self.profiles.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Whether no profiles exist yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
