//! Bounded resource pools with priority tiers.
//!
//! A pool is configured with [`SlotSpec`]s; each spec expands into
//! `capacity` slots named `{name}-{n}`. A slot holds at most one
//! `Allocated` [`Allocation`]. Allocation scans standard slots before
//! high-priority ones, each tier in declaration order, and fails fast with
//! [`PoolError::PoolExhausted`] instead of queueing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::authorization::RevocationListener;
use crate::clock::Clock;
use crate::events::{EventSink, LifecycleEvent};
use crate::metrics;
use crate::types::{new_id, IdKind, Priority};

/// Configuration of a group of identical slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Group name; slots are named `{name}-{n}`.
    pub name: String,
    /// Number of slots in the group.
    pub capacity: u32,
    /// Priority tier of the group.
    #[serde(default = "default_priority")]
    pub priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Standard
}

/// Allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    /// Holding a slot.
    Allocated,
    /// Released early (cancellation or revocation).
    Revoked,
    /// Released after successful execution.
    Completed,
}

impl AllocationStatus {
    /// Whether the allocation no longer holds its slot.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Allocated)
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Allocated => "ALLOCATED",
            Self::Revoked => "REVOKED",
            Self::Completed => "COMPLETED",
        };
        f.write_str(label)
    }
}

/// A claim on one pool slot.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    /// Allocation identifier.
    pub id: String,
    /// Owning pool.
    pub pool_id: String,
    /// Slot held.
    pub slot_id: String,
    /// Ticket the slot is held for.
    pub ticket_id: String,
    /// Clearance backing the allocation.
    pub clearance_id: String,
    /// Current status.
    pub status: AllocationStatus,
    /// Allocation time.
    pub allocated_at: DateTime<Utc>,
    /// When the slot was freed.
    pub released_at: Option<DateTime<Utc>>,
    /// Release reason for revoked allocations.
    pub reason: Option<String>,
}

/// Errors raised by a pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Every slot is taken.
    #[error("pool {pool} exhausted")]
    PoolExhausted {
        /// Pool identifier.
        pool: String,
    },

    /// Unknown allocation.
    #[error("allocation {0} not found")]
    NotFound(String),
}

#[derive(Debug)]
struct Slot {
    id: String,
    priority: Priority,
    holder: Option<String>,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    allocations: HashMap<String, Allocation>,
}

impl PoolState {
    /// Allocations holding a slot. Finished allocations stay in the history
    /// map but are never visited here.
    fn live(&self) -> impl Iterator<Item = &Allocation> {
        self.slots
            .iter()
            .filter_map(|s| s.holder.as_deref())
            .filter_map(|id| self.allocations.get(id))
    }
}

/// Bounded pool of named slots.
///
/// All mutations are serialized by a single lock per pool.
pub struct ResourcePool {
    id: String,
    state: Mutex<PoolState>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl ResourcePool {
    /// Build a pool from slot specs. Slot order follows `specs`.
    pub fn new(
        id: impl Into<String>,
        specs: &[SlotSpec],
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let slots = specs
            .iter()
            .flat_map(|spec| {
                (0..spec.capacity).map(move |n| Slot {
                    id: format!("{}-{n}", spec.name),
                    priority: spec.priority,
                    holder: None,
                })
            })
            .collect();
        Self {
            id: id.into(),
            state: Mutex::new(PoolState {
                slots,
                allocations: HashMap::new(),
            }),
            clock,
            events,
        }
    }

    /// Pool identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim a free slot for a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::PoolExhausted`] when no slot is free.
    pub fn allocate(&self, ticket_id: &str, clearance_id: &str) -> Result<Allocation, PoolError> {
        let allocation = {
            let mut state = self.lock();
            let free = [Priority::Standard, Priority::High]
                .into_iter()
                .find_map(|tier| {
                    state
                        .slots
                        .iter()
                        .position(|s| s.priority == tier && s.holder.is_none())
                });
            let Some(index) = free else {
                warn!(pool = %self.id, ticket_id, "pool exhausted");
                metrics::pool_exhausted(&self.id);
                return Err(PoolError::PoolExhausted {
                    pool: self.id.clone(),
                });
            };

            let allocation = Allocation {
                id: new_id(IdKind::Allocation),
                pool_id: self.id.clone(),
                slot_id: state.slots[index].id.clone(),
                ticket_id: ticket_id.to_owned(),
                clearance_id: clearance_id.to_owned(),
                status: AllocationStatus::Allocated,
                allocated_at: self.clock.now(),
                released_at: None,
                reason: None,
            };
            state.slots[index].holder = Some(allocation.id.clone());
            state
                .allocations
                .insert(allocation.id.clone(), allocation.clone());
            allocation
        };

        info!(
            pool = %self.id,
            slot = %allocation.slot_id,
            allocation_id = %allocation.id,
            ticket_id,
            "slot allocated"
        );
        self.events.emit(&LifecycleEvent::AllocationCreated {
            pool: self.id.clone(),
            slot: allocation.slot_id.clone(),
            allocation_id: allocation.id.clone(),
        });
        Ok(allocation)
    }

    /// Free the slot and mark the allocation `Completed`.
    ///
    /// No-op on an already terminal allocation.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for unknown allocations.
    pub fn complete(&self, allocation_id: &str) -> Result<Allocation, PoolError> {
        self.finish(allocation_id, AllocationStatus::Completed, None)
    }

    /// Free the slot and mark the allocation `Revoked`.
    ///
    /// No-op on an already terminal allocation.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotFound`] for unknown allocations.
    pub fn release(&self, allocation_id: &str, reason: &str) -> Result<Allocation, PoolError> {
        self.finish(allocation_id, AllocationStatus::Revoked, Some(reason))
    }

    fn finish(
        &self,
        allocation_id: &str,
        status: AllocationStatus,
        reason: Option<&str>,
    ) -> Result<Allocation, PoolError> {
        let (allocation, changed) = {
            let mut state = self.lock();
            let now = self.clock.now();
            let allocation = state
                .allocations
                .get_mut(allocation_id)
                .ok_or_else(|| PoolError::NotFound(allocation_id.to_owned()))?;
            if allocation.status.is_terminal() {
                (allocation.clone(), false)
            } else {
                allocation.status = status;
                allocation.released_at = Some(now);
                allocation.reason = reason.map(str::to_owned);
                let snapshot = allocation.clone();
                if let Some(slot) = state
                    .slots
                    .iter_mut()
                    .find(|s| s.holder.as_deref() == Some(allocation_id))
                {
                    slot.holder = None;
                }
                (snapshot, true)
            }
        };

        if changed {
            debug!(pool = %self.id, allocation_id, %status, "slot freed");
            self.events.emit(&LifecycleEvent::AllocationFinished {
                pool: self.id.clone(),
                allocation_id: allocation_id.to_owned(),
                status: status.to_string(),
            });
        }
        Ok(allocation)
    }

    /// Release every live allocation backed by `clearance_id`.
    ///
    /// Returns the identifiers of the allocations that were released.
    pub fn release_for_clearance(&self, clearance_id: &str, reason: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .lock()
            .live()
            .filter(|a| a.clearance_id == clearance_id)
            .map(|a| a.id.clone())
            .collect();
        for id in &ids {
            if let Err(e) = self.release(id, reason) {
                warn!(pool = %self.id, allocation_id = %id, error = %e, "release failed");
            }
        }
        ids
    }

    /// Whether this pool owns the allocation.
    pub fn owns(&self, allocation_id: &str) -> bool {
        self.lock().allocations.contains_key(allocation_id)
    }

    /// Look up an allocation.
    pub fn allocation(&self, allocation_id: &str) -> Option<Allocation> {
        self.lock().allocations.get(allocation_id).cloned()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|s| s.holder.is_none())
            .count()
    }

    /// Number of allocations currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.lock().live().count()
    }

    /// Slot id to holding allocation id, for occupied slots.
    pub fn occupancy(&self) -> Vec<(String, String)> {
        self.lock()
            .slots
            .iter()
            .filter_map(|s| s.holder.clone().map(|h| (s.id.clone(), h)))
            .collect()
    }
}

impl RevocationListener for ResourcePool {
    fn on_revoked(&self, clearance_id: &str, reason: &str) {
        let released = self.release_for_clearance(clearance_id, reason);
        if !released.is_empty() {
            info!(
                pool = %self.id,
                clearance_id,
                released = released.len(),
                "allocations released on revocation"
            );
        }
    }
}
