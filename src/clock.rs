//! Wall-clock view over a monotonic time source.
//!
//! Every component reads "now" through a [`Clock`] so that checkpoint
//! timers, clearance expiry, and the reconciliation sweep agree on time.
//! [`MonotonicClock`] anchors a wall-clock reading to a tokio [`Instant`],
//! which makes it follow paused/advanced time in tests. [`ManualClock`] is
//! stepped explicitly.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time derived from a monotonic anchor.
///
/// Immune to wall-clock jumps after construction: `now()` is the anchor's
/// wall time plus the monotonic time elapsed since the anchor.
#[derive(Debug)]
pub struct MonotonicClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl MonotonicClock {
    /// Anchor a new clock at the current instant.
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.anchor.elapsed()).unwrap_or(Duration::MAX);
        self.anchor_wall
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Manually stepped clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now = now.checked_add_signed(by).unwrap_or(*now);
        }
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Time remaining until `at`, clamped to zero for past instants.
pub fn until(clock: &dyn Clock, at: DateTime<Utc>) -> std::time::Duration {
    at.signed_duration_since(clock.now())
        .to_std()
        .unwrap_or(std::time::Duration::ZERO)
}
