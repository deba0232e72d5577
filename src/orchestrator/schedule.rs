//! Schedule records and checkpoint timeline computation.
//!
//! For a departure time `T = now + lead_time`, unit lead `u`, and estimated
//! duration `d`, the timeline is:
//!
//! | Checkpoint    | Time        |
//! |---------------|-------------|
//! | `STAGE`       | `T - 3u`    |
//! | `FINAL_CHECK` | `T - u`     |
//! | `DEPART`      | `T`         |
//! | `MIDPOINT`    | `T + d/2`   |
//! | `APPROACH`    | `T + d - 2u`|
//! | `COMPLETE`    | `T + d`     |
//!
//! When `d` is too short for that order to be strict, MIDPOINT and APPROACH
//! collapse onto `DEPART + ε` and `DEPART + 2ε` and a
//! [`ScheduleWarning::DegenerateSchedule`] is reported.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::ScheduleError;

/// Spacing in milliseconds used when collapsing a degenerate timeline.
pub const EPSILON_MS: i64 = 1;

/// Spacing used when collapsing a degenerate timeline.
pub fn epsilon() -> Duration {
    Duration::milliseconds(EPSILON_MS)
}

/// Named points on a schedule's timeline, in firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointKind {
    /// Boarding moves to STAGING.
    Stage,
    /// Reserved for extension; no action.
    FinalCheck,
    /// Execution starts (progress 0).
    Depart,
    /// Progress 0.5.
    Midpoint,
    /// Progress 0.9.
    Approach,
    /// Progress 1.0; schedule completes and allocations are returned.
    Complete,
}

impl CheckpointKind {
    /// Every checkpoint in timeline order.
    pub const ALL: [Self; 6] = [
        Self::Stage,
        Self::FinalCheck,
        Self::Depart,
        Self::Midpoint,
        Self::Approach,
        Self::Complete,
    ];

    /// Stable label used in logs, events, and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Stage => "STAGE",
            Self::FinalCheck => "FINAL_CHECK",
            Self::Depart => "DEPART",
            Self::Midpoint => "MIDPOINT",
            Self::Approach => "APPROACH",
            Self::Complete => "COMPLETE",
        }
    }

    /// Position in [`Self::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::Stage => 0,
            Self::FinalCheck => 1,
            Self::Depart => 2,
            Self::Midpoint => 3,
            Self::Approach => 4,
            Self::Complete => 5,
        }
    }

    /// Execution progress recorded when this checkpoint fires, if any.
    pub fn progress(self) -> Option<f64> {
        match self {
            Self::Stage | Self::FinalCheck => None,
            Self::Depart => Some(0.0),
            Self::Midpoint => Some(0.5),
            Self::Approach => Some(0.9),
            Self::Complete => Some(1.0),
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a checkpoint has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointStatus {
    /// Waiting for its time.
    Pending,
    /// Fired exactly once.
    Fired,
}

/// What fired a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireSource {
    /// Its one-shot timer (or a later checkpoint's timer catching up).
    Timer,
    /// The reconciliation sweep.
    Sweep,
}

impl FireSource {
    /// Label used in events and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Sweep => "sweep",
        }
    }
}

/// One point on a schedule's timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    /// Checkpoint name.
    pub kind: CheckpointKind,
    /// When it is due.
    pub scheduled_at: DateTime<Utc>,
    /// When it actually fired.
    pub fired_at: Option<DateTime<Utc>>,
    /// Firing status.
    pub status: CheckpointStatus,
    /// What fired it.
    pub fired_by: Option<FireSource>,
}

impl Checkpoint {
    fn pending(kind: CheckpointKind, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            scheduled_at,
            fired_at: None,
            status: CheckpointStatus::Pending,
            fired_by: None,
        }
    }

    /// Whether it is still waiting and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CheckpointStatus::Pending && self.scheduled_at <= now
    }
}

/// Schedule status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    /// Checkpoints still pending.
    Active,
    /// COMPLETE fired.
    Completed,
    /// Cancelled before completion.
    Cancelled,
}

impl ScheduleStatus {
    /// Whether the schedule can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Checkpoint schedule for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    /// Schedule identifier.
    pub id: String,
    /// Request identifier.
    pub request_id: String,
    /// Ticket whose boarding status the schedule drives.
    pub ticket_id: String,
    /// Clearance backing the allocations.
    pub clearance_id: String,
    /// Allocations returned at COMPLETE or released on cancel.
    pub allocation_ids: Vec<String>,
    /// Timeline, strictly increasing in `scheduled_at`.
    pub checkpoints: Vec<Checkpoint>,
    /// Current status.
    pub status: ScheduleStatus,
    /// Execution progress in `[0, 1]` once DEPART has fired.
    pub progress: Option<f64>,
    /// Execution identifier assigned at DEPART.
    pub execution_id: Option<String>,
    /// Whether the timeline was collapsed.
    pub degenerate: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Why the schedule was cancelled, if it was.
    pub cancel_reason: Option<String>,
}

impl Schedule {
    /// Checkpoint by name.
    pub fn checkpoint(&self, kind: CheckpointKind) -> Option<&Checkpoint> {
        self.checkpoints.get(kind.index())
    }

    /// Departure time (the DEPART checkpoint).
    pub fn departs_at(&self) -> Option<DateTime<Utc>> {
        self.checkpoint(CheckpointKind::Depart).map(|c| c.scheduled_at)
    }
}

/// Non-fatal scheduling warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum ScheduleWarning {
    /// The duration was too short for distinct checkpoints.
    #[error("degenerate schedule: duration {duration_ms}ms leaves no room between checkpoints")]
    DegenerateSchedule {
        /// Estimated duration in milliseconds.
        duration_ms: i64,
    },
}

/// Timeline constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Delay between scheduling and DEPART.
    pub lead_time: Duration,
    /// Unit lead `u` spacing the pre-departure and approach checkpoints.
    pub unit_lead: Duration,
}

fn out_of_range() -> ScheduleError {
    ScheduleError::InvalidRequest("checkpoint time out of range".to_owned())
}

fn offset(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, ScheduleError> {
    at.checked_add_signed(by).ok_or_else(out_of_range)
}

fn before(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, ScheduleError> {
    at.checked_sub_signed(by).ok_or_else(out_of_range)
}

fn scaled(d: Duration, n: i32) -> Result<Duration, ScheduleError> {
    d.checked_mul(n).ok_or_else(out_of_range)
}

/// Compute the six checkpoints for a schedule created at `now`.
///
/// # Errors
///
/// Returns [`ScheduleError::InvalidRequest`] when a checkpoint falls
/// outside the representable time range.
pub fn compute_checkpoints(
    now: DateTime<Utc>,
    duration: Duration,
    timing: Timing,
) -> Result<(Vec<Checkpoint>, Option<ScheduleWarning>), ScheduleError> {
    let u = timing.unit_lead;
    let depart = offset(now, timing.lead_time)?;
    let stage = before(depart, scaled(u, 3)?)?;
    let final_check = before(depart, u)?;

    let half = duration.checked_div(2).unwrap_or(duration);
    let mut midpoint = offset(depart, half)?;
    let mut complete = offset(depart, duration)?;
    let mut approach = before(complete, scaled(u, 2)?)?;

    let strict = depart < midpoint && midpoint < approach && approach < complete;
    let warning = if strict {
        None
    } else {
        midpoint = offset(depart, epsilon())?;
        approach = offset(depart, scaled(epsilon(), 2)?)?;
        complete = complete.max(offset(depart, scaled(epsilon(), 3)?)?);
        Some(ScheduleWarning::DegenerateSchedule {
            duration_ms: duration.num_milliseconds(),
        })
    };

    let times = [stage, final_check, depart, midpoint, approach, complete];
    let checkpoints = CheckpointKind::ALL
        .iter()
        .zip(times)
        .map(|(kind, at)| Checkpoint::pending(*kind, at))
        .collect();
    Ok((checkpoints, warning))
}

/// Whether `checkpoints` are strictly increasing in time.
pub fn is_strictly_increasing(checkpoints: &[Checkpoint]) -> bool {
    checkpoints
        .windows(2)
        .all(|w| w[0].scheduled_at < w[1].scheduled_at)
}
