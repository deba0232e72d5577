//! Counters exported through the `metrics` facade.
//!
//! No recorder is installed by the library; binaries pick an exporter.
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `purser_pool_exhausted_total` | `pool` |
//! | `purser_clearance_denied_total` | - |
//! | `purser_commit_records_total` | `status` |
//! | `purser_checkpoints_fired_total` | `checkpoint`, `source` |
//! | `purser_sweep_repairs_total` | - |

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: allocation attempts rejected with `PoolExhausted`.
    pub const POOL_EXHAUSTED_TOTAL: &str = "purser_pool_exhausted_total";
    /// Counter: clearance requests rejected by policy.
    pub const CLEARANCE_DENIED_TOTAL: &str = "purser_clearance_denied_total";
    /// Counter: commit records created.
    pub const COMMIT_RECORDS_TOTAL: &str = "purser_commit_records_total";
    /// Counter: checkpoints fired.
    pub const CHECKPOINTS_FIRED_TOTAL: &str = "purser_checkpoints_fired_total";
    /// Counter: checkpoints fired by the reconciliation sweep.
    pub const SWEEP_REPAIRS_TOTAL: &str = "purser_sweep_repairs_total";
}

/// Record a `PoolExhausted` rejection.
pub fn pool_exhausted(pool: &str) {
    counter!(names::POOL_EXHAUSTED_TOTAL, "pool" => pool.to_owned()).increment(1);
}

/// Record a `ClearanceDenied` rejection.
pub fn clearance_denied() {
    counter!(names::CLEARANCE_DENIED_TOTAL).increment(1);
}

/// Record creation of a commit record with the given status label.
pub fn commit_record(status: &'static str) {
    counter!(names::COMMIT_RECORDS_TOTAL, "status" => status).increment(1);
}

/// Record a fired checkpoint.
pub fn checkpoint_fired(checkpoint: &'static str, source: &'static str) {
    counter!(
        names::CHECKPOINTS_FIRED_TOTAL,
        "checkpoint" => checkpoint,
        "source" => source,
    )
    .increment(1);
}

/// Record checkpoints the sweep fired that no timer had.
pub fn sweep_repairs(count: u64) {
    if count > 0 {
        counter!(names::SWEEP_REPAIRS_TOTAL).increment(count);
    }
}
