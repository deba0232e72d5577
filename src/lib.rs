//! Purser: a timed multi-stage request lifecycle engine.
//!
//! A request moves through reservation, clearance, allocation in two
//! bounded pools, a timed schedule of checkpoints, and post-execution
//! verification and commit. Revoking a clearance unwinds everything that
//! depends on it before the call returns.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod types;

pub mod authorization;
pub mod pool;
pub mod reservation;

pub mod orchestrator;

pub mod commit;
pub mod verification;

pub mod pipeline;

pub use error::PurserError;
pub use pipeline::{OutcomeStatus, Pipeline, ProcessOutcome, ProcessRequest};
