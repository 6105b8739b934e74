//! Concurrency primitives for the backfill engine
//!
//! This crate provides the coordination pieces shared by loading workers:
//! - WorkRegistry: exactly-once claiming of keys by in-flight fetches
//! - SpeedEstimate: adaptive throughput estimate used to size rounds
//! - StopSignal: cooperative stop flag with interruptible sleeps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod signal;
pub mod speed;
pub mod work_registry;

pub use signal::StopSignal;
pub use speed::{SpeedEstimate, DEFAULT_MEASUREMENT_WEIGHT, DEFAULT_SPEED};
pub use work_registry::{Claim, WorkRegistry};
