//! Admission control by free space and daily quota.
//!
//! - [`tracker`] - Persisted, lock-protected daily usage ledger
//! - [`gate`] - Atomic admit-and-record decisions
//! - [`space`] - Free-space probes

pub mod gate;
pub mod space;
pub mod tracker;

pub use gate::{ThrottleDecision, ThrottleGate, ThrottleLimits, ThrottleReason};
pub use space::{FixedSpaceProbe, FsSpaceProbe, SpaceProbe};
pub use tracker::{Clock, DailyUsageRecord, DailyUsageTracker};
