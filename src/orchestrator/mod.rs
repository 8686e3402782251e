//! Run orchestration.
//!
//! - [`run`] - Startup checks, resume, admission and drain
//! - [`lock`] - The single-instance lock
//! - [`summary`] - Run summary and exit codes

pub mod lock;
mod run;
pub mod summary;

#[cfg(test)]
mod tests;

pub use lock::{InstanceLock, LockSentinel};
pub use run::{run, Orchestrator, StopHandle};
pub use summary::{RunSummary, EXIT_FAILURES, EXIT_FATAL, EXIT_OK, EXIT_STARTUP};
