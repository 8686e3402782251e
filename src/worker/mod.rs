//! The per-file pipeline.
//!
//! A [`FileTask`] moves through `PENDING -> HASHED -> QUARANTINED ->
//! SCANNED -> ROUTED`, or to `FAILED` from any stage. One [`Worker`] owns a
//! task end to end; tasks never migrate.

mod task;
#[allow(clippy::module_inception)]
mod worker;

pub use task::{FileTask, TaskOutcome, TaskState};
pub use worker::{TaskReport, Worker};
