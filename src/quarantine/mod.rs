//! Quarantine storage for files awaiting a verdict.
//!
//! Every admitted file is copied here and verified before any engine sees
//! it. Records in `meta/` are what lets a later run resume a task instead of
//! consuming its source a second time.

mod area;
mod record;

pub use area::QuarantineArea;
pub use record::{QuarantineRecord, RecordState};
