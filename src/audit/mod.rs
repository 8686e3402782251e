//! Structured audit logging.
//!
//! Compliance-relevant events are emitted with the `tracing` crate under
//! the `quarantine_gate::audit` target, so any subscriber (JSON file,
//! journald, OpenTelemetry) can route them apart from ordinary logs.

mod events;

pub use events::{
    emit_lock_event, emit_run_summary, emit_task_failed, emit_task_quarantined,
    emit_task_routed, emit_throttle_stop, emit_verdict,
};
