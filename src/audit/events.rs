//! Audit event emission functions.

use crate::core::{FailureKind, ScanReport};
use crate::orchestrator::RunSummary;
use crate::throttle::ThrottleDecision;
use crate::worker::{FileTask, TaskOutcome};

use std::path::Path;

/// Emits an audit event for a verified quarantine placement.
pub fn emit_task_quarantined(task: &FileTask) {
    tracing::info!(
        target: "quarantine_gate::audit",
        event_type = "task_quarantined",
        task_id = %task.id,
        source = %task.source.path.display(),
        size = task.source.size,
        file_hash_blake3 = ?task.hash.as_ref().map(|h| h.blake3.as_str()),
        file_hash_sha256 = ?task.hash.as_ref().and_then(|h| h.sha256.as_deref()),
        resumed = task.resumed,
        "File quarantined"
    );
}

/// Emits an audit event for a combined verdict.
pub fn emit_verdict(task: &FileTask, report: &ScanReport) {
    let engines: Vec<&str> = report.findings.iter().map(|f| f.engine.as_str()).collect();

    tracing::info!(
        target: "quarantine_gate::audit",
        event_type = "verdict",
        task_id = %task.id,
        source = %task.source.path.display(),
        file_hash_blake3 = ?task.hash.as_ref().map(|h| h.blake3.as_str()),
        verdict = %report.verdict,
        engines = ?engines,
        detecting_engines = ?report.detecting_engines(),
        failed_engines = ?report.failed_engines(),
        duration_ms = report.duration.as_millis() as u64,
        "Verdict reached"
    );
}

/// Emits an audit event for a routed task.
pub fn emit_task_routed(task: &FileTask) {
    let (operation, placed_at) = match &task.outcome {
        Some(TaskOutcome::Delivered { path }) => ("delivered", path.display().to_string()),
        Some(TaskOutcome::Archived { artifact }) => ("archived", artifact.display().to_string()),
        _ => return,
    };

    tracing::info!(
        target: "quarantine_gate::audit",
        event_type = "task_routed",
        task_id = %task.id,
        source = %task.source.path.display(),
        file_hash_blake3 = ?task.hash.as_ref().map(|h| h.blake3.as_str()),
        operation = %operation,
        placed_at = %placed_at,
        "File routed"
    );
}

/// Emits an audit event for a failed task.
pub fn emit_task_failed(task: &FileTask, kind: FailureKind, reason: &str) {
    tracing::warn!(
        target: "quarantine_gate::audit",
        event_type = "task_failed",
        task_id = %task.id,
        source = %task.source.path.display(),
        file_hash_blake3 = ?task.hash.as_ref().map(|h| h.blake3.as_str()),
        stage = %task.state,
        failure_kind = %kind,
        reason = %reason,
        "Task failed"
    );
}

/// Emits an audit event when the throttle stops admission.
pub fn emit_throttle_stop(source: &Path, size: u64, decision: &ThrottleDecision) {
    tracing::info!(
        target: "quarantine_gate::audit",
        event_type = "throttle_stop",
        source = %source.display(),
        size,
        reason = %decision.reason,
        free_space = ?decision.free_space,
        files_today = decision.usage.files_processed,
        bytes_today = decision.usage.bytes_processed,
        "Admission stopped by throttle"
    );
}

/// Emits an audit event for a finished run.
pub fn emit_run_summary(summary: &RunSummary) {
    tracing::info!(
        target: "quarantine_gate::audit",
        event_type = "run_summary",
        clean = summary.clean,
        suspect = summary.suspect,
        scan_error = summary.scan_error,
        failed = summary.failed_total(),
        resumed = summary.resumed,
        not_attempted = summary.not_attempted,
        throttle_reason = ?summary.throttle_reason,
        fatal = ?summary.fatal,
        duration_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
        "Run finished"
    );
}

/// Emits an audit event for an instance lock operation.
pub fn emit_lock_event(path: &Path, operation: &str, previous_pid: Option<u32>) {
    tracing::info!(
        target: "quarantine_gate::audit",
        event_type = "instance_lock",
        path = %path.display(),
        operation = %operation,
        pid = std::process::id(),
        previous_pid = ?previous_pid,
        "Instance lock operation"
    );
}
