//! The per-file state machine.

use crate::core::{FailureKind, FileHash, ScanVerdict, SourceFile, TaskId};
use crate::quarantine::QuarantineRecord;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stages of a file's journey.
///
/// ```text
/// PENDING -> HASHED -> QUARANTINED -> SCANNED -> ROUTED
///    \__________\___________\____________\______-> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Admitted, nothing done yet.
    Pending,
    /// Source content hash computed.
    Hashed,
    /// Verified copy placed in quarantine.
    Quarantined,
    /// Verdict reached.
    Scanned,
    /// Delivered or archived. Terminal.
    Routed,
    /// Stopped at some stage. Terminal.
    Failed,
}

impl TaskState {
    /// Returns `true` for `Routed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Routed | Self::Failed)
    }

    /// Returns `true` if `next` is a legal successor.
    pub fn can_advance_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Hashed)
                | (Hashed, Quarantined)
                | (Quarantined, Scanned)
                | (Scanned, Routed)
                | (Pending | Hashed | Quarantined | Scanned, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Hashed => "HASHED",
            Self::Quarantined => "QUARANTINED",
            Self::Scanned => "SCANNED",
            Self::Routed => "ROUTED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Where a task ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Clean file delivered to the destination.
    Delivered {
        /// Final destination path.
        path: PathBuf,
    },
    /// Suspect file moved to the hazard archive.
    Archived {
        /// Artifact path.
        artifact: PathBuf,
    },
    /// The task stopped short of routing.
    Failed {
        /// Failure taxonomy entry.
        kind: FailureKind,
        /// Human-readable reason.
        reason: String,
    },
}

/// One file's journey through the gate.
///
/// Owned by exactly one worker from admission to a terminal state.
#[derive(Debug, Clone)]
pub struct FileTask {
    /// Unique task id; also the quarantine key.
    pub id: TaskId,
    /// Source identity.
    pub source: SourceFile,
    /// Current state.
    pub state: TaskState,
    /// Source content hash, once computed.
    pub hash: Option<FileHash>,
    /// Quarantine payload, once placed.
    pub quarantine_path: Option<PathBuf>,
    /// Combined verdict, once scanned.
    pub verdict: Option<ScanVerdict>,
    /// Final outcome, once terminal.
    pub outcome: Option<TaskOutcome>,
    /// `true` if picked up from quarantine by a later run.
    pub resumed: bool,
    /// When each state was entered.
    pub stages: Vec<(TaskState, DateTime<Utc>)>,
}

impl FileTask {
    /// Creates a freshly admitted task.
    pub fn new(source: SourceFile) -> Self {
        Self {
            id: TaskId::new(),
            source,
            state: TaskState::Pending,
            hash: None,
            quarantine_path: None,
            verdict: None,
            outcome: None,
            resumed: false,
            stages: vec![(TaskState::Pending, Utc::now())],
        }
    }

    /// Rebuilds a task from a quarantine record left by an earlier run.
    ///
    /// The task starts at QUARANTINED; its source is not read again.
    pub fn resumed(record: &QuarantineRecord, payload: PathBuf) -> Self {
        Self {
            id: record.task_id.clone(),
            source: record.source(),
            state: TaskState::Quarantined,
            hash: Some(record.file_hash.clone()),
            quarantine_path: Some(payload),
            verdict: None,
            outcome: None,
            resumed: true,
            stages: vec![(TaskState::Quarantined, Utc::now())],
        }
    }

    /// Moves to `next`, stamping the time.
    ///
    /// Illegal transitions are ignored and logged; they indicate a bug in
    /// the caller, not a property of the file.
    pub fn advance(&mut self, next: TaskState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::error!(
                task_id = %self.id,
                from = %self.state,
                to = %next,
                "Illegal task transition"
            );
            return false;
        }
        self.state = next;
        self.stages.push((next, Utc::now()));
        true
    }

    /// Marks the task FAILED with `kind`.
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) {
        if self.advance(TaskState::Failed) {
            self.outcome = Some(TaskOutcome::Failed {
                kind,
                reason: reason.into(),
            });
        }
    }

    /// Marks the task ROUTED with `outcome`.
    pub fn finish(&mut self, outcome: TaskOutcome) {
        if self.advance(TaskState::Routed) {
            self.outcome = Some(outcome);
        }
    }

    /// When `state` was entered, if it was.
    pub fn entered(&self, state: TaskState) -> Option<DateTime<Utc>> {
        self.stages.iter().find(|(s, _)| *s == state).map(|(_, t)| *t)
    }

    /// Failure kind, if the task failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            Some(TaskOutcome::Failed { kind, .. }) => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> FileTask {
        FileTask::new(SourceFile::new("/in/a.txt", 3))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task();
        for next in [
            TaskState::Hashed,
            TaskState::Quarantined,
            TaskState::Scanned,
        ] {
            assert!(t.advance(next));
        }
        t.finish(TaskOutcome::Delivered {
            path: "/out/a.txt".into(),
        });

        assert_eq!(t.state, TaskState::Routed);
        assert!(t.state.is_terminal());
        assert!(t.entered(TaskState::Quarantined).is_some());
        assert_eq!(t.stages.len(), 5);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut t = task();
        assert!(!t.advance(TaskState::Scanned));
        assert!(!t.advance(TaskState::Routed));
        assert_eq!(t.state, TaskState::Pending);

        t.fail(FailureKind::Io, "gone");
        assert!(!t.advance(TaskState::Hashed));
        assert_eq!(t.failure_kind(), Some(FailureKind::Io));
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        for state in [
            TaskState::Pending,
            TaskState::Hashed,
            TaskState::Quarantined,
            TaskState::Scanned,
        ] {
            assert!(state.can_advance_to(TaskState::Failed));
        }
        assert!(!TaskState::Routed.can_advance_to(TaskState::Failed));
    }

    #[test]
    fn test_resumed_task_starts_quarantined() {
        let source = SourceFile::new("/in/a.txt", 3);
        let record = QuarantineRecord::new(TaskId::new(), &source, FileHash::new("abc"));
        let t = FileTask::resumed(&record, "/q/data/x.qdata".into());

        assert!(t.resumed);
        assert_eq!(t.state, TaskState::Quarantined);
        assert_eq!(t.id, record.task_id);
        assert_eq!(t.hash, Some(FileHash::new("abc")));
    }
}
