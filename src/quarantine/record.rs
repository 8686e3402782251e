//! Quarantine record types.

use crate::core::{FileHash, SourceFile, TaskId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a quarantined task stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Placed and verified, outcome not yet determined.
    Pending,
    /// No engine produced a usable verdict.
    ScanFailed,
    /// Routing failed; held for manual inspection.
    RouteFailed,
}

impl RecordState {
    /// Returns `true` if a later run may pick this record up on its own.
    pub fn is_resumable(&self, retry_scan_failed: bool) -> bool {
        match self {
            Self::Pending => true,
            Self::ScanFailed => retry_scan_failed,
            Self::RouteFailed => false,
        }
    }
}

/// Metadata about a quarantined file, stored as `meta/{task_id}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Task that owns the payload.
    pub task_id: TaskId,

    /// Where the file came from.
    pub source_path: PathBuf,

    /// Original file name, used when routing.
    pub original_name: String,

    /// Size of the file in bytes.
    pub size: u64,

    /// Hash of the source at copy time; the payload hashes to the same value.
    pub file_hash: FileHash,

    /// When the payload was verified and placed.
    pub quarantined_at: DateTime<Utc>,

    /// Current state.
    pub state: RecordState,

    /// Why the record left `Pending`, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Number of runs that have picked this record up again.
    #[serde(default)]
    pub resume_count: u32,
}

impl QuarantineRecord {
    /// Creates a new pending record.
    pub fn new(task_id: TaskId, source: &SourceFile, file_hash: FileHash) -> Self {
        Self {
            task_id,
            source_path: source.path.clone(),
            original_name: source.file_name(),
            size: source.size,
            file_hash,
            quarantined_at: Utc::now(),
            state: RecordState::Pending,
            last_error: None,
            resume_count: 0,
        }
    }

    /// Source identity as recorded at placement.
    pub fn source(&self) -> SourceFile {
        SourceFile::new(self.source_path.clone(), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable_states() {
        assert!(RecordState::Pending.is_resumable(false));
        assert!(!RecordState::ScanFailed.is_resumable(false));
        assert!(RecordState::ScanFailed.is_resumable(true));
        assert!(!RecordState::RouteFailed.is_resumable(true));
    }

    #[test]
    fn test_record_keeps_source_identity() {
        let source = SourceFile::new("/in/report.pdf", 42);
        let record = QuarantineRecord::new(TaskId::new(), &source, FileHash::new("abc"));

        assert_eq!(record.original_name, "report.pdf");
        assert_eq!(record.source(), source);
        assert_eq!(record.state, RecordState::Pending);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "pending");
        assert!(json.get("last_error").is_none());
    }
}
