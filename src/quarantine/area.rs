//! Filesystem quarantine area.

use crate::core::error::{QuarantineError, QuarantineResult};
use crate::core::fsio;
use crate::core::{FileHash, FileHasher, SourceFile, TaskId};
use crate::quarantine::record::{QuarantineRecord, RecordState};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const PAYLOAD_EXT: &str = "qdata";
const PARTIAL_EXT: &str = "partial";
const RECORD_EXT: &str = "json";

/// Isolated holding area for files not yet cleared by scanning.
///
/// Payloads are stored under their task id, never under their original
/// name, so nothing in quarantine can be opened by accident.
///
/// # Directory Structure
///
/// ```text
/// quarantine/
/// ├── data/
/// │   ├── {task_id}.partial   # Copy in progress, not yet verified
/// │   └── {task_id}.qdata     # Verified payload
/// └── meta/
///     └── {task_id}.json      # QuarantineRecord
/// ```
///
/// A payload is renamed from `.partial` to `.qdata` before its record is
/// written, so a record always points at a verified payload. Anything in
/// `data/` without a record is debris from an interrupted run.
#[derive(Debug)]
pub struct QuarantineArea {
    root: PathBuf,
    hasher: FileHasher,
    index: RwLock<HashMap<TaskId, QuarantineRecord>>,
}

impl QuarantineArea {
    /// Opens (creating if needed) the quarantine area at `root` and loads
    /// existing records.
    pub fn open(root: impl Into<PathBuf>) -> QuarantineResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("data"))?;
        fs::create_dir_all(root.join("meta"))?;

        let area = Self {
            root,
            hasher: FileHasher::new(),
            index: RwLock::new(HashMap::new()),
        };
        area.load_index()?;
        Ok(area)
    }

    /// Uses `hasher` for integrity checks.
    pub fn with_hasher(mut self, hasher: FileHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Root directory of the area.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the verified payload for `id`.
    pub fn payload_path(&self, id: &TaskId) -> PathBuf {
        self.data_dir().join(format!("{id}.{PAYLOAD_EXT}"))
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    fn partial_path(&self, id: &TaskId) -> PathBuf {
        self.data_dir().join(format!("{id}.{PARTIAL_EXT}"))
    }

    fn meta_path(&self, id: &TaskId) -> PathBuf {
        self.meta_dir().join(format!("{id}.{RECORD_EXT}"))
    }

    fn load_index(&self) -> QuarantineResult<()> {
        let mut index = self.index.write();
        for entry in fs::read_dir(self.meta_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXT) {
                continue;
            }

            let record = match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<QuarantineRecord>(&bytes).map_err(|e| e.to_string())
                }) {
                Ok(record) => record,
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "Skipping unreadable quarantine record");
                    continue;
                }
            };

            if !self.payload_path(&record.task_id).is_file() {
                tracing::warn!(
                    task_id = %record.task_id,
                    "Quarantine record has no payload, dropping it"
                );
                let _ = fs::remove_file(&path);
                continue;
            }

            index.insert(record.task_id.clone(), record);
        }

        tracing::debug!(count = index.len(), "Loaded quarantine index");
        Ok(())
    }

    fn save_record(&self, record: &QuarantineRecord) -> QuarantineResult<()> {
        let path = self.meta_path(&record.task_id);
        fsio::write_json_atomic(&path, record).map_err(|e| QuarantineError::Metadata {
            path,
            reason: e.to_string(),
        })
    }

    /// Copies `source` into quarantine and verifies the copy.
    ///
    /// The source is only read. On an integrity mismatch the partial copy
    /// is removed and `CopyIntegrity` is returned.
    pub fn place(
        &self,
        id: &TaskId,
        source: &SourceFile,
        source_hash: &FileHash,
    ) -> QuarantineResult<QuarantineRecord> {
        let partial = self.partial_path(id);
        let outcome = self.copy_and_verify(&source.path, &partial, source_hash);
        if let Err(e) = outcome {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        let payload = self.payload_path(id);
        fsio::rename_durable(&partial, &payload)?;

        let record = QuarantineRecord::new(id.clone(), source, source_hash.clone());
        if let Err(e) = self.save_record(&record) {
            let _ = fs::remove_file(&payload);
            return Err(e);
        }
        self.index.write().insert(id.clone(), record.clone());

        tracing::debug!(
            task_id = %id,
            payload = %payload.display(),
            file_hash = %source_hash,
            "Payload placed in quarantine"
        );
        Ok(record)
    }

    fn copy_and_verify(
        &self,
        from: &Path,
        to: &Path,
        expected: &FileHash,
    ) -> QuarantineResult<()> {
        fsio::copy_durable(from, to)?;
        let actual = self.hasher.hash_file(to)?;
        if !actual.same_content(expected) {
            return Err(QuarantineError::CopyIntegrity {
                expected: expected.blake3.clone(),
                actual: actual.blake3,
            });
        }
        Ok(())
    }

    /// Re-hashes the payload and checks it still matches its record.
    pub fn verify(&self, id: &TaskId) -> QuarantineResult<FileHash> {
        let record = self.record(id).ok_or_else(|| QuarantineError::NotFound {
            id: id.to_string(),
        })?;
        let actual = self.hasher.hash_file(&self.payload_path(id))?;
        if !actual.same_content(&record.file_hash) {
            return Err(QuarantineError::CopyIntegrity {
                expected: record.file_hash.blake3,
                actual: actual.blake3,
            });
        }
        Ok(actual)
    }

    /// Moves a record to `state`, remembering why.
    pub fn mark(
        &self,
        id: &TaskId,
        state: RecordState,
        reason: Option<String>,
    ) -> QuarantineResult<()> {
        let mut index = self.index.write();
        let record = index.get_mut(id).ok_or_else(|| QuarantineError::NotFound {
            id: id.to_string(),
        })?;
        let mut updated = record.clone();
        updated.state = state;
        updated.last_error = reason;
        self.save_record(&updated)?;
        *record = updated;
        Ok(())
    }

    /// Counts one more pickup of a record by a later run.
    pub fn note_resumed(&self, id: &TaskId) -> QuarantineResult<QuarantineRecord> {
        let mut index = self.index.write();
        let record = index.get_mut(id).ok_or_else(|| QuarantineError::NotFound {
            id: id.to_string(),
        })?;
        let mut updated = record.clone();
        updated.resume_count += 1;
        updated.state = RecordState::Pending;
        self.save_record(&updated)?;
        *record = updated.clone();
        Ok(updated)
    }

    /// Removes a payload and its record once the task has left quarantine.
    ///
    /// The record goes first, so an interruption leaves an orphan payload
    /// for [`purge_orphans`](Self::purge_orphans) rather than a record
    /// pointing at nothing.
    pub fn discard(&self, id: &TaskId) -> QuarantineResult<()> {
        self.index.write().remove(id);
        remove_if_present(&self.meta_path(id))?;
        remove_if_present(&self.payload_path(id))?;
        tracing::debug!(task_id = %id, "Quarantine entry discarded");
        Ok(())
    }

    /// Returns a record by id.
    pub fn record(&self, id: &TaskId) -> Option<QuarantineRecord> {
        self.index.read().get(id).cloned()
    }

    /// Records a later run should pick up, oldest first.
    pub fn resumable(&self, retry_scan_failed: bool) -> Vec<QuarantineRecord> {
        let mut records: Vec<_> = self
            .index
            .read()
            .values()
            .filter(|r| r.state.is_resumable(retry_scan_failed))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.quarantined_at
                .cmp(&b.quarantined_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        records
    }

    /// Returns `true` if any record came from `source`.
    pub fn holds_source(&self, source: &Path) -> bool {
        self.index.read().values().any(|r| r.source_path == source)
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns `true` if the area holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Deletes partial copies and payloads without a record.
    ///
    /// Neither ever reached QUARANTINED, so their sources were never
    /// consumed and will be admitted again.
    pub fn purge_orphans(&self) -> QuarantineResult<usize> {
        let index = self.index.read();
        let mut purged = 0;
        for entry in fs::read_dir(self.data_dir())? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let orphan = match path.extension().and_then(|s| s.to_str()) {
                Some(PARTIAL_EXT) => true,
                Some(PAYLOAD_EXT) => !index.contains_key(&TaskId::from_string(stem)),
                _ => false,
            };
            if orphan {
                remove_if_present(&path)?;
                purged += 1;
                tracing::info!(path = %path.display(), "Removed orphaned quarantine file");
            }
        }
        Ok(purged)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
