//! Persisted daily usage counters.

use crate::core::error::TrackerError;
use crate::core::fsio;

use chrono::{Local, NaiveDate};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files and bytes admitted on one calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsageRecord {
    /// Files admitted.
    pub files_processed: u64,
    /// Bytes admitted.
    pub bytes_processed: u64,
}

/// Source of "today" for the ledger.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

type Ledger = BTreeMap<NaiveDate, DailyUsageRecord>;

/// Thread- and process-safe daily usage ledger.
///
/// The ledger is a human-readable JSON file keyed by date:
///
/// ```json
/// {
///   "2024-03-09": { "files_processed": 12, "bytes_processed": 73400320 }
/// }
/// ```
///
/// Every update happens inside one critical section made of an in-process
/// mutex and an exclusive `fs2` lock on `<ledger>.lock`. Inside it the
/// ledger is re-read from disk, updated and durably replaced, so concurrent
/// writers in other processes are never lost.
pub struct DailyUsageTracker {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
    clock: Clock,
}

impl DailyUsageTracker {
    /// Opens the ledger at `path`, creating its directory if needed.
    ///
    /// An existing ledger must parse; a corrupt one is an error rather than
    /// a silent quota reset.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.as_os_str().to_os_string();
        lock_name.push(".lock");

        let tracker = Self {
            lock_path: PathBuf::from(lock_name),
            path,
            guard: Mutex::new(()),
            clock: Arc::new(|| Local::now().date_naive()),
        };
        tracker.load()?;
        Ok(tracker)
    }

    /// Replaces the clock, mainly for tests that cross midnight.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Ledger path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Today's date according to the tracker's clock.
    pub fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    /// Usage recorded for `date`; zero if the day has no entry yet.
    pub fn get(&self, date: NaiveDate) -> Result<DailyUsageRecord, TrackerError> {
        Ok(self.load()?.get(&date).copied().unwrap_or_default())
    }

    /// Counts one admitted file of `bytes` against today.
    pub fn record(&self, bytes: u64) -> Result<DailyUsageRecord, TrackerError> {
        self.record_if(bytes, |_| true)
            .map(|(usage, _)| usage)
    }

    /// Evaluates `admit` against today's fresh totals and, if it returns
    /// `true`, records one file of `bytes`, all in one critical section.
    ///
    /// Returns today's usage after the call and whether it was recorded.
    pub fn record_if<F>(
        &self,
        bytes: u64,
        admit: F,
    ) -> Result<(DailyUsageRecord, bool), TrackerError>
    where
        F: FnOnce(&DailyUsageRecord) -> bool,
    {
        self.update(|ledger, today| {
            let entry = ledger.entry(today).or_default();
            if !admit(entry) {
                return (*entry, false);
            }
            entry.files_processed = entry.files_processed.saturating_add(1);
            entry.bytes_processed = entry.bytes_processed.saturating_add(bytes);
            (*entry, true)
        })
    }

    /// Sets today's counters, for resuming a day from another source or
    /// for tests.
    pub fn initialize_with_values(
        &self,
        files: u64,
        bytes: u64,
    ) -> Result<DailyUsageRecord, TrackerError> {
        let (usage, _) = self.update(|ledger, today| {
            let record = DailyUsageRecord {
                files_processed: files,
                bytes_processed: bytes,
            };
            ledger.insert(today, record);
            (record, true)
        })?;
        Ok(usage)
    }

    fn update<F>(&self, mutate: F) -> Result<(DailyUsageRecord, bool), TrackerError>
    where
        F: FnOnce(&mut Ledger, NaiveDate) -> (DailyUsageRecord, bool),
    {
        let _guard = self.guard.lock();
        let lock_file = self.lock_file()?;
        lock_file
            .lock_exclusive()
            .map_err(|source| TrackerError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;

        let result = (|| -> Result<(DailyUsageRecord, bool), TrackerError> {
            let mut ledger = self.load()?;
            let (usage, changed) = mutate(&mut ledger, self.today());
            if changed {
                fsio::write_json_atomic(&self.path, &ledger)?;
            }
            Ok((usage, changed))
        })();

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn lock_file(&self) -> Result<File, TrackerError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| TrackerError::Lock {
                path: self.lock_path.clone(),
                source,
            })
    }

    fn load(&self) -> Result<Ledger, TrackerError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Ledger::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| TrackerError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Debug for DailyUsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyUsageTracker")
            .field("path", &self.path)
            .finish()
    }
}
