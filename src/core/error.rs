//! Error types for the quarantine gate.
//!
//! Errors are split by scope. Per-engine and per-file errors (`ScanError`,
//! `QuarantineError`, `RouteError`) stay inside the worker that hit them and
//! end up as a [`FailureKind`] in the run summary. Run-level errors
//! (`GateError`) abort startup or stop further admission.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while invoking a single scanning engine.
///
/// None of these ever reach the router directly: [`scan_within`] folds
/// them into a `SCAN_ERROR` verdict for the engine that produced them.
///
/// [`scan_within`]: crate::core::scan_within
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scanning engine is unavailable or not responding.
    #[error("engine '{engine}' is unavailable: {reason}")]
    EngineUnavailable {
        /// Name of the engine that is unavailable.
        engine: String,
        /// Human-readable reason for unavailability.
        reason: String,
    },

    /// The scan operation timed out.
    #[error("scan timed out after {elapsed:?} on engine '{engine}'")]
    Timeout {
        /// Name of the engine that timed out.
        engine: String,
        /// How long the operation ran before timing out.
        elapsed: Duration,
    },

    /// The engine process could not be started.
    #[error("failed to spawn engine '{engine}' ({program}): {source}")]
    Spawn {
        /// Name of the engine.
        engine: String,
        /// Program that was invoked.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// File not found at the specified path.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path that was not found.
        path: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },
}

impl ScanError {
    /// Returns `true` if a later attempt could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::EngineUnavailable { .. } | Self::Spawn { .. }
        )
    }

    /// Returns the engine name if this error is associated with one.
    pub fn engine(&self) -> Option<&str> {
        match self {
            Self::EngineUnavailable { engine, .. }
            | Self::Timeout { engine, .. }
            | Self::Spawn { engine, .. } => Some(engine),
            _ => None,
        }
    }

    /// Creates an `EngineUnavailable` error.
    pub fn engine_unavailable(engine: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            engine: engine.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(engine: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            engine: engine.into(),
            elapsed,
        }
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Error type for quarantine placement and bookkeeping.
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// The quarantine copy does not hash to the source hash.
    #[error("quarantine copy integrity check failed: expected {expected}, got {actual}")]
    CopyIntegrity {
        /// Source hash taken before the copy.
        expected: String,
        /// Hash of the copy that landed in quarantine.
        actual: String,
    },

    /// A metadata record could not be read or written.
    #[error("quarantine metadata error for {path}: {reason}")]
    Metadata {
        /// Path of the metadata file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Quarantine record not found.
    #[error("quarantine record not found: {id}")]
    NotFound {
        /// The task ID that was not found.
        id: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for routing a scanned file to its final place.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The delivered copy does not hash to the quarantine copy.
    #[error("delivered copy integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Hash of the quarantine copy.
        expected: String,
        /// Hash found at the destination.
        actual: String,
    },

    /// The destination name is taken and the collision policy rejects overwrites.
    #[error("destination already exists: {path}")]
    Collision {
        /// The conflicting destination path.
        path: PathBuf,
    },

    /// The destination or hazard directory cannot be written at all.
    #[error("target directory {path} is unavailable: {source}")]
    DestinationUnavailable {
        /// Directory that could not be written.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The task has no quarantine copy to route.
    #[error("task {task_id} has no quarantine copy")]
    NotQuarantined {
        /// Task that was routed too early.
        task_id: String,
    },

    /// Sealing or opening a hazard artifact failed.
    #[error("hazard encryption error: {0}")]
    Encryption(String),

    /// Quarantine bookkeeping failed after placement.
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouteError {
    /// Returns `true` if this error makes further routing pointless for the
    /// whole run, not just this file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DestinationUnavailable { .. })
    }

    /// Maps the error onto the per-file failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Integrity { .. } => FailureKind::RouteIntegrity,
            Self::Collision { .. } => FailureKind::RouteCollision,
            _ => FailureKind::Io,
        }
    }
}

/// Errors from the persisted daily usage ledger.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The ledger exists but cannot be parsed.
    #[error("usage ledger {path} is corrupt: {reason}")]
    Corrupt {
        /// Ledger path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// The cross-process ledger lock could not be taken.
    #[error("failed to lock usage ledger {path}: {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level errors. Any of these stops the orchestrator from admitting
/// files; startup variants abort before a single file is touched.
#[derive(Debug, Error)]
pub enum GateError {
    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another live orchestrator holds the instance lock.
    #[error("another instance holds {path} (pid {})", pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into()))]
    LockHeld {
        /// Lock file path.
        path: PathBuf,
        /// Owning process, if the sentinel was readable.
        pid: Option<u32>,
    },

    /// A configured directory is missing, unreadable or unwritable.
    #[error("invalid path {path}: {reason}")]
    PathValidation {
        /// Offending path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// A scanning engine reports a version that has not been tested.
    #[error("engine '{engine}' version '{version}' is not in the tested-version ledger")]
    UntestedVersion {
        /// Engine name.
        engine: String,
        /// Reported signature or engine version.
        version: String,
    },

    /// A failure that makes continuing the run unsafe.
    #[error("fatal I/O failure: {0}")]
    FatalIo(String),

    /// The daily usage ledger failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Quarantine area setup failed.
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Creates a `PathValidation` error.
    pub fn path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PathValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Per-file failure taxonomy, as reported in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The quarantine copy did not match the source.
    CopyIntegrity,
    /// No engine produced a usable verdict.
    ScanEngine,
    /// The delivered copy did not match the quarantine copy.
    RouteIntegrity,
    /// The destination name was taken under the reject policy.
    RouteCollision,
    /// Any other filesystem failure.
    Io,
}

impl FailureKind {
    /// Every failure kind, in reporting order.
    pub const ALL: [FailureKind; 5] = [
        Self::CopyIntegrity,
        Self::ScanEngine,
        Self::RouteIntegrity,
        Self::RouteCollision,
        Self::Io,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CopyIntegrity => "copy_integrity",
            Self::ScanEngine => "scan_engine",
            Self::RouteIntegrity => "route_integrity",
            Self::RouteCollision => "route_collision",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A specialized `Result` type for quarantine operations.
pub type QuarantineResult<T> = Result<T, QuarantineError>;

/// A specialized `Result` type for routing operations.
pub type RouteResult<T> = Result<T, RouteError>;

/// A specialized `Result` type for run-level operations.
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_is_recoverable() {
        let timeout = ScanError::timeout("clamscan", Duration::from_secs(30));
        assert!(timeout.is_recoverable());

        let missing = ScanError::FileNotFound {
            path: "/q/data/x.qdata".into(),
        };
        assert!(!missing.is_recoverable());
    }

    #[test]
    fn test_scan_error_engine() {
        let err = ScanError::engine_unavailable("defender", "service not running");
        assert_eq!(err.engine(), Some("defender"));

        let io_err = ScanError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io_err.engine(), None);
    }

    #[test]
    fn test_route_error_fatality() {
        let fatal = RouteError::DestinationUnavailable {
            path: "/dest".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(fatal.is_fatal());

        let collision = RouteError::Collision {
            path: "/dest/a.txt".into(),
        };
        assert!(!collision.is_fatal());
        assert_eq!(collision.failure_kind(), FailureKind::RouteCollision);
    }

    #[test]
    fn test_lock_held_display() {
        let err = GateError::LockHeld {
            path: "/run/qg.lock".into(),
            pid: Some(4242),
        };
        assert!(err.to_string().contains("4242"));

        let err = GateError::LockHeld {
            path: "/run/qg.lock".into(),
            pid: None,
        };
        assert!(err.to_string().contains("unknown"));
    }
}
