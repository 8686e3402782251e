//! Notification and version-ledger collaborators.
//!
//! The gate reports run summaries, suspect detections and fatal errors
//! through a [`Notifier`]; how a notification is delivered is up to the
//! implementation. At startup it checks each engine's reported version
//! against a [`VersionLedger`].

use crate::core::error::{GateError, GateResult};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::path::Path;

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    /// Routine information, such as a run summary.
    Info,
    /// Something an operator should look at.
    Warning,
    /// The run could not continue.
    Critical,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Receives operator-facing notifications.
pub trait Notifier: Send + Sync + Debug {
    /// Delivers one notification. Must not block for long.
    fn notify(&self, level: NotifyLevel, title: &str, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NotifyLevel, title: &str, message: &str) {
        match level {
            NotifyLevel::Info => tracing::info!(target: "quarantine_gate::notify", %title, %message),
            NotifyLevel::Warning => {
                tracing::warn!(target: "quarantine_gate::notify", %title, %message)
            }
            NotifyLevel::Critical => {
                tracing::error!(target: "quarantine_gate::notify", %title, %message)
            }
        }
    }
}

/// One captured notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Severity.
    pub level: NotifyLevel,
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
}

/// Keeps notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Number of notifications at `level`.
    pub fn count(&self, level: NotifyLevel) -> usize {
        self.sent.lock().iter().filter(|n| n.level == level).count()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, level: NotifyLevel, title: &str, message: &str) {
        self.sent.lock().push(Notification {
            level,
            title: title.to_string(),
            message: message.to_string(),
        });
    }
}

/// Answers whether an engine version has been tested with this gate.
pub trait VersionLedger: Send + Sync + Debug {
    /// Returns `true` if `version` is known good.
    fn is_version_tested(&self, version: &str) -> bool;
}

/// A ledger stored as a JSON array of version strings.
#[derive(Debug, Clone, Default)]
pub struct JsonVersionLedger {
    versions: BTreeSet<String>,
}

impl JsonVersionLedger {
    /// Builds a ledger from known versions.
    pub fn from_versions<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            versions: versions.into_iter().map(Into::into).collect(),
        }
    }

    /// Loads `["1.2.3", ...]` from `path`.
    pub fn load(path: &Path) -> GateResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| GateError::path(path, format!("cannot read version ledger: {e}")))?;
        let versions: Vec<String> = serde_json::from_slice(&bytes).map_err(|e| {
            GateError::configuration(format!(
                "version ledger {} is malformed: {e}",
                path.display()
            ))
        })?;
        Ok(Self::from_versions(versions))
    }

    /// Number of known versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns `true` if no versions are known.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl VersionLedger for JsonVersionLedger {
    fn is_version_tested(&self, version: &str) -> bool {
        self.versions.contains(version.trim())
    }
}
