//! Core types used throughout the quarantine gate.
//!
//! This module defines scan verdicts, file hashes, task identifiers and the
//! source-file identity that every task starts from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The verdict of one engine invocation, or of several combined.
///
/// Variants are ordered by severity so that the worst-of rule is simply
/// `max`: `Suspect > ScanError > Clean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanVerdict {
    /// No engine found anything.
    Clean,
    /// At least one engine could not produce a verdict.
    ScanError,
    /// At least one engine flagged the file.
    Suspect,
}

impl ScanVerdict {
    /// Returns `true` if the verdict is clean.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    /// Returns `true` if the verdict is suspect.
    pub fn is_suspect(&self) -> bool {
        matches!(self, Self::Suspect)
    }

    /// Returns `true` if the verdict is a scan error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ScanError)
    }

    /// Combines two verdicts by the worst-of rule.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    /// Combines any number of verdicts by the worst-of rule.
    ///
    /// An empty set is a scan error: no engine ran, so nothing cleared the file.
    pub fn worst_of(verdicts: impl IntoIterator<Item = ScanVerdict>) -> Self {
        verdicts.into_iter().max().unwrap_or(Self::ScanError)
    }
}

impl fmt::Display for ScanVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "CLEAN"),
            Self::ScanError => write!(f, "SCAN_ERROR"),
            Self::Suspect => write!(f, "SUSPECT"),
        }
    }
}

/// File hash information.
///
/// BLAKE3 is the primary hash used for every integrity comparison.
/// SHA256 is optional and only recorded for external tooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash {
    /// BLAKE3 hash (always computed, used for integrity checks).
    pub blake3: String,

    /// SHA256 hash (optional, for hazard manifests and external lookups).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl FileHash {
    /// Creates a new `FileHash` with only BLAKE3.
    pub fn new(blake3: impl Into<String>) -> Self {
        Self {
            blake3: blake3.into(),
            sha256: None,
        }
    }

    /// Sets the SHA256 hash.
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    /// Returns the primary hash (BLAKE3).
    pub fn primary(&self) -> &str {
        &self.blake3
    }

    /// Returns `true` if both hashes describe the same content. SHA-256 is
    /// compared only when both sides carry one.
    pub fn same_content(&self, other: &FileHash) -> bool {
        let sha256_agrees = match (&self.sha256, &other.sha256) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.blake3 == other.blake3 && sha256_agrees
    }

    /// Short prefix of the primary hash, used in file names.
    pub fn short(&self) -> &str {
        let end = self.blake3.len().min(16);
        &self.blake3[..end]
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blake3:{}", self.blake3)
    }
}

/// Unique identifier of one file's journey through the gate.
///
/// The same id names the quarantine payload and its metadata record, so a
/// task can be resumed after a crash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Creates a task ID from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a candidate file in the source directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Absolute or configured-relative path of the source file.
    pub path: PathBuf,
    /// Size in bytes at enumeration time.
    pub size: u64,
}

impl SourceFile {
    /// Creates a new source identity.
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Returns the bare file name, falling back to a placeholder for odd paths.
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

/// Returns the last path component as a string, or `"unnamed"`.
pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unnamed".to_string())
}
