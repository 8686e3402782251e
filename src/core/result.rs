//! Scan result structures.
//!
//! An [`EngineFinding`] is what one engine said about one file. A
//! [`ScanReport`] combines the findings of every engine that looked at the
//! file into a single worst-of verdict.

use crate::core::types::ScanVerdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What one engine reported for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFinding {
    /// Name of the engine that produced this finding.
    pub engine: String,

    /// The engine's verdict, already mapped to the three-value contract.
    pub verdict: ScanVerdict,

    /// Engine output or error text worth keeping (threat name, exit code, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// How long the engine ran.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl EngineFinding {
    /// Creates a new finding.
    pub fn new(engine: impl Into<String>, verdict: ScanVerdict, duration: Duration) -> Self {
        Self {
            engine: engine.into(),
            verdict,
            detail: None,
            duration,
        }
    }

    /// Creates a `SCAN_ERROR` finding carrying the error text.
    pub fn error(engine: impl Into<String>, reason: impl Into<String>, duration: Duration) -> Self {
        Self::new(engine, ScanVerdict::ScanError, duration).with_detail(reason)
    }

    /// Sets the detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.detail = (!detail.is_empty()).then_some(detail);
        self
    }
}

/// The combined result of scanning one file with one or more engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Worst-of verdict across all findings.
    pub verdict: ScanVerdict,

    /// Individual findings, one per engine invocation.
    pub findings: Vec<EngineFinding>,

    /// When the scan completed.
    pub completed_at: DateTime<Utc>,

    /// Wall-clock time spent scanning.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ScanReport {
    /// Creates a report from a single engine finding.
    pub fn single(finding: EngineFinding) -> Self {
        let duration = finding.duration;
        Self::from_findings(vec![finding], duration)
    }

    /// Creates a report from several findings, combining them worst-of.
    pub fn from_findings(findings: Vec<EngineFinding>, duration: Duration) -> Self {
        let verdict = ScanVerdict::worst_of(findings.iter().map(|f| f.verdict));
        Self {
            verdict,
            findings,
            completed_at: Utc::now(),
            duration,
        }
    }

    /// Flattens several reports (for example from nested composites) into one.
    pub fn merge(reports: Vec<ScanReport>, duration: Duration) -> Self {
        let findings = reports.into_iter().flat_map(|r| r.findings).collect();
        Self::from_findings(findings, duration)
    }

    /// Returns `true` if all engines reported clean.
    pub fn is_clean(&self) -> bool {
        self.verdict.is_clean()
    }

    /// Returns `true` if any engine flagged the file.
    pub fn is_suspect(&self) -> bool {
        self.verdict.is_suspect()
    }

    /// Returns the engines that flagged the file.
    pub fn detecting_engines(&self) -> Vec<&str> {
        self.findings
            .iter()
            .filter(|f| f.verdict.is_suspect())
            .map(|f| f.engine.as_str())
            .collect()
    }

    /// Returns the engines that failed to produce a verdict.
    pub fn failed_engines(&self) -> Vec<&str> {
        self.findings
            .iter()
            .filter(|f| f.verdict.is_error())
            .map(|f| f.engine.as_str())
            .collect()
    }

    /// Number of engine findings in this report.
    pub fn engine_count(&self) -> usize {
        self.findings.len()
    }
}

/// Serde helper for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
