//! Run summary and exit codes.

use crate::config::PolicyConfig;
use crate::core::{FailureKind, ScanVerdict};
use crate::throttle::ThrottleReason;
use crate::worker::{TaskOutcome, TaskReport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Process exit code for a run with nothing to report.
pub const EXIT_OK: i32 = 0;
/// Process exit code when a counted failure kind occurred.
pub const EXIT_FAILURES: i32 = 1;
/// Process exit code when the run hit a fatal error.
pub const EXIT_FATAL: i32 = 2;
/// Process exit code when the run could not start.
pub const EXIT_STARTUP: i32 = 3;

/// What happened during one run.
///
/// `clean` and `suspect` count files delivered and archived. `scan_error`
/// counts files left in quarantine without a verdict; they also appear in
/// `failed` under `scan_engine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Files delivered to the destination.
    pub clean: u64,
    /// Files moved to the hazard archive.
    pub suspect: u64,
    /// Files without a usable verdict.
    pub scan_error: u64,
    /// Failed tasks by kind.
    pub failed: BTreeMap<FailureKind, u64>,
    /// Tasks picked up from quarantine left by an earlier run.
    pub resumed: u64,
    /// Sources never admitted because admission stopped.
    pub not_attempted: u64,
    /// Why admission stopped early, if the throttle stopped it.
    pub throttle_reason: Option<ThrottleReason>,
    /// The fatal error that stopped admission, if any.
    pub fatal: Option<String>,
    /// `true` if an operator stop request ended admission.
    pub stopped: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Creates an empty summary starting now.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            clean: 0,
            suspect: 0,
            scan_error: 0,
            failed: BTreeMap::new(),
            resumed: 0,
            not_attempted: 0,
            throttle_reason: None,
            fatal: None,
            stopped: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// Folds one finished task into the counts.
    pub fn record(&mut self, report: &TaskReport) {
        if report.task.resumed {
            self.resumed += 1;
        }
        if report.task.verdict == Some(ScanVerdict::ScanError) {
            self.scan_error += 1;
        }
        match &report.task.outcome {
            Some(TaskOutcome::Delivered { .. }) => self.clean += 1,
            Some(TaskOutcome::Archived { .. }) => self.suspect += 1,
            Some(TaskOutcome::Failed { kind, .. }) => *self.failed.entry(*kind).or_default() += 1,
            None => {}
        }
        if self.fatal.is_none() {
            self.fatal = report.fatal.clone();
        }
    }

    /// Total failed tasks.
    pub fn failed_total(&self) -> u64 {
        self.failed.values().sum()
    }

    /// Total tasks that reached a terminal state.
    pub fn processed(&self) -> u64 {
        self.clean + self.suspect + self.failed_total()
    }

    /// Exit code under `policy`: fatal beats counted failures beats success.
    pub fn exit_code(&self, policy: &PolicyConfig) -> i32 {
        if self.fatal.is_some() {
            return EXIT_FATAL;
        }
        let counted = self
            .failed
            .iter()
            .any(|(kind, n)| *n > 0 && policy.exit_on.contains(kind));
        if counted {
            EXIT_FAILURES
        } else {
            EXIT_OK
        }
    }

    /// Stamps the finish time.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clean={} suspect={} scan_error={} failed={} resumed={} not_attempted={}",
            self.clean,
            self.suspect,
            self.scan_error,
            self.failed_total(),
            self.resumed,
            self.not_attempted
        )?;
        if let Some(reason) = self.throttle_reason {
            write!(f, " throttle={reason}")?;
        }
        if let Some(fatal) = &self.fatal {
            write!(f, " fatal=\"{fatal}\"")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceFile;
    use crate::worker::{FileTask, TaskState};

    fn report(outcome: TaskOutcome, verdict: Option<ScanVerdict>) -> TaskReport {
        let mut task = FileTask::new(SourceFile::new("/in/a", 1));
        task.verdict = verdict;
        task.state = if matches!(outcome, TaskOutcome::Failed { .. }) {
            TaskState::Failed
        } else {
            TaskState::Routed
        };
        task.outcome = Some(outcome);
        TaskReport { task, fatal: None }
    }

    #[test]
    fn test_counts_and_exit_codes() {
        let mut summary = RunSummary::new();
        summary.record(&report(
            TaskOutcome::Delivered { path: "/out/a".into() },
            Some(ScanVerdict::Clean),
        ));
        summary.record(&report(
            TaskOutcome::Failed {
                kind: FailureKind::ScanEngine,
                reason: "timeout".into(),
            },
            Some(ScanVerdict::ScanError),
        ));

        assert_eq!(summary.clean, 1);
        assert_eq!(summary.scan_error, 1);
        assert_eq!(summary.failed[&FailureKind::ScanEngine], 1);
        assert_eq!(summary.processed(), 2);

        let mut policy = PolicyConfig::default();
        assert_eq!(summary.exit_code(&policy), EXIT_FAILURES);

        policy.exit_on = vec![FailureKind::CopyIntegrity];
        assert_eq!(summary.exit_code(&policy), EXIT_OK);

        summary.fatal = Some("destination unavailable".into());
        assert_eq!(summary.exit_code(&policy), EXIT_FATAL);
    }

    #[test]
    fn test_display() {
        let mut summary = RunSummary::new();
        summary.throttle_reason = Some(ThrottleReason::DailyFileLimit);
        summary.not_attempted = 2;
        let text = summary.to_string();
        assert!(text.contains("not_attempted=2"));
        assert!(text.contains("throttle=DAILY_FILE_LIMIT"));
    }
}
