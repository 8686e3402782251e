//! Runs one file through hash, quarantine, scan and route.

use crate::audit;
use crate::core::error::QuarantineError;
use crate::core::{fsio, scan_within, ArcScanner, FailureKind, FileHasher, ScanReport, TaskId};
use crate::notify::{Notifier, NotifyLevel, TracingNotifier};
use crate::quarantine::{QuarantineArea, RecordState};
use crate::routing::{ResultRouter, RouteOutcome};
use crate::worker::task::{FileTask, TaskOutcome, TaskState};

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// A finished task as handed back to the orchestrator.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// The task in its terminal state.
    pub task: FileTask,
    /// Set when the failure makes further admission unsafe.
    pub fatal: Option<String>,
}

/// Why a task stopped short of ROUTED.
#[derive(Debug)]
struct Stop {
    kind: FailureKind,
    reason: String,
    fatal: bool,
}

impl Stop {
    fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            fatal: false,
        }
    }
}

/// Owns a task from admission to a terminal state.
///
/// Every per-file error ends in `FAILED` with a [`FailureKind`]; nothing a
/// single file does can abort the run except a destination that is gone,
/// which is reported back as fatal.
#[derive(Debug)]
pub struct Worker {
    scanner: ArcScanner,
    scan_timeout: Duration,
    quarantine: Arc<QuarantineArea>,
    router: Arc<ResultRouter>,
    notifier: Arc<dyn Notifier>,
    hasher: FileHasher,
    remove_source: bool,
}

impl Worker {
    /// Creates a worker.
    pub fn new(
        scanner: ArcScanner,
        quarantine: Arc<QuarantineArea>,
        router: Arc<ResultRouter>,
    ) -> Self {
        Self {
            scanner,
            scan_timeout: Duration::from_secs(300),
            quarantine,
            router,
            notifier: Arc::new(TracingNotifier),
            hasher: FileHasher::new(),
            remove_source: true,
        }
    }

    /// Sets the per-engine timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Sets the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the hasher used on sources.
    pub fn with_hasher(mut self, hasher: FileHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Whether a source is removed once its verified copy is in quarantine.
    pub fn with_remove_source(mut self, remove: bool) -> Self {
        self.remove_source = remove;
        self
    }

    /// Drives `task` to ROUTED or FAILED.
    pub async fn process(&self, mut task: FileTask) -> TaskReport {
        let span = tracing::info_span!(
            "task",
            task_id = %task.id,
            source = %task.source.path.display(),
        );

        let result = self.drive(&mut task).instrument(span.clone()).await;

        span.in_scope(|| match result {
            Ok(()) => {
                audit::emit_task_routed(&task);
                TaskReport { task, fatal: None }
            }
            Err(stop) => {
                // Logged before the transition so the event names the stage that failed.
                audit::emit_task_failed(&task, stop.kind, &stop.reason);
                let fatal = stop.fatal.then(|| stop.reason.clone());
                if !stop.fatal {
                    self.notifier.notify(
                        NotifyLevel::Warning,
                        "File failed",
                        &format!(
                            "{} ({}): {}",
                            task.source.path.display(),
                            stop.kind,
                            stop.reason
                        ),
                    );
                }
                task.fail(stop.kind, stop.reason);
                TaskReport { task, fatal }
            }
        })
    }

    async fn drive(&self, task: &mut FileTask) -> Result<(), Stop> {
        match task.state {
            TaskState::Pending => self.admit(task).await?,
            TaskState::Quarantined if task.resumed => self.reverify(task).await?,
            state => {
                return Err(Stop::new(
                    FailureKind::Io,
                    format!("task handed to worker in state {state}"),
                ))
            }
        }

        let report = self.scan(task).await;
        self.route(task, report).await
    }

    /// PENDING -> HASHED -> QUARANTINED, then consumes the source.
    async fn admit(&self, task: &mut FileTask) -> Result<(), Stop> {
        let hasher = self.hasher.clone();
        let path = task.source.path.clone();
        let hash = fsio::blocking(move || hasher.hash_file(&path))
            .await
            .and_then(|r| r)
            .map_err(|e| Stop::new(FailureKind::Io, format!("cannot hash source: {e}")))?;
        task.hash = Some(hash.clone());
        task.advance(TaskState::Hashed);

        let area = Arc::clone(&self.quarantine);
        let id = task.id.clone();
        let source = task.source.clone();
        let placed = fsio::blocking(move || area.place(&id, &source, &hash)).await;
        match placed {
            Ok(Ok(_)) => {}
            Ok(Err(e @ QuarantineError::CopyIntegrity { .. })) => {
                return Err(Stop::new(FailureKind::CopyIntegrity, e.to_string()))
            }
            Ok(Err(e)) => return Err(Stop::new(FailureKind::Io, e.to_string())),
            Err(e) => return Err(Stop::new(FailureKind::Io, e.to_string())),
        }
        task.quarantine_path = Some(self.quarantine.payload_path(&task.id));
        task.advance(TaskState::Quarantined);
        audit::emit_task_quarantined(task);

        if self.remove_source {
            let path = task.source.path.clone();
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(error = %e, "Could not remove source after quarantine");
            }
        }
        Ok(())
    }

    /// Checks a resumed payload and finishes consuming its source.
    async fn reverify(&self, task: &mut FileTask) -> Result<(), Stop> {
        let area = Arc::clone(&self.quarantine);
        let id = task.id.clone();
        match fsio::blocking(move || area.verify(&id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.mark(&task.id, RecordState::RouteFailed, e.to_string()).await;
                let kind = match e {
                    QuarantineError::CopyIntegrity { .. } => FailureKind::CopyIntegrity,
                    _ => FailureKind::Io,
                };
                return Err(Stop::new(kind, e.to_string()));
            }
            Err(e) => return Err(Stop::new(FailureKind::Io, e.to_string())),
        }

        tracing::info!(file_hash = ?task.hash.as_ref().map(|h| h.short()), "Resuming quarantined task");

        if self.remove_source && task.source.path.is_file() {
            let hasher = self.hasher.clone();
            let path = task.source.path.clone();
            let expected = task.hash.clone();
            let consumed = fsio::blocking(move || -> std::io::Result<bool> {
                let current = hasher.hash_file(&path)?;
                if expected.is_some_and(|h| h.same_content(&current)) {
                    std::fs::remove_file(&path)?;
                    return Ok(true);
                }
                Ok(false)
            })
            .await
            .and_then(|r| r);
            match consumed {
                Ok(true) => tracing::info!("Finished consuming source of resumed task"),
                Ok(false) => tracing::warn!("Source changed since quarantine, leaving it in place"),
                Err(e) => tracing::warn!(error = %e, "Could not consume source of resumed task"),
            }
        }
        Ok(())
    }

    /// QUARANTINED -> SCANNED.
    async fn scan(&self, task: &mut FileTask) -> ScanReport {
        let payload = self.quarantine.payload_path(&task.id);
        let report = scan_within(self.scanner.as_ref(), &payload, self.scan_timeout).await;
        task.verdict = Some(report.verdict);
        task.advance(TaskState::Scanned);
        audit::emit_verdict(task, &report);
        report
    }

    /// SCANNED -> ROUTED, or FAILED with the file still in quarantine.
    async fn route(&self, task: &mut FileTask, report: ScanReport) -> Result<(), Stop> {
        let router = Arc::clone(&self.router);
        let snapshot = task.clone();
        let routed = fsio::blocking(move || {
            let outcome = router.route(&snapshot, &report);
            (outcome, report)
        })
        .await
        .map_err(|e| Stop::new(FailureKind::Io, e.to_string()))?;

        match routed {
            (Ok(RouteOutcome::Destination { path }), _) => {
                task.finish(TaskOutcome::Delivered { path });
                Ok(())
            }
            (Ok(RouteOutcome::Hazard { artifact, .. }), report) => {
                self.notifier.notify(
                    NotifyLevel::Warning,
                    "Suspect file archived",
                    &format!(
                        "{} flagged by {} and moved to {}",
                        task.source.path.display(),
                        report.detecting_engines().join(", "),
                        artifact.display()
                    ),
                );
                task.finish(TaskOutcome::Archived { artifact });
                Ok(())
            }
            (Ok(RouteOutcome::Retained), report) => {
                let reason = format!(
                    "no verdict from {}",
                    report.failed_engines().join(", ")
                );
                self.mark(&task.id, RecordState::ScanFailed, reason.clone()).await;
                Err(Stop::new(FailureKind::ScanEngine, reason))
            }
            (Err(e), _) => {
                let fatal = e.is_fatal();
                if !fatal {
                    self.mark(&task.id, RecordState::RouteFailed, e.to_string()).await;
                }
                Err(Stop {
                    kind: e.failure_kind(),
                    reason: e.to_string(),
                    fatal,
                })
            }
        }
    }

    async fn mark(&self, id: &TaskId, state: RecordState, reason: String) {
        let area = Arc::clone(&self.quarantine);
        let id = id.clone();
        let result = fsio::blocking(move || area.mark(&id, state, Some(reason))).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Could not update quarantine record"),
            Err(e) => tracing::error!(error = %e, "Could not update quarantine record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MockScanner, EICAR_MARKER};
    use crate::core::{ScanVerdict, SourceFile};
    use crate::notify::MemoryNotifier;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        quarantine: Arc<QuarantineArea>,
        notifier: Arc<MemoryNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            for sub in ["in", "out", "hazard"] {
                fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            let quarantine = Arc::new(QuarantineArea::open(dir.path().join("q")).unwrap());
            Self {
                dir,
                quarantine,
                notifier: Arc::new(MemoryNotifier::new()),
            }
        }

        fn path(&self, sub: &str) -> PathBuf {
            self.dir.path().join(sub)
        }

        fn worker(&self, scanner: MockScanner) -> Worker {
            let router = ResultRouter::new(
                Arc::clone(&self.quarantine),
                self.path("out"),
                self.path("hazard"),
            );
            Worker::new(Arc::new(scanner), Arc::clone(&self.quarantine), Arc::new(router))
                .with_scan_timeout(Duration::from_millis(200))
                .with_notifier(self.notifier.clone())
        }

        fn task(&self, name: &str, content: &[u8]) -> FileTask {
            let path = self.path("in").join(name);
            fs::write(&path, content).unwrap();
            FileTask::new(SourceFile::new(path, content.len() as u64))
        }
    }

    fn count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_clean_file_reaches_destination() {
        let fx = Fixture::new();
        let task = fx.task("a.txt", b"hello");
        let source = task.source.path.clone();

        let report = fx.worker(MockScanner::new()).process(task).await;

        assert_eq!(report.task.state, TaskState::Routed);
        assert_eq!(report.task.verdict, Some(ScanVerdict::Clean));
        assert_eq!(fs::read(fx.path("out").join("a.txt")).unwrap(), b"hello");
        assert!(!source.exists(), "source is consumed");
        assert!(fx.quarantine.is_empty());
        assert!(report.task.entered(TaskState::Hashed).is_some());
    }

    #[tokio::test]
    async fn test_marker_file_reaches_hazard_only() {
        let fx = Fixture::new();
        let task = fx.task("evil.bin", EICAR_MARKER.as_bytes());

        let report = fx.worker(MockScanner::new()).process(task).await;

        assert!(matches!(
            report.task.outcome,
            Some(TaskOutcome::Archived { .. })
        ));
        assert_eq!(count(&fx.path("out")), 0);
        assert_eq!(count(&fx.path("hazard")), 2, "artifact and manifest");
        assert_eq!(fx.notifier.count(NotifyLevel::Warning), 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_file_in_quarantine() {
        let fx = Fixture::new();
        let task = fx.task("slow.txt", b"data");
        let id = task.id.clone();
        let scanner = MockScanner::new().with_latency(Duration::from_secs(30));

        let report = fx.worker(scanner).process(task).await;

        assert_eq!(report.task.failure_kind(), Some(FailureKind::ScanEngine));
        assert_eq!(report.task.verdict, Some(ScanVerdict::ScanError));
        assert!(report.fatal.is_none());
        let record = fx.quarantine.record(&id).unwrap();
        assert_eq!(record.state, RecordState::ScanFailed);
        assert!(fx.quarantine.payload_path(&id).exists());
        assert_eq!(count(&fx.path("out")), 0);
    }

    #[tokio::test]
    async fn test_missing_source_fails_with_io() {
        let fx = Fixture::new();
        let task = FileTask::new(SourceFile::new(fx.path("in").join("ghost"), 1));

        let report = fx.worker(MockScanner::new()).process(task).await;

        assert_eq!(report.task.failure_kind(), Some(FailureKind::Io));
        assert!(fx.quarantine.is_empty());
    }

    #[tokio::test]
    async fn test_collision_marks_route_failed() {
        let fx = Fixture::new();
        fs::write(fx.path("out").join("a.txt"), b"taken").unwrap();
        let task = fx.task("a.txt", b"hello");
        let id = task.id.clone();

        let report = fx.worker(MockScanner::new()).process(task).await;

        assert_eq!(report.task.failure_kind(), Some(FailureKind::RouteCollision));
        assert_eq!(fx.quarantine.record(&id).unwrap().state, RecordState::RouteFailed);
        assert!(fx.quarantine.resumable(true).is_empty());
    }

    #[tokio::test]
    async fn test_missing_destination_is_fatal() {
        let fx = Fixture::new();
        fs::remove_dir_all(fx.path("out")).unwrap();
        let task = fx.task("a.txt", b"hello");
        let id = task.id.clone();

        let report = fx.worker(MockScanner::new()).process(task).await;

        assert!(report.fatal.is_some());
        assert_eq!(report.task.state, TaskState::Failed);
        assert_eq!(fx.quarantine.record(&id).unwrap().state, RecordState::Pending);
    }

    #[tokio::test]
    async fn test_resumed_task_is_rescanned_without_source() {
        let fx = Fixture::new();
        let task = fx.task("a.txt", b"hello");
        let hash = FileHasher::new().hash_file(&task.source.path).unwrap();
        let record = fx.quarantine.place(&task.id, &task.source, &hash).unwrap();
        let resumed = FileTask::resumed(&record, fx.quarantine.payload_path(&task.id));

        let report = fx.worker(MockScanner::new()).process(resumed).await;

        assert_eq!(report.task.state, TaskState::Routed);
        assert!(report.task.resumed);
        assert!(!task.source.path.exists(), "resume finishes consuming the source");
        assert!(fx.quarantine.is_empty());
    }
}
