//! The run loop.

use crate::audit;
use crate::config::{build_scanner, GateConfig, ScanErrorPolicy, UntestedVersionPolicy};
use crate::core::error::{GateError, GateResult};
use crate::core::{fsio, leaf_engines, ArcScanner, FailureKind, SourceFile};
use crate::notify::{JsonVersionLedger, Notifier, NotifyLevel, TracingNotifier, VersionLedger};
use crate::orchestrator::lock::InstanceLock;
use crate::orchestrator::summary::RunSummary;
use crate::quarantine::QuarantineArea;
use crate::routing::ResultRouter;
use crate::throttle::{DailyUsageTracker, FsSpaceProbe, SpaceProbe, ThrottleGate};
use crate::worker::{FileTask, TaskReport, Worker};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Asks a running orchestrator to stop admitting files.
///
/// In-flight tasks still run to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Requests a stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs `config` once with default collaborators.
pub async fn run(config: GateConfig) -> GateResult<RunSummary> {
    Orchestrator::new(config).run().await
}

/// One run of the gate: lock, resume, enumerate, admit, drain.
///
/// Collaborators default to what the configuration describes and can be
/// replaced for embedding or tests.
#[derive(Debug)]
pub struct Orchestrator {
    config: GateConfig,
    scanner: Option<ArcScanner>,
    notifier: Arc<dyn Notifier>,
    space_probe: Option<Arc<dyn SpaceProbe>>,
    version_ledger: Option<Arc<dyn VersionLedger>>,
    tracker: Option<Arc<DailyUsageTracker>>,
    stop: StopHandle,
}

impl Orchestrator {
    /// Creates an orchestrator for `config`.
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            scanner: None,
            notifier: Arc::new(TracingNotifier),
            space_probe: None,
            version_ledger: None,
            tracker: None,
            stop: StopHandle::default(),
        }
    }

    /// Uses `scanner` instead of building one from the engine list.
    pub fn with_scanner(mut self, scanner: ArcScanner) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Sets the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replaces the free-space probe.
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = Some(probe);
        self
    }

    /// Replaces the tested-version ledger.
    pub fn with_version_ledger(mut self, ledger: Arc<dyn VersionLedger>) -> Self {
        self.version_ledger = Some(ledger);
        self
    }

    /// Replaces the usage tracker.
    pub fn with_tracker(mut self, tracker: Arc<DailyUsageTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Handle for stopping this run from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs once.
    ///
    /// # Errors
    ///
    /// Only startup failures are errors: bad configuration, unusable
    /// directories, a held lock or an untested engine under the abort
    /// policy. Everything after the first file is touched ends up in the
    /// returned summary.
    pub async fn run(self) -> GateResult<RunSummary> {
        let mut summary = RunSummary::new();
        let config = &self.config;
        let paths = &config.paths;

        let scanner = match &self.scanner {
            Some(scanner) => {
                config.validate_settings()?;
                Arc::clone(scanner)
            }
            None => {
                config.validate()?;
                build_scanner(&config.engines, config.engine_mode, config.scan_timeout())?
            }
        };

        let dirs = paths.clone();
        fsio::blocking(move || prepare_directories(&dirs)).await??;

        let lock_path = paths.lock_file();
        let lock = fsio::blocking(move || InstanceLock::acquire(lock_path)).await??;

        self.check_engines(&scanner).await?;

        let tracker = match &self.tracker {
            Some(tracker) => Arc::clone(tracker),
            None => Arc::new(DailyUsageTracker::open(paths.usage_ledger())?),
        };
        let hasher = config.hashing.hasher();
        let quarantine =
            Arc::new(QuarantineArea::open(&paths.quarantine)?.with_hasher(hasher.clone()));
        let purged = quarantine.purge_orphans()?;
        if purged > 0 {
            tracing::info!(purged, "Removed orphaned quarantine files");
        }

        let probe: Arc<dyn SpaceProbe> = match &self.space_probe {
            Some(probe) => Arc::clone(probe),
            None => Arc::new(FsSpaceProbe::new(&paths.quarantine)),
        };
        let gate = Arc::new(ThrottleGate::new(config.throttle.limits(), tracker, probe));

        let mut router = ResultRouter::new(
            Arc::clone(&quarantine),
            paths.destination.clone(),
            paths.hazard.clone(),
        )
        .with_collision_policy(config.routing.collision)
        .with_hasher(hasher.clone());
        if let Some(key) = config.hazard_key()? {
            router = router.with_hazard_key(key);
        }
        let worker = Arc::new(
            Worker::new(scanner, Arc::clone(&quarantine), Arc::new(router))
                .with_scan_timeout(config.scan_timeout())
                .with_notifier(Arc::clone(&self.notifier))
                .with_remove_source(config.routing.remove_source)
                .with_hasher(hasher),
        );

        let pool = Pool {
            permits: Arc::new(Semaphore::new(config.workers)),
            tasks: JoinSet::new(),
            fatal: Arc::new(AtomicBool::new(false)),
            worker,
            gate: Arc::clone(&gate),
        };

        tracing::info!(
            source = %paths.source.display(),
            workers = config.workers,
            "Run started"
        );

        // Listed before anything is dispatched: a listing failure must not
        // leave resumed tasks behind in a dropped pool.
        let sources = enumerate_sources(&paths.source, &quarantine)?;
        tracing::info!(candidates = sources.len(), "Enumerated source files");
        let pool = self.resume(pool, &quarantine).await;
        let mut pool = self.admit(pool, sources, &mut summary).await;

        while let Some(joined) = pool.tasks.join_next().await {
            match joined {
                Ok(report) => summary.record(&report),
                Err(e) => {
                    tracing::error!(error = %e, "Worker task panicked");
                    *summary.failed.entry(FailureKind::Io).or_default() += 1;
                }
            }
        }

        summary.finish();
        self.report(&summary);
        drop(lock);
        Ok(summary)
    }

    /// Dispatches records left in quarantine by earlier runs. They were
    /// counted when first admitted, so the gate is not consulted.
    async fn resume(&self, mut pool: Pool, quarantine: &Arc<QuarantineArea>) -> Pool {
        let retry = self.config.policy.scan_error == ScanErrorPolicy::RetryNextRun;
        for record in quarantine.resumable(retry) {
            if self.stop.is_stopped() || pool.fatal.load(Ordering::SeqCst) {
                break;
            }
            let record = match quarantine.note_resumed(&record.task_id) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(task_id = %record.task_id, error = %e, "Cannot resume quarantined task");
                    continue;
                }
            };
            let task = FileTask::resumed(&record, quarantine.payload_path(&record.task_id));
            let Ok(permit) = Arc::clone(&pool.permits).acquire_owned().await else {
                break;
            };
            pool.spawn(task, permit, None);
        }
        pool
    }

    /// Admits fresh sources until they run out or admission stops.
    async fn admit(
        &self,
        mut pool: Pool,
        sources: Vec<SourceFile>,
        summary: &mut RunSummary,
    ) -> Pool {
        let total = sources.len();
        for (index, source) in sources.into_iter().enumerate() {
            let remaining = (total - index) as u64;

            let Ok(permit) = Arc::clone(&pool.permits).acquire_owned().await else {
                summary.not_attempted = remaining;
                break;
            };
            if self.stop.is_stopped() {
                tracing::info!("Stop requested, halting admission");
                summary.stopped = true;
                summary.not_attempted = remaining;
                break;
            }
            if pool.fatal.load(Ordering::SeqCst) {
                tracing::error!("Fatal failure in flight, halting admission");
                summary.not_attempted = remaining;
                break;
            }

            let gate = Arc::clone(&pool.gate);
            let size = source.size;
            let decision = match fsio::blocking(move || gate.evaluate(size)).await {
                Ok(result) => result,
                Err(e) => Err(GateError::Io(e)),
            };
            match decision {
                Ok(decision) if decision.admitted => {
                    pool.spawn(FileTask::new(source), permit, Some(size));
                }
                Ok(decision) => {
                    audit::emit_throttle_stop(&source.path, size, &decision);
                    tracing::info!(
                        reason = %decision.reason,
                        not_attempted = remaining,
                        "Throttle stopped admission"
                    );
                    summary.throttle_reason = Some(decision.reason);
                    summary.not_attempted = remaining;
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Throttle gate failed, halting admission");
                    summary.fatal = Some(GateError::FatalIo(e.to_string()).to_string());
                    summary.not_attempted = remaining;
                    break;
                }
            }
        }
        pool
    }

    async fn check_engines(&self, scanner: &ArcScanner) -> GateResult<()> {
        let ledger = match (&self.version_ledger, &self.config.paths.version_ledger) {
            (Some(ledger), _) => Some(Arc::clone(ledger)),
            (None, Some(path)) => {
                let path = path.clone();
                let loaded = fsio::blocking(move || JsonVersionLedger::load(&path)).await??;
                Some(Arc::new(loaded) as Arc<dyn VersionLedger>)
            }
            (None, None) => None,
        };

        // A hung engine binary must not hold the lock forever.
        let limit = self.config.scan_timeout();
        for engine in leaf_engines(scanner) {
            match tokio::time::timeout(limit, engine.health_check()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(engine = engine.name(), error = %e, "Engine health check failed");
                }
                Err(_) => {
                    tracing::warn!(
                        engine = engine.name(),
                        timeout_secs = limit.as_secs(),
                        "Engine health check timed out"
                    );
                }
            }
            let Some(ledger) = &ledger else {
                continue;
            };
            let version = tokio::time::timeout(limit, engine.signature_version())
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!(engine = engine.name(), "Engine version probe timed out");
                    None
                });
            let Some(version) = version else {
                tracing::warn!(engine = engine.name(), "Engine reported no version to check");
                continue;
            };
            if ledger.is_version_tested(&version) {
                tracing::info!(engine = engine.name(), version = %version, "Engine version is tested");
                continue;
            }
            let err = GateError::UntestedVersion {
                engine: engine.name().to_string(),
                version,
            };
            match self.config.policy.untested_version {
                UntestedVersionPolicy::Abort => return Err(err),
                UntestedVersionPolicy::Warn => {
                    tracing::warn!(error = %err, "Continuing with untested engine version");
                    self.notifier
                        .notify(NotifyLevel::Warning, "Untested engine version", &err.to_string());
                }
            }
        }
        Ok(())
    }

    fn report(&self, summary: &RunSummary) {
        audit::emit_run_summary(summary);
        self.notifier
            .notify(NotifyLevel::Info, "Run finished", &summary.to_string());
        if let Some(fatal) = &summary.fatal {
            self.notifier
                .notify(NotifyLevel::Critical, "Run aborted", fatal);
        }
    }
}

/// Bounded set of in-flight tasks.
struct Pool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<TaskReport>,
    fatal: Arc<AtomicBool>,
    worker: Arc<Worker>,
    gate: Arc<ThrottleGate>,
}

impl Pool {
    /// Runs `task` on the pool. `reserved` is the space the gate booked
    /// for it, given back once the task is terminal.
    fn spawn(
        &mut self,
        task: FileTask,
        permit: tokio::sync::OwnedSemaphorePermit,
        reserved: Option<u64>,
    ) {
        let worker = Arc::clone(&self.worker);
        let gate = Arc::clone(&self.gate);
        let fatal = Arc::clone(&self.fatal);
        self.tasks.spawn(async move {
            let report = worker.process(task).await;
            if let Some(bytes) = reserved {
                gate.release(bytes);
            }
            if report.fatal.is_some() {
                fatal.store(true, Ordering::SeqCst);
            }
            drop(permit);
            report
        });
    }
}

/// Checks the source is readable and every other directory is writable,
/// creating the ones that do not exist yet.
fn prepare_directories(paths: &crate::config::PathsConfig) -> GateResult<()> {
    fs::read_dir(&paths.source)
        .map_err(|e| GateError::path(&paths.source, format!("source is not readable: {e}")))?;

    for dir in paths.writable_dirs() {
        fs::create_dir_all(dir)
            .map_err(|e| GateError::path(dir, format!("cannot create directory: {e}")))?;
        let probe = dir.join(format!(".quarantine-gate-probe-{}", std::process::id()));
        fs::write(&probe, b"")
            .and_then(|()| fs::remove_file(&probe))
            .map_err(|e| GateError::path(dir, format!("directory is not writable: {e}")))?;
    }

    let lock_dir = paths.lock_file();
    if let Some(parent) = lock_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| GateError::path(parent, format!("cannot create directory: {e}")))?;
    }
    Ok(())
}

/// Regular files directly under `source`, sorted by path, minus those a
/// quarantine record already claims.
fn enumerate_sources(source: &Path, quarantine: &QuarantineArea) -> GateResult<Vec<SourceFile>> {
    let entries = fs::read_dir(source)
        .map_err(|e| GateError::path(source, format!("cannot list source: {e}")))?;
    Ok(collect_sources(entries, quarantine))
}

/// Entries that fail to read, typically files a producer removed while the
/// directory was being listed, are skipped.
fn collect_sources(
    entries: impl IntoIterator<Item = io::Result<fs::DirEntry>>,
    quarantine: &QuarantineArea,
) -> Vec<SourceFile> {
    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read source entry, skipping");
                continue;
            }
        };
        let path: PathBuf = entry.path();
        match entry.file_type() {
            Ok(file_type) if file_type.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read source entry, skipping");
                continue;
            }
        }
        if quarantine.holds_source(&path) {
            tracing::debug!(path = %path.display(), "Source already held in quarantine, skipping");
            continue;
        }
        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Source vanished while listing, skipping");
                continue;
            }
        };
        files.push(SourceFile::new(path, size));
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}
