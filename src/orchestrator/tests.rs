use super::*;
use crate::backends::EICAR_MARKER;
use crate::config::{
    GateConfig, HashingConfig, MockEngineSpec, PathsConfig, PolicyConfig, ScanErrorPolicy,
    ScannerSpec, ThrottleConfig, UntestedVersionPolicy,
};
use crate::core::error::GateError;
use crate::core::{
    EngineFinding, FailureKind, FileHasher, ScanError, ScanReport, ScanVerdict, Scanner,
    SourceFile, TaskId,
};
use crate::notify::{JsonVersionLedger, MemoryNotifier, NotifyLevel};
use crate::quarantine::{QuarantineArea, RecordState};
use crate::routing::HazardManifest;
use crate::throttle::{DailyUsageTracker, SpaceProbe, ThrottleReason};

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Env {
    _dir: TempDir,
    config: GateConfig,
    notifier: Arc<MemoryNotifier>,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::under(dir.path());
        fs::create_dir_all(&paths.source).unwrap();
        let config = GateConfig::new(paths)
            .with_engine(ScannerSpec::mock())
            .with_workers(2)
            .with_scan_timeout(Duration::from_secs(5));
        Self {
            _dir: dir,
            config,
            notifier: Arc::new(MemoryNotifier::new()),
        }
    }

    fn paths(&self) -> &PathsConfig {
        &self.config.paths
    }

    fn add(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.paths().source.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn add_many(&self, count: usize, size: usize) {
        for i in 0..count {
            self.add(&format!("file-{i:03}.bin"), &vec![b'a' + (i % 26) as u8; size]);
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.config.clone()).with_notifier(self.notifier.clone())
    }

    fn tracker(&self) -> DailyUsageTracker {
        DailyUsageTracker::open(self.paths().usage_ledger()).unwrap()
    }

    fn files_in(&self, dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Free space that shrinks as files land in the destination.
#[derive(Debug)]
struct DestinationProbe {
    capacity: u64,
    dir: PathBuf,
}

impl SpaceProbe for DestinationProbe {
    fn available_bytes(&self) -> std::io::Result<u64> {
        let mut used = 0;
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries {
                used += entry?.metadata()?.len();
            }
        }
        Ok(self.capacity.saturating_sub(used))
    }
}

/// Clean verdicts, but deletes the destination on its first scan.
#[derive(Debug)]
struct VanishingDestination {
    destination: PathBuf,
}

#[async_trait]
impl Scanner for VanishingDestination {
    fn name(&self) -> &str {
        "vanishing"
    }

    async fn scan(&self, _path: &Path) -> Result<ScanReport, ScanError> {
        let _ = fs::remove_dir_all(&self.destination);
        Ok(ScanReport::single(EngineFinding::new(
            self.name(),
            ScanVerdict::Clean,
            Duration::ZERO,
        )))
    }
}

#[tokio::test]
async fn test_scenario_a_space_floor() {
    let mut env = Env::new();
    env.config = env
        .config
        .clone()
        .with_workers(1)
        .with_throttle(ThrottleConfig {
            min_free_space: crate::config::ByteSize(100),
            ..Default::default()
        });
    env.add_many(20, 100);
    let probe = Arc::new(DestinationProbe {
        capacity: 1000,
        dir: env.paths().destination.clone(),
    });

    let summary = env.orchestrator().with_space_probe(probe).run().await.unwrap();

    assert_eq!(summary.clean, 9);
    assert_eq!(summary.throttle_reason, Some(ThrottleReason::SpaceExhausted));
    assert_eq!(summary.not_attempted, 11);
    assert_eq!(env.files_in(&env.paths().destination).len(), 9);
    assert_eq!(env.files_in(&env.paths().source).len(), 11);
    assert_eq!(summary.exit_code(&env.config.policy), EXIT_OK);
}

#[tokio::test]
async fn test_scenario_b_daily_file_limit() {
    let mut env = Env::new();
    env.config = env.config.clone().with_throttle(ThrottleConfig {
        max_files_per_day: 10,
        ..Default::default()
    });
    env.tracker().initialize_with_values(7, 0).unwrap();
    env.add_many(5, 10);

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.clean, 3);
    assert_eq!(summary.throttle_reason, Some(ThrottleReason::DailyFileLimit));
    assert_eq!(summary.not_attempted, 2);
    let tracker = env.tracker();
    assert_eq!(tracker.get(tracker.today()).unwrap().files_processed, 10);
}

#[tokio::test]
async fn test_scenario_c_daily_volume_limit() {
    let mut env = Env::new();
    env.config = env.config.clone().with_throttle(ThrottleConfig {
        max_volume_per_day: crate::config::ByteSize(50),
        ..Default::default()
    });
    env.tracker().initialize_with_values(0, 30).unwrap();
    env.add_many(10, 5);

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.clean, 4);
    assert_eq!(summary.throttle_reason, Some(ThrottleReason::DailyVolumeLimit));
    assert_eq!(summary.not_attempted, 6);
    let tracker = env.tracker();
    let usage = tracker.get(tracker.today()).unwrap();
    assert_eq!(usage.files_processed, 4);
    assert_eq!(usage.bytes_processed, 50);
}

#[tokio::test]
async fn test_scenario_d_malware_goes_to_hazard_only() {
    let env = Env::new();
    env.add("clean.txt", b"nothing to see");
    env.add("evil.com", EICAR_MARKER.as_bytes());

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.clean, 1);
    assert_eq!(summary.suspect, 1);
    assert_eq!(env.files_in(&env.paths().destination), vec!["clean.txt"]);
    let hazard = env.files_in(&env.paths().hazard);
    assert_eq!(hazard.len(), 2);
    assert!(hazard.iter().all(|name| name.contains("evil.com")));
    assert!(env.files_in(&env.paths().source).is_empty());
    assert_eq!(env.notifier.count(NotifyLevel::Warning), 1);
    assert_eq!(summary.exit_code(&env.config.policy), EXIT_OK);
}

#[tokio::test]
async fn test_sha256_recorded_in_hazard_manifest_when_enabled() {
    let mut env = Env::new();
    env.config = env.config.clone().with_hashing(HashingConfig { sha256: true });
    env.add("evil.com", EICAR_MARKER.as_bytes());

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.suspect, 1);
    let manifest = env
        .files_in(&env.paths().hazard)
        .into_iter()
        .find(|name| name.ends_with(".json"))
        .unwrap();
    let manifest: HazardManifest =
        serde_json::from_slice(&fs::read(env.paths().hazard.join(manifest)).unwrap()).unwrap();
    let expected = FileHasher::new()
        .with_sha256(true)
        .hash_bytes(EICAR_MARKER.as_bytes());
    assert_eq!(manifest.file_hash.sha256, expected.sha256);
    assert!(manifest.file_hash.sha256.is_some());
}

#[tokio::test]
async fn test_scenario_e_second_instance_is_refused() {
    let env = Env::new();
    env.add("a.txt", b"hello");
    fs::create_dir_all(&env.paths().tracking).unwrap();
    let held = InstanceLock::acquire(env.paths().lock_file()).unwrap();

    let err = env.orchestrator().run().await.unwrap_err();

    assert!(matches!(err, GateError::LockHeld { .. }));
    assert!(env.paths().lock_file().exists());
    assert_eq!(env.files_in(&env.paths().source), vec!["a.txt"]);
    drop(held);

    let summary = env.orchestrator().run().await.unwrap();
    assert_eq!(summary.clean, 1);
    assert!(!env.paths().lock_file().exists());
}

#[tokio::test]
async fn test_resume_does_not_readmit_source() {
    let env = Env::new();
    let source = env.add("a.txt", b"hello");
    fs::create_dir_all(&env.paths().quarantine).unwrap();
    {
        let area = QuarantineArea::open(&env.paths().quarantine).unwrap();
        let file = SourceFile::new(source.clone(), 5);
        let hash = FileHasher::new().hash_file(&source).unwrap();
        area.place(&TaskId::new(), &file, &hash).unwrap();
    }

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.clean, 1);
    assert_eq!(summary.processed(), 1);
    assert_eq!(env.files_in(&env.paths().destination), vec!["a.txt"]);
    assert!(!source.exists());
    let tracker = env.tracker();
    assert_eq!(tracker.get(tracker.today()).unwrap().files_processed, 0);
}

#[tokio::test]
async fn test_resume_finishes_delivery_that_reached_destination() {
    let env = Env::new();
    let source = env.add("a.txt", b"hello");
    fs::create_dir_all(&env.paths().quarantine).unwrap();
    fs::create_dir_all(&env.paths().destination).unwrap();
    {
        let area = QuarantineArea::open(&env.paths().quarantine).unwrap();
        let file = SourceFile::new(source.clone(), 5);
        let hash = FileHasher::new().hash_file(&source).unwrap();
        area.place(&TaskId::new(), &file, &hash).unwrap();
    }
    // Interrupted after the link into the destination, before the discard.
    fs::rename(&source, env.paths().destination.join("a.txt")).unwrap();

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.clean, 1);
    assert_eq!(summary.failed_total(), 0);
    assert_eq!(env.files_in(&env.paths().destination), vec!["a.txt"]);
    let area = QuarantineArea::open(&env.paths().quarantine).unwrap();
    assert!(area.is_empty());
}

#[tokio::test]
async fn test_fatal_destination_halts_admission() {
    let mut env = Env::new();
    env.config = env.config.clone().with_workers(1);
    env.add_many(3, 10);
    let scanner = Arc::new(VanishingDestination {
        destination: env.paths().destination.clone(),
    });

    let summary = env.orchestrator().with_scanner(scanner).run().await.unwrap();

    assert!(summary.fatal.is_some());
    assert_eq!(summary.not_attempted, 2);
    assert_eq!(summary.exit_code(&env.config.policy), EXIT_FATAL);
    assert_eq!(env.notifier.count(NotifyLevel::Critical), 1);

    let area = QuarantineArea::open(&env.paths().quarantine).unwrap();
    let held = area.resumable(false);
    assert_eq!(held.len(), 1, "the file is kept and picked up next run");
    assert_eq!(held[0].state, RecordState::Pending);
}

#[tokio::test]
async fn test_scan_errors_are_retained_then_retried_by_policy() {
    let mut env = Env::new();
    env.add("a.txt", b"hello");
    let clean_engine = env.config.clone();
    env.config.engines = vec![ScannerSpec::Mock(MockEngineSpec {
        verdict: Some(ScanVerdict::ScanError),
        ..Default::default()
    })];

    let first = env.orchestrator().run().await.unwrap();
    assert_eq!(first.scan_error, 1);
    assert_eq!(first.failed[&FailureKind::ScanEngine], 1);
    assert_eq!(first.exit_code(&env.config.policy), EXIT_FAILURES);
    assert!(env.files_in(&env.paths().destination).is_empty());

    env.config = clean_engine;
    let retained = env.orchestrator().run().await.unwrap();
    assert_eq!(retained.resumed, 0);
    assert_eq!(retained.processed(), 0);

    env.config = env.config.clone().with_policy(PolicyConfig {
        scan_error: ScanErrorPolicy::RetryNextRun,
        ..Default::default()
    });
    let retried = env.orchestrator().run().await.unwrap();
    assert_eq!(retried.resumed, 1);
    assert_eq!(retried.clean, 1);
    assert_eq!(env.files_in(&env.paths().destination), vec!["a.txt"]);
}

#[tokio::test]
async fn test_stop_before_admission() {
    let env = Env::new();
    env.add_many(4, 10);
    let orchestrator = env.orchestrator();
    orchestrator.stop_handle().stop();

    let summary = orchestrator.run().await.unwrap();

    assert!(summary.stopped);
    assert_eq!(summary.not_attempted, 4);
    assert_eq!(summary.processed(), 0);
    assert_eq!(env.files_in(&env.paths().source).len(), 4);
}

/// Scans instantly, but never answers a health or version check.
#[derive(Debug)]
struct MuteEngine;

#[async_trait]
impl Scanner for MuteEngine {
    fn name(&self) -> &str {
        "mute"
    }

    async fn scan(&self, _path: &Path) -> Result<ScanReport, ScanError> {
        Ok(ScanReport::single(EngineFinding::new(
            self.name(),
            ScanVerdict::Clean,
            Duration::ZERO,
        )))
    }

    async fn health_check(&self) -> Result<(), ScanError> {
        std::future::pending().await
    }

    async fn signature_version(&self) -> Option<String> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_hung_engine_checks_time_out() {
    let mut env = Env::new();
    env.config = env.config.clone().with_scan_timeout(Duration::from_secs(1));
    env.add("a.txt", b"hello");
    let ledger = Arc::new(JsonVersionLedger::from_versions(["1.0"]));

    let run = env
        .orchestrator()
        .with_scanner(Arc::new(MuteEngine))
        .with_version_ledger(ledger)
        .run();
    let summary = tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("startup must not hang on engine checks")
        .unwrap();

    assert_eq!(summary.clean, 1);
    assert!(!env.paths().lock_file().exists());
}

#[tokio::test]
async fn test_untested_engine_version() {
    let mut env = Env::new();
    env.config.engines = vec![ScannerSpec::Mock(MockEngineSpec {
        version: Some("1.0".into()),
        ..Default::default()
    })];
    env.add("a.txt", b"hello");
    let ledger = Arc::new(JsonVersionLedger::from_versions(["2.0"]));

    let summary = env
        .orchestrator()
        .with_version_ledger(ledger.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.clean, 1);
    assert_eq!(env.notifier.count(NotifyLevel::Warning), 1);

    env.config.policy.untested_version = UntestedVersionPolicy::Abort;
    env.add("b.txt", b"hello again");
    let err = env
        .orchestrator()
        .with_version_ledger(ledger)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::UntestedVersion { .. }));
    assert!(!env.paths().lock_file().exists());
    assert_eq!(env.files_in(&env.paths().source), vec!["b.txt"]);
}

#[tokio::test]
async fn test_missing_source_directory_fails_startup() {
    let env = Env::new();
    fs::remove_dir_all(&env.paths().source).unwrap();

    let err = env.orchestrator().run().await.unwrap_err();
    assert!(matches!(err, GateError::PathValidation { .. }));
    assert!(!env.paths().lock_file().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_workers_respect_quota() {
    let mut env = Env::new();
    env.config = env
        .config
        .clone()
        .with_workers(4)
        .with_throttle(ThrottleConfig {
            max_files_per_day: 5,
            ..Default::default()
        });
    env.add_many(12, 64);

    let summary = env.orchestrator().run().await.unwrap();

    assert_eq!(summary.clean, 5);
    assert_eq!(summary.not_attempted, 7);
    assert_eq!(env.files_in(&env.paths().destination).len(), 5);
}
