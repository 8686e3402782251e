//! Placement of scanned files.

use crate::core::error::{RouteError, RouteResult};
use crate::core::{fsio, FileHash, FileHasher, ScanReport, ScanVerdict};
use crate::quarantine::QuarantineArea;
use crate::routing::hazard::{hazard_file_name, HazardKey, HazardManifest};
use crate::worker::FileTask;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What to do when a clean file's name is already taken in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Leave the existing file alone and fail the task.
    #[default]
    Reject,
    /// Replace the existing file.
    Overwrite,
}

/// Where the router put a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Clean file delivered and verified.
    Destination {
        /// Final path.
        path: PathBuf,
    },
    /// Suspect file archived.
    Hazard {
        /// Artifact path.
        artifact: PathBuf,
        /// Sidecar manifest path.
        manifest: PathBuf,
    },
    /// No verdict; the file stays in quarantine.
    Retained,
}

/// Routes scanned files out of quarantine.
///
/// The quarantine copy is removed only after the file is verifiably in its
/// final place, so an error at any step leaves it where it was.
#[derive(Debug)]
pub struct ResultRouter {
    destination: PathBuf,
    hazard: PathBuf,
    collision: CollisionPolicy,
    key: Option<Arc<HazardKey>>,
    quarantine: Arc<QuarantineArea>,
    hasher: FileHasher,
}

impl ResultRouter {
    /// Creates a router between `quarantine` and the two target directories.
    pub fn new(
        quarantine: Arc<QuarantineArea>,
        destination: impl Into<PathBuf>,
        hazard: impl Into<PathBuf>,
    ) -> Self {
        Self {
            destination: destination.into(),
            hazard: hazard.into(),
            collision: CollisionPolicy::default(),
            key: None,
            quarantine,
            hasher: FileHasher::new(),
        }
    }

    /// Sets the collision policy.
    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision = policy;
        self
    }

    /// Uses `hasher` to verify delivered and archived copies.
    pub fn with_hasher(mut self, hasher: FileHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Seals hazard artifacts with `key`.
    pub fn with_hazard_key(mut self, key: Arc<HazardKey>) -> Self {
        self.key = Some(key);
        self
    }

    /// Routes `task` according to `report`.
    pub fn route(&self, task: &FileTask, report: &ScanReport) -> RouteResult<RouteOutcome> {
        let (payload, hash) = match (&task.quarantine_path, &task.hash) {
            (Some(path), Some(hash)) if path.is_file() => (path.as_path(), hash),
            _ => {
                return Err(RouteError::NotQuarantined {
                    task_id: task.id.to_string(),
                })
            }
        };

        match report.verdict {
            ScanVerdict::Clean => self.deliver(task, payload, hash),
            ScanVerdict::Suspect => self.archive(task, payload, hash, report),
            ScanVerdict::ScanError => Ok(RouteOutcome::Retained),
        }
    }

    fn deliver(&self, task: &FileTask, payload: &Path, hash: &FileHash) -> RouteResult<RouteOutcome> {
        let name = task.source.file_name();
        let target = self.destination.join(&name);
        if self.collision == CollisionPolicy::Reject && target.exists() {
            return self.already_delivered(task, &target, hash);
        }

        let staged = self.destination.join(format!(".{name}.{}.partial", task.id));
        fsio::copy_durable(payload, &staged).map_err(|e| {
            let _ = fs::remove_file(&staged);
            unavailable_or_io(&self.destination, e)
        })?;

        // Verified before it can replace anything; link and rename keep the inode.
        if let Err(e) = self.verify(&staged, hash) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        let placed = match self.collision {
            CollisionPolicy::Reject => fs::hard_link(&staged, &target).map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    RouteError::Collision {
                        path: target.clone(),
                    }
                } else {
                    RouteError::Io(e)
                }
            }),
            CollisionPolicy::Overwrite => fs::rename(&staged, &target).map_err(RouteError::Io),
        };
        let _ = fs::remove_file(&staged);
        match placed {
            Ok(()) => {}
            Err(RouteError::Collision { .. }) => return self.already_delivered(task, &target, hash),
            Err(e) => return Err(e),
        }
        // The new name must outlive a crash before the quarantine copy goes.
        fsio::sync_dir(&self.destination)?;

        self.quarantine.discard(&task.id)?;
        Ok(RouteOutcome::Destination { path: target })
    }

    /// A taken name is only a collision if it holds different content. The
    /// same content means an earlier delivery of this file got as far as the
    /// destination but not as far as discarding the quarantine copy.
    fn already_delivered(
        &self,
        task: &FileTask,
        target: &Path,
        hash: &FileHash,
    ) -> RouteResult<RouteOutcome> {
        let same = self
            .hasher
            .hash_file(target)
            .is_ok_and(|existing| existing.same_content(hash));
        if !same {
            return Err(RouteError::Collision {
                path: target.to_path_buf(),
            });
        }

        tracing::info!(
            task_id = %task.id,
            path = %target.display(),
            "Destination already holds this file"
        );
        self.quarantine.discard(&task.id)?;
        Ok(RouteOutcome::Destination {
            path: target.to_path_buf(),
        })
    }

    fn verify(&self, path: &Path, hash: &FileHash) -> RouteResult<()> {
        let actual = self.hasher.hash_file(path)?;
        if actual.same_content(hash) {
            return Ok(());
        }
        Err(RouteError::Integrity {
            expected: hash.blake3.clone(),
            actual: actual.blake3,
        })
    }

    fn archive(
        &self,
        task: &FileTask,
        payload: &Path,
        hash: &FileHash,
        report: &ScanReport,
    ) -> RouteResult<RouteOutcome> {
        let archived_at = Utc::now();
        let original_name = task.source.file_name();
        let name = hazard_file_name(archived_at, hash, &original_name, self.key.is_some());
        let artifact = self.hazard.join(&name);

        let plaintext = fs::read(payload)?;
        let actual = self.hasher.hash_bytes(&plaintext);
        if !actual.same_content(hash) {
            return Err(RouteError::Integrity {
                expected: hash.blake3.clone(),
                actual: actual.blake3,
            });
        }

        let bytes = match &self.key {
            Some(key) => key.seal(&plaintext)?,
            None => plaintext,
        };
        fsio::write_atomic(&artifact, &bytes).map_err(|e| unavailable_or_io(&self.hazard, e))?;

        let manifest = HazardManifest {
            task_id: task.id.clone(),
            source_path: task.source.path.clone(),
            original_name,
            size: task.source.size,
            file_hash: hash.clone(),
            verdict: report.verdict,
            findings: report.findings.clone(),
            artifact: name,
            encrypted: self.key.is_some(),
            archived_at,
        };
        let manifest_path = HazardManifest::path_for(&artifact);
        fsio::write_json_atomic(&manifest_path, &manifest)
            .map_err(|e| unavailable_or_io(&self.hazard, e))?;

        self.quarantine.discard(&task.id)?;
        Ok(RouteOutcome::Hazard {
            artifact,
            manifest: manifest_path,
        })
    }
}

/// A target directory that is gone or refuses writes is a run-wide problem.
fn unavailable_or_io(dir: &Path, e: io::Error) -> RouteError {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => RouteError::DestinationUnavailable {
            path: dir.to_path_buf(),
            source: e,
        },
        _ => RouteError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineFinding, SourceFile};
    use crate::routing::hazard::open_hazard_artifact;
    use crate::worker::TaskState;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        quarantine: Arc<QuarantineArea>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            for sub in ["in", "out", "hazard"] {
                fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            let quarantine = Arc::new(QuarantineArea::open(dir.path().join("q")).unwrap());
            Self { dir, quarantine }
        }

        fn out(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn hazard(&self) -> PathBuf {
            self.dir.path().join("hazard")
        }

        fn router(&self) -> ResultRouter {
            ResultRouter::new(Arc::clone(&self.quarantine), self.out(), self.hazard())
        }

        /// Runs a task up to SCANNED with `content`.
        fn scanned_task(&self, name: &str, content: &[u8]) -> FileTask {
            let path = self.dir.path().join("in").join(name);
            fs::write(&path, content).unwrap();
            let mut task = FileTask::new(SourceFile::new(&path, content.len() as u64));
            let hash = FileHasher::new().hash_file(&path).unwrap();
            task.advance(TaskState::Hashed);
            self.quarantine.place(&task.id, &task.source, &hash).unwrap();
            task.quarantine_path = Some(self.quarantine.payload_path(&task.id));
            task.hash = Some(hash);
            task.advance(TaskState::Quarantined);
            task.advance(TaskState::Scanned);
            task
        }
    }

    fn report(verdict: ScanVerdict) -> ScanReport {
        ScanReport::single(EngineFinding::new("mock", verdict, Duration::ZERO))
    }

    #[test]
    fn test_clean_file_delivered_and_discarded() {
        let fx = Fixture::new();
        let task = fx.scanned_task("a.txt", b"clean");

        let outcome = fx.router().route(&task, &report(ScanVerdict::Clean)).unwrap();

        let expected = fx.out().join("a.txt");
        assert_eq!(outcome, RouteOutcome::Destination { path: expected.clone() });
        assert_eq!(fs::read(&expected).unwrap(), b"clean");
        assert!(fx.quarantine.record(&task.id).is_none());
        assert_eq!(fs::read_dir(fx.out()).unwrap().count(), 1, "no staged leftovers");
    }

    #[test]
    fn test_reject_collision_keeps_quarantine_copy() {
        let fx = Fixture::new();
        fs::write(fx.out().join("a.txt"), b"already here").unwrap();
        let task = fx.scanned_task("a.txt", b"clean");

        let err = fx.router().route(&task, &report(ScanVerdict::Clean)).unwrap_err();

        assert!(matches!(err, RouteError::Collision { .. }));
        assert_eq!(fs::read(fx.out().join("a.txt")).unwrap(), b"already here");
        assert!(fx.quarantine.record(&task.id).is_some());
    }

    #[test]
    fn test_identical_target_counts_as_delivered() {
        let fx = Fixture::new();
        fs::write(fx.out().join("a.txt"), b"clean").unwrap();
        let task = fx.scanned_task("a.txt", b"clean");

        let outcome = fx.router().route(&task, &report(ScanVerdict::Clean)).unwrap();

        let expected = fx.out().join("a.txt");
        assert_eq!(outcome, RouteOutcome::Destination { path: expected.clone() });
        assert_eq!(fs::read(&expected).unwrap(), b"clean");
        assert!(fx.quarantine.record(&task.id).is_none());
        assert_eq!(fs::read_dir(fx.out()).unwrap().count(), 1);
    }

    #[test]
    fn test_overwrite_replaces_existing() {
        let fx = Fixture::new();
        fs::write(fx.out().join("a.txt"), b"old").unwrap();
        let task = fx.scanned_task("a.txt", b"new");

        fx.router()
            .with_collision_policy(CollisionPolicy::Overwrite)
            .route(&task, &report(ScanVerdict::Clean))
            .unwrap();

        assert_eq!(fs::read(fx.out().join("a.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_tampered_payload_fails_integrity() {
        let fx = Fixture::new();
        let task = fx.scanned_task("a.txt", b"clean");
        fs::write(task.quarantine_path.as_ref().unwrap(), b"tampered").unwrap();

        let err = fx.router().route(&task, &report(ScanVerdict::Clean)).unwrap_err();

        assert!(matches!(err, RouteError::Integrity { .. }));
        assert!(!fx.out().join("a.txt").exists());
        assert!(fx.quarantine.record(&task.id).is_some());
    }

    #[test]
    fn test_tampered_payload_never_replaces_existing() {
        let fx = Fixture::new();
        fs::write(fx.out().join("a.txt"), b"operator copy").unwrap();
        let task = fx.scanned_task("a.txt", b"clean");
        fs::write(task.quarantine_path.as_ref().unwrap(), b"tampered").unwrap();

        let err = fx
            .router()
            .with_collision_policy(CollisionPolicy::Overwrite)
            .route(&task, &report(ScanVerdict::Clean))
            .unwrap_err();

        assert!(matches!(err, RouteError::Integrity { .. }));
        assert_eq!(fs::read(fx.out().join("a.txt")).unwrap(), b"operator copy");
        assert_eq!(fs::read_dir(fx.out()).unwrap().count(), 1, "staged copy removed");
        assert!(fx.quarantine.record(&task.id).is_some());
    }

    #[test]
    fn test_suspect_file_archived_sealed() {
        let fx = Fixture::new();
        let key = Arc::new(HazardKey::generate());
        let task = fx.scanned_task("evil.exe", b"bad bytes");

        let outcome = fx
            .router()
            .with_hazard_key(Arc::clone(&key))
            .route(&task, &report(ScanVerdict::Suspect))
            .unwrap();

        let RouteOutcome::Hazard { artifact, manifest } = outcome else {
            panic!("expected hazard outcome");
        };
        assert!(artifact.to_string_lossy().ends_with("_evil.exe.enc"));
        assert_ne!(fs::read(&artifact).unwrap(), b"bad bytes");
        assert_eq!(open_hazard_artifact(&artifact, Some(&key)).unwrap(), b"bad bytes");

        let sidecar: HazardManifest =
            serde_json::from_slice(&fs::read(&manifest).unwrap()).unwrap();
        assert!(sidecar.encrypted);
        assert_eq!(sidecar.verdict, ScanVerdict::Suspect);
        assert_eq!(sidecar.original_name, "evil.exe");

        assert!(fx.quarantine.record(&task.id).is_none());
        assert_eq!(fs::read_dir(fx.out()).unwrap().count(), 0);
    }

    #[test]
    fn test_scan_error_is_retained() {
        let fx = Fixture::new();
        let task = fx.scanned_task("a.txt", b"unknown");

        let outcome = fx.router().route(&task, &report(ScanVerdict::ScanError)).unwrap();

        assert_eq!(outcome, RouteOutcome::Retained);
        assert!(fx.quarantine.record(&task.id).is_some());
        assert_eq!(fs::read_dir(fx.out()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(fx.hazard()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_destination_is_fatal() {
        let fx = Fixture::new();
        let task = fx.scanned_task("a.txt", b"clean");
        fs::remove_dir_all(fx.out()).unwrap();

        let err = fx.router().route(&task, &report(ScanVerdict::Clean)).unwrap_err();

        assert!(err.is_fatal());
        assert!(fx.quarantine.record(&task.id).is_some());
    }

    #[test]
    fn test_unplaced_task_is_rejected() {
        let fx = Fixture::new();
        let task = FileTask::new(SourceFile::new("/in/a.txt", 1));
        let err = fx.router().route(&task, &report(ScanVerdict::Clean)).unwrap_err();
        assert!(matches!(err, RouteError::NotQuarantined { .. }));
    }
}
