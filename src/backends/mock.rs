//! Mock scanner for testing.
//!
//! The mock engine reads the file and flags it when its content contains a
//! detection marker (the EICAR test string by default). It can also be
//! pinned to a fixed verdict, keyed by file hash, slowed down, or made to
//! fail, which covers every engine behavior the pipeline has to survive.

use crate::core::{EngineFinding, FileHasher, ScanError, ScanReport, ScanVerdict, Scanner};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// The standard antivirus test string.
pub const EICAR_MARKER: &str =
    "X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

/// A mock scanner for testing purposes.
///
/// # Examples
///
/// ```rust
/// use quarantine_gate::backends::MockScanner;
/// use quarantine_gate::core::ScanVerdict;
/// use std::time::Duration;
///
/// // Flags anything containing the EICAR string
/// let scanner = MockScanner::new();
///
/// // Flags anything containing a custom marker, slowly
/// let scanner = MockScanner::new()
///     .with_marker("MALWARE")
///     .with_latency(Duration::from_millis(10));
///
/// // Always answers SCAN_ERROR
/// let scanner = MockScanner::new().with_fixed_verdict(ScanVerdict::ScanError);
/// ```
#[derive(Debug)]
pub struct MockScanner {
    name: String,
    marker: Vec<u8>,
    /// Verdicts keyed by file hash (BLAKE3), checked before the marker.
    responses: RwLock<HashMap<String, ScanVerdict>>,
    fixed_verdict: Option<ScanVerdict>,
    latency: Option<Duration>,
    version: Option<String>,
    scan_count: AtomicU64,
    failing: AtomicBool,
}

impl MockScanner {
    /// Creates a mock scanner that detects the EICAR marker.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            marker: EICAR_MARKER.as_bytes().to_vec(),
            responses: RwLock::new(HashMap::new()),
            fixed_verdict: None,
            latency: None,
            version: None,
            scan_count: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Creates a mock scanner that reports every file clean.
    pub fn new_clean() -> Self {
        Self::new().with_fixed_verdict(ScanVerdict::Clean)
    }

    /// Creates a mock scanner that reports every file suspect.
    pub fn new_suspect() -> Self {
        Self::new().with_fixed_verdict(ScanVerdict::Suspect)
    }

    /// Sets the name of this scanner.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the content marker that triggers a `SUSPECT` verdict.
    pub fn with_marker(mut self, marker: impl AsRef<[u8]>) -> Self {
        self.marker = marker.as_ref().to_vec();
        self
    }

    /// Answers `verdict` for every file, ignoring content.
    pub fn with_fixed_verdict(mut self, verdict: ScanVerdict) -> Self {
        self.fixed_verdict = Some(verdict);
        self
    }

    /// Adds a verdict for a specific file hash.
    pub fn with_response(self, hash: impl Into<String>, verdict: ScanVerdict) -> Self {
        self.responses.write().insert(hash.into(), verdict);
        self
    }

    /// Sets the simulated latency for scans.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Sets the version reported by `signature_version`.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Makes every scan fail with `EngineUnavailable` (or stop failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of scans performed.
    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::Relaxed)
    }

    fn contains_marker(&self, data: &[u8]) -> bool {
        !self.marker.is_empty() && data.windows(self.marker.len()).any(|w| w == self.marker)
    }
}

impl Default for MockScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for MockScanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError> {
        let started = Instant::now();
        self.scan_count.fetch_add(1, Ordering::Relaxed);

        if self.failing.load(Ordering::SeqCst) {
            return Err(ScanError::engine_unavailable(&self.name, "simulated failure"));
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let data = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScanError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ScanError::Io(e)
            }
        })?;

        let keyed = {
            let responses = self.responses.read();
            if responses.is_empty() {
                None
            } else {
                let hash = FileHasher::new().hash_bytes(&data);
                responses.get(&hash.blake3).copied()
            }
        };

        let (verdict, detail) = match (keyed, self.fixed_verdict) {
            (Some(verdict), _) => (verdict, "matched hash response"),
            (None, Some(verdict)) => (verdict, "fixed verdict"),
            (None, None) if self.contains_marker(&data) => (ScanVerdict::Suspect, "marker found"),
            (None, None) => (ScanVerdict::Clean, ""),
        };

        Ok(ScanReport::single(
            EngineFinding::new(self.name.clone(), verdict, started.elapsed()).with_detail(detail),
        ))
    }

    async fn health_check(&self) -> Result<(), ScanError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ScanError::engine_unavailable(
                &self.name,
                "mock scanner is unhealthy",
            ));
        }
        Ok(())
    }

    async fn signature_version(&self) -> Option<String> {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_mock_scanner_clean() {
        let scanner = MockScanner::new();
        let file = temp_file(b"quarterly numbers");

        let report = scanner.scan(file.path()).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(scanner.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_scanner_detects_eicar() {
        let scanner = MockScanner::new();
        let file = temp_file(format!("prefix {EICAR_MARKER} suffix").as_bytes());

        let report = scanner.scan(file.path()).await.unwrap();
        assert!(report.is_suspect());
        assert_eq!(report.detecting_engines(), vec!["mock"]);
    }

    #[tokio::test]
    async fn test_mock_scanner_hash_response_wins() {
        let file = temp_file(b"known bad");
        let hash = FileHasher::new().hash_file(file.path()).unwrap();
        let scanner = MockScanner::new_clean().with_response(hash.blake3, ScanVerdict::Suspect);

        let report = scanner.scan(file.path()).await.unwrap();
        assert!(report.is_suspect());
    }

    #[tokio::test]
    async fn test_mock_scanner_failure_and_health() {
        let scanner = MockScanner::new();
        assert!(scanner.health_check().await.is_ok());

        scanner.set_failing(true);
        assert!(scanner.health_check().await.is_err());
        let file = temp_file(b"x");
        assert!(scanner.scan(file.path()).await.is_err());

        scanner.set_failing(false);
        assert!(scanner.scan(file.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_scanner_missing_file() {
        let err = MockScanner::new()
            .scan(Path::new("/no/such/file"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::FileNotFound { .. }));
    }
}
