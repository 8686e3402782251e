//! The `Scanner` trait every engine adapter implements.

use crate::core::error::ScanError;
use crate::core::result::{EngineFinding, ScanReport};

use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The core trait for malware scanning engines.
///
/// Single-engine adapters and composites both implement it, so the worker
/// never needs to know how many engines stand behind a verdict.
///
/// # Implementation Notes
///
/// - Implementations must be `Send + Sync`; one adapter is shared by every worker.
/// - Timeouts are enforced by the caller through [`scan_within`], not by the engine.
/// - Never panic. Return `ScanError` and let [`scan_within`] turn it into `SCAN_ERROR`.
///
/// # Example Implementation
///
/// ```rust,ignore
/// use quarantine_gate::core::{EngineFinding, ScanError, ScanReport, ScanVerdict, Scanner};
/// use async_trait::async_trait;
/// use std::path::Path;
///
/// #[derive(Debug)]
/// struct AlwaysClean;
///
/// #[async_trait]
/// impl Scanner for AlwaysClean {
///     fn name(&self) -> &str {
///         "always-clean"
///     }
///
///     async fn scan(&self, _path: &Path) -> Result<ScanReport, ScanError> {
///         Ok(ScanReport::single(EngineFinding::new(
///             self.name(),
///             ScanVerdict::Clean,
///             Default::default(),
///         )))
///     }
/// }
/// ```
#[async_trait]
pub trait Scanner: Send + Sync + Debug {
    /// Stable, human-readable identifier like "clamscan" or "defender".
    fn name(&self) -> &str;

    /// Scans the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `ScanError` when the engine could not be run or its answer
    /// could not be read. An engine that ran and reported an error exit code
    /// should return `Ok` with a `SCAN_ERROR` finding instead.
    async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError>;

    /// Lightweight check that the engine is reachable.
    async fn health_check(&self) -> Result<(), ScanError> {
        Ok(())
    }

    /// Returns the engine's version or signature version, if it can report one.
    ///
    /// Composites report nothing here; ask their members instead.
    async fn signature_version(&self) -> Option<String> {
        None
    }

    /// Member engines, for adapters that wrap several. Leaves return nothing.
    fn members(&self) -> Vec<ArcScanner> {
        Vec::new()
    }

    /// Returns `true` if the adapter applies per-engine timeouts itself.
    fn enforces_own_timeout(&self) -> bool {
        false
    }
}

/// A boxed scanner for type-erased storage.
pub type BoxedScanner = Box<dyn Scanner>;

/// An arc-wrapped scanner for shared ownership.
pub type ArcScanner = Arc<dyn Scanner>;

/// Runs `scanner` on `path` under `timeout` and always produces a report.
///
/// This is the boundary of the three-value contract: spawn failures, I/O
/// errors and timeouts all become a `SCAN_ERROR` finding for the engine
/// that caused them, and nothing else.
pub async fn scan_within(scanner: &dyn Scanner, path: &Path, timeout: Duration) -> ScanReport {
    let started = Instant::now();
    let result = if scanner.enforces_own_timeout() {
        scanner.scan(path).await
    } else {
        match tokio::time::timeout(timeout, scanner.scan(path)).await {
            Ok(result) => result,
            Err(_) => Err(ScanError::timeout(scanner.name(), timeout)),
        }
    };

    match result {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(
                engine = scanner.name(),
                path = %path.display(),
                error = %e,
                "Engine produced no verdict"
            );
            ScanReport::single(EngineFinding::error(
                scanner.name(),
                e.to_string(),
                started.elapsed(),
            ))
        }
    }
}

/// Walks an adapter tree and returns its leaf engines.
pub fn leaf_engines(scanner: &ArcScanner) -> Vec<ArcScanner> {
    let members = scanner.members();
    if members.is_empty() {
        return vec![Arc::clone(scanner)];
    }
    members.iter().flat_map(leaf_engines).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ScanVerdict;

    #[derive(Debug)]
    struct Sleepy;

    #[async_trait]
    impl Scanner for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn scan(&self, _path: &Path) -> Result<ScanReport, ScanError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ScanReport::single(EngineFinding::new(
                "sleepy",
                ScanVerdict::Clean,
                Duration::ZERO,
            )))
        }
    }

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl Scanner for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn scan(&self, _path: &Path) -> Result<ScanReport, ScanError> {
            Err(ScanError::engine_unavailable("broken", "no daemon"))
        }
    }

    #[tokio::test]
    async fn test_timeout_becomes_scan_error() {
        let report = scan_within(&Sleepy, Path::new("/x"), Duration::from_millis(20)).await;
        assert_eq!(report.verdict, ScanVerdict::ScanError);
        assert!(report.findings[0]
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_engine_error_becomes_scan_error() {
        let report = scan_within(&Broken, Path::new("/x"), Duration::from_secs(1)).await;
        assert_eq!(report.verdict, ScanVerdict::ScanError);
        assert_eq!(report.findings[0].engine, "broken");
    }

    #[test]
    fn test_leaf_engines_of_leaf() {
        let scanner: ArcScanner = Arc::new(Broken);
        assert_eq!(leaf_engines(&scanner).len(), 1);
    }
}
