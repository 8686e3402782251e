//! Multi-engine composite scanner.

use crate::core::{scan_within, ArcScanner, ScanError, ScanReport, Scanner};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a composite runs its member engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// One engine at a time, in configuration order.
    Sequential,
    /// All engines at once.
    #[default]
    Concurrent,
}

/// Runs several engines over the same file and combines their verdicts
/// worst-of.
///
/// Each member runs under its own timeout, so one hung engine turns into a
/// `SCAN_ERROR` finding without hiding what the others said. A `SUSPECT`
/// from any member therefore always wins.
#[derive(Debug)]
pub struct CompositeScanner {
    name: String,
    engines: Vec<ArcScanner>,
    timeout: Duration,
    mode: EngineMode,
}

impl CompositeScanner {
    /// Creates a composite over `engines`, each bounded by `timeout`.
    pub fn new(engines: Vec<ArcScanner>, timeout: Duration) -> Result<Self, ScanError> {
        if engines.is_empty() {
            return Err(ScanError::configuration(
                "a composite scanner needs at least one engine",
            ));
        }
        Ok(Self {
            name: "composite".to_string(),
            engines,
            timeout,
            mode: EngineMode::default(),
        })
    }

    /// Sets the execution mode.
    pub fn with_mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the composite's name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the execution mode.
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Number of direct member engines.
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    async fn scan_sequential(&self, path: &Path) -> Vec<ScanReport> {
        let mut reports = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            reports.push(scan_within(engine.as_ref(), path, self.timeout).await);
        }
        reports
    }

    async fn scan_concurrent(&self, path: &Path) -> Vec<ScanReport> {
        let futures = self
            .engines
            .iter()
            .map(|engine| scan_within(engine.as_ref(), path, self.timeout));
        join_all(futures).await
    }
}

#[async_trait]
impl Scanner for CompositeScanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError> {
        let started = Instant::now();
        let reports = match self.mode {
            EngineMode::Sequential => self.scan_sequential(path).await,
            EngineMode::Concurrent => self.scan_concurrent(path).await,
        };
        let report = ScanReport::merge(reports, started.elapsed());

        tracing::debug!(
            composite = %self.name,
            path = %path.display(),
            verdict = %report.verdict,
            engine_count = report.engine_count(),
            "Composite scan finished"
        );

        Ok(report)
    }

    async fn health_check(&self) -> Result<(), ScanError> {
        let checks = join_all(self.engines.iter().map(|e| e.health_check())).await;
        let failing: Vec<String> = self
            .engines
            .iter()
            .zip(checks)
            .filter(|(_, result)| result.is_err())
            .map(|(engine, _)| engine.name().to_string())
            .collect();

        if failing.len() == self.engines.len() {
            Err(ScanError::engine_unavailable(
                &self.name,
                format!("no member engine is healthy ({})", failing.join(", ")),
            ))
        } else {
            Ok(())
        }
    }

    fn members(&self) -> Vec<ArcScanner> {
        self.engines.iter().map(Arc::clone).collect()
    }

    fn enforces_own_timeout(&self) -> bool {
        true
    }
}
