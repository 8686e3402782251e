//! Run configuration.
//!
//! A [`GateConfig`] is usually loaded from TOML:
//!
//! ```toml
//! workers = 4
//! scan_timeout_secs = 300
//! engine_mode = "concurrent"
//!
//! [paths]
//! source = "/srv/incoming"
//! quarantine = "/srv/quarantine"
//! destination = "/srv/clean"
//! hazard = "/srv/hazard"
//! tracking = "/var/lib/quarantine-gate"
//!
//! [throttle]
//! min_free_space = "10GB"
//! max_files_per_day = 500
//! max_volume_per_day = "50GB"
//!
//! [[engines]]
//! kind = "command"
//! name = "clamav"
//! program = "/usr/bin/clamscan"
//! preset = "clamscan"
//!
//! [routing]
//! collision = "reject"
//! hazard_key_file = "/etc/quarantine-gate/hazard.key"
//!
//! [policy]
//! scan_error = "retain"
//! untested_version = "warn"
//! exit_on = ["copy_integrity", "route_integrity", "io"]
//! ```

use crate::backends::{
    CommandScanner, CommandScannerConfig, CompositeScanner, EngineMode, EnginePreset,
    ExitCodeTable, MockScanner,
};
use crate::core::error::{GateError, GateResult};
use crate::core::{ArcScanner, FailureKind, FileHasher, ScanVerdict};
use crate::routing::{CollisionPolicy, HazardKey};
use crate::throttle::ThrottleLimits;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

fn default_workers() -> usize {
    4
}

fn default_scan_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// A byte count that accepts either an integer or a string like `"100MB"`.
///
/// `KB`, `MB`, `GB` and `TB` are powers of 1000; `KiB`, `MiB`, `GiB` and
/// `TiB` are powers of 1024.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawByteSize", into = "u64")]
pub struct ByteSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawByteSize {
    Count(u64),
    Text(String),
}

impl TryFrom<RawByteSize> for ByteSize {
    type Error = String;

    fn try_from(raw: RawByteSize) -> Result<Self, Self::Error> {
        match raw {
            RawByteSize::Count(n) => Ok(Self(n)),
            RawByteSize::Text(s) => s.parse(),
        }
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid size '{s}': expected a number"))?;
        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "kb" | "k" => 1_000,
            "mb" | "m" => 1_000_000,
            "gb" | "g" => 1_000_000_000,
            "tb" | "t" => 1_000_000_000_000,
            "kib" => 1 << 10,
            "mib" => 1 << 20,
            "gib" => 1 << 30,
            "tib" => 1 << 40,
            other => return Err(format!("invalid size '{s}': unknown unit '{other}'")),
        };
        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| format!("invalid size '{s}': too large"))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Directory layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Untrusted input directory. Only read.
    pub source: PathBuf,
    /// Quarantine area.
    pub quarantine: PathBuf,
    /// Where clean files are delivered.
    pub destination: PathBuf,
    /// Where suspect files are archived.
    pub hazard: PathBuf,
    /// Lock file, usage ledger and other run state.
    pub tracking: PathBuf,
    /// Instance lock; defaults to `<tracking>/quarantine-gate.lock`.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
    /// Daily usage ledger; defaults to `<tracking>/daily-usage.json`.
    #[serde(default)]
    pub usage_ledger: Option<PathBuf>,
    /// JSON list of tested engine versions.
    #[serde(default)]
    pub version_ledger: Option<PathBuf>,
}

impl PathsConfig {
    /// Lays out every directory under `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            source: root.join("source"),
            quarantine: root.join("quarantine"),
            destination: root.join("destination"),
            hazard: root.join("hazard"),
            tracking: root.join("tracking"),
            lock_file: None,
            usage_ledger: None,
            version_ledger: None,
        }
    }

    /// Resolved lock file path.
    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.tracking.join("quarantine-gate.lock"))
    }

    /// Resolved usage ledger path.
    pub fn usage_ledger(&self) -> PathBuf {
        self.usage_ledger
            .clone()
            .unwrap_or_else(|| self.tracking.join("daily-usage.json"))
    }

    /// Directories the run writes to.
    pub fn writable_dirs(&self) -> [&Path; 4] {
        [
            self.quarantine.as_path(),
            self.destination.as_path(),
            self.hazard.as_path(),
            self.tracking.as_path(),
        ]
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under("quarantine-gate")
    }
}

/// Throttle thresholds. Zero disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Bytes that must stay free in the quarantine filesystem.
    #[serde(default)]
    pub min_free_space: ByteSize,
    /// Files admitted per day.
    #[serde(default)]
    pub max_files_per_day: u64,
    /// Bytes admitted per day.
    #[serde(default)]
    pub max_volume_per_day: ByteSize,
}

impl ThrottleConfig {
    /// Converts to gate limits.
    pub fn limits(&self) -> ThrottleLimits {
        ThrottleLimits::unlimited()
            .with_min_free_space(self.min_free_space.0)
            .with_max_files_per_day(self.max_files_per_day)
            .with_max_volume_per_day(self.max_volume_per_day.0)
    }
}

/// Custom exit codes for a command engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeSpec {
    /// Codes meaning clean.
    pub clean: Vec<i32>,
    /// Codes meaning suspect.
    pub suspect: Vec<i32>,
}

/// A command-line engine definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEngineSpec {
    /// Engine name.
    pub name: String,
    /// Program to run.
    pub program: PathBuf,
    /// Preset supplying default arguments and exit codes.
    #[serde(default = "default_preset")]
    pub preset: EnginePreset,
    /// Overrides the preset arguments.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Overrides the preset exit codes.
    #[serde(default)]
    pub exit_codes: Option<ExitCodeSpec>,
    /// Output text that forces a suspect verdict.
    #[serde(default)]
    pub detection_pattern: Option<String>,
    /// Overrides the preset version arguments.
    #[serde(default)]
    pub version_args: Option<Vec<String>>,
}

fn default_preset() -> EnginePreset {
    EnginePreset::Custom
}

/// An in-process test engine definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockEngineSpec {
    /// Engine name.
    #[serde(default)]
    pub name: Option<String>,
    /// Content marker; the EICAR string when unset.
    #[serde(default)]
    pub marker: Option<String>,
    /// Answers this verdict for every file.
    #[serde(default)]
    pub verdict: Option<ScanVerdict>,
    /// Reported signature version.
    #[serde(default)]
    pub version: Option<String>,
}

/// One configured engine. New engine kinds are new variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScannerSpec {
    /// External command.
    Command(CommandEngineSpec),
    /// In-process mock.
    Mock(MockEngineSpec),
}

impl ScannerSpec {
    /// A mock engine with default settings.
    pub fn mock() -> Self {
        Self::Mock(MockEngineSpec::default())
    }

    /// Engine name as it will appear in findings.
    pub fn name(&self) -> &str {
        match self {
            Self::Command(spec) => &spec.name,
            Self::Mock(spec) => spec.name.as_deref().unwrap_or("mock"),
        }
    }

    /// Builds the engine.
    pub fn build(&self) -> GateResult<ArcScanner> {
        match self {
            Self::Command(spec) => {
                let mut config = CommandScannerConfig::from_preset(
                    spec.name.clone(),
                    spec.program.clone(),
                    spec.preset,
                );
                if let Some(args) = &spec.args {
                    config = config.with_args(args.iter().cloned());
                }
                if let Some(codes) = &spec.exit_codes {
                    config = config.with_exit_codes(ExitCodeTable::new(
                        codes.clean.clone(),
                        codes.suspect.clone(),
                    ));
                }
                if let Some(pattern) = &spec.detection_pattern {
                    config = config.with_detection_pattern(pattern.clone());
                }
                if let Some(args) = &spec.version_args {
                    config = config.with_version_args(args.iter().cloned());
                }
                let scanner = CommandScanner::new(config)
                    .map_err(|e| GateError::configuration(e.to_string()))?;
                Ok(Arc::new(scanner))
            }
            Self::Mock(spec) => {
                let mut scanner = MockScanner::new();
                if let Some(name) = &spec.name {
                    scanner = scanner.with_name(name.clone());
                }
                if let Some(marker) = &spec.marker {
                    scanner = scanner.with_marker(marker.as_bytes());
                }
                if let Some(verdict) = spec.verdict {
                    scanner = scanner.with_fixed_verdict(verdict);
                }
                if let Some(version) = &spec.version {
                    scanner = scanner.with_version(version.clone());
                }
                Ok(Arc::new(scanner))
            }
        }
    }
}

/// Builds the adapter for `engines`: the engine itself when there is one,
/// a composite otherwise.
pub fn build_scanner(
    engines: &[ScannerSpec],
    mode: EngineMode,
    timeout: Duration,
) -> GateResult<ArcScanner> {
    let mut built = engines
        .iter()
        .map(ScannerSpec::build)
        .collect::<GateResult<Vec<_>>>()?;
    if built.len() == 1 {
        if let Some(only) = built.pop() {
            return Ok(only);
        }
    }
    let composite = CompositeScanner::new(built, timeout)
        .map_err(|e| GateError::configuration(e.to_string()))?
        .with_mode(mode);
    Ok(Arc::new(composite))
}

/// Placement settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// What to do when a destination name is taken.
    #[serde(default)]
    pub collision: CollisionPolicy,
    /// Hex-encoded 32-byte key; hazard artifacts are sealed when set.
    #[serde(default)]
    pub hazard_key_file: Option<PathBuf>,
    /// Remove the source once its verified copy is in quarantine.
    #[serde(default = "default_true")]
    pub remove_source: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            collision: CollisionPolicy::default(),
            hazard_key_file: None,
            remove_source: true,
        }
    }
}

/// Digest settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingConfig {
    /// Also compute SHA-256 next to BLAKE3. Recorded in quarantine records,
    /// audit events and hazard manifests, and checked on every copy.
    #[serde(default)]
    pub sha256: bool,
}

impl HashingConfig {
    /// Hasher matching these settings.
    pub fn hasher(&self) -> FileHasher {
        FileHasher::new().with_sha256(self.sha256)
    }
}

/// What happens to files that got no verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorPolicy {
    /// Keep them in quarantine for the operator.
    #[default]
    Retain,
    /// Scan them again on the next run.
    RetryNextRun,
}

/// What happens when an engine reports an untested version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UntestedVersionPolicy {
    /// Log and notify, then continue.
    #[default]
    Warn,
    /// Refuse to start.
    Abort,
}

/// Operator policy decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Handling of `SCAN_ERROR` files.
    #[serde(default)]
    pub scan_error: ScanErrorPolicy,
    /// Handling of untested engine versions.
    #[serde(default)]
    pub untested_version: UntestedVersionPolicy,
    /// Failure kinds that make the process exit non-zero.
    #[serde(default = "default_exit_on")]
    pub exit_on: Vec<FailureKind>,
}

fn default_exit_on() -> Vec<FailureKind> {
    FailureKind::ALL.to_vec()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            scan_error: ScanErrorPolicy::default(),
            untested_version: UntestedVersionPolicy::default(),
            exit_on: default_exit_on(),
        }
    }
}

/// Everything one run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Directory layout.
    pub paths: PathsConfig,
    /// Throttle thresholds.
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-engine scan timeout in seconds.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Configured engines.
    #[serde(default)]
    pub engines: Vec<ScannerSpec>,
    /// How several engines run.
    #[serde(default)]
    pub engine_mode: EngineMode,
    /// Placement settings.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Digest settings.
    #[serde(default)]
    pub hashing: HashingConfig,
    /// Operator policy.
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::new(PathsConfig::default())
    }
}

impl GateConfig {
    /// Creates a configuration with default settings and no engines.
    pub fn new(paths: PathsConfig) -> Self {
        Self {
            paths,
            throttle: ThrottleConfig::default(),
            workers: default_workers(),
            scan_timeout_secs: default_scan_timeout_secs(),
            engines: Vec::new(),
            engine_mode: EngineMode::default(),
            routing: RoutingConfig::default(),
            hashing: HashingConfig::default(),
            policy: PolicyConfig::default(),
        }
    }

    /// Loads and validates a TOML file.
    pub fn from_toml_file(path: &Path) -> GateResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GateError::path(path, format!("cannot read configuration: {e}")))?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML without validating.
    pub fn from_toml_str(text: &str) -> GateResult<Self> {
        toml::from_str(text).map_err(|e| GateError::configuration(e.to_string()))
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the throttle thresholds.
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Adds an engine.
    pub fn with_engine(mut self, engine: ScannerSpec) -> Self {
        self.engines.push(engine);
        self
    }

    /// Sets the engine mode.
    pub fn with_engine_mode(mut self, mode: EngineMode) -> Self {
        self.engine_mode = mode;
        self
    }

    /// Sets the routing settings.
    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    /// Sets the digest settings.
    pub fn with_hashing(mut self, hashing: HashingConfig) -> Self {
        self.hashing = hashing;
        self
    }

    /// Sets the policy.
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Per-engine scan timeout.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Loads the hazard key, if one is configured.
    pub fn hazard_key(&self) -> GateResult<Option<Arc<HazardKey>>> {
        match &self.routing.hazard_key_file {
            None => Ok(None),
            Some(path) => HazardKey::from_hex_file(path)
                .map(|key| Some(Arc::new(key)))
                .map_err(|e| {
                    GateError::configuration(format!(
                        "hazard key {} is unusable: {e}",
                        path.display()
                    ))
                }),
        }
    }

    /// Checks everything that can be checked without touching the run
    /// directories.
    pub fn validate(&self) -> GateResult<()> {
        self.validate_settings()?;
        if self.engines.is_empty() {
            return Err(GateError::configuration("at least one engine is required"));
        }
        let mut names: Vec<&str> = self.engines.iter().map(ScannerSpec::name).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(GateError::configuration(format!(
                "engine name '{}' is used twice",
                pair[0]
            )));
        }
        for engine in &self.engines {
            engine.build()?;
        }
        Ok(())
    }

    /// Everything except the engine list, for runs handed a ready scanner.
    pub(crate) fn validate_settings(&self) -> GateResult<()> {
        if self.workers == 0 {
            return Err(GateError::configuration("workers must be at least 1"));
        }
        if self.scan_timeout_secs == 0 {
            return Err(GateError::configuration("scan_timeout_secs must be positive"));
        }
        self.hazard_key()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
        workers = 2

        [paths]
        source = "/srv/in"
        quarantine = "/srv/q"
        destination = "/srv/out"
        hazard = "/srv/hazard"
        tracking = "/var/lib/qg"

        [throttle]
        min_free_space = "100MB"
        max_files_per_day = 10
        max_volume_per_day = 52428800

        [[engines]]
        kind = "command"
        name = "clamav"
        program = "/usr/bin/clamscan"
        preset = "clamscan"

        [[engines]]
        kind = "command"
        name = "custom"
        program = "/opt/scan"
        args = ["--file"]
        exit_codes = { clean = [0], suspect = [3, 4] }

        [hashing]
        sha256 = true

        [policy]
        scan_error = "retry_next_run"
        exit_on = ["copy_integrity"]
    "#;

    #[test]
    fn test_parses_full_file() {
        let config = GateConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.scan_timeout_secs, 300);
        assert_eq!(config.throttle.min_free_space, ByteSize(100_000_000));
        assert_eq!(config.throttle.max_volume_per_day, ByteSize(50 * 1024 * 1024));
        assert_eq!(config.engines.len(), 2);
        assert_eq!(config.engine_mode, EngineMode::Concurrent);
        assert_eq!(config.policy.scan_error, ScanErrorPolicy::RetryNextRun);
        assert_eq!(config.policy.exit_on, vec![FailureKind::CopyIntegrity]);
        assert!(config.routing.remove_source);
        assert!(config.hashing.hasher().computes_sha256());
        assert!(!GateConfig::default().hashing.hasher().computes_sha256());
        assert_eq!(
            config.paths.lock_file(),
            PathBuf::from("/var/lib/qg/quarantine-gate.lock")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_byte_sizes() {
        assert_eq!("0".parse::<ByteSize>().unwrap(), ByteSize(0));
        assert_eq!("5 MB".parse::<ByteSize>().unwrap(), ByteSize(5_000_000));
        assert_eq!("1GiB".parse::<ByteSize>().unwrap(), ByteSize(1 << 30));
        assert!("lots".parse::<ByteSize>().is_err());
        assert!("5 parsecs".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = GateConfig::new(PathsConfig::under("/tmp/qg")).with_engine(ScannerSpec::mock());
        base.validate().unwrap();

        assert!(base.clone().with_workers(0).validate().is_err());
        assert!(base
            .clone()
            .with_scan_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(GateConfig::new(PathsConfig::under("/tmp/qg")).validate().is_err());
        assert!(base
            .clone()
            .with_engine(ScannerSpec::mock())
            .validate()
            .is_err());
    }

    #[test]
    fn test_conflicting_exit_codes_rejected() {
        let config = GateConfig::new(PathsConfig::under("/tmp/qg")).with_engine(
            ScannerSpec::Command(CommandEngineSpec {
                name: "bad".into(),
                program: "/bin/true".into(),
                preset: EnginePreset::Custom,
                args: None,
                exit_codes: Some(ExitCodeSpec {
                    clean: vec![0],
                    suspect: vec![0],
                }),
                detection_pattern: None,
                version_args: None,
            }),
        );
        assert!(matches!(config.validate(), Err(GateError::Configuration(_))));
    }

    #[test]
    fn test_hazard_key_file() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("hazard.key");
        std::fs::write(&key_path, "ab".repeat(32)).unwrap();

        let mut config =
            GateConfig::new(PathsConfig::under(dir.path())).with_engine(ScannerSpec::mock());
        config.routing.hazard_key_file = Some(key_path.clone());
        assert!(config.hazard_key().unwrap().is_some());

        std::fs::write(&key_path, "not hex").unwrap();
        assert!(matches!(config.validate(), Err(GateError::Configuration(_))));
    }

    #[test]
    fn test_single_engine_is_not_wrapped() {
        let scanner =
            build_scanner(&[ScannerSpec::mock()], EngineMode::Concurrent, Duration::from_secs(1))
                .unwrap();
        assert_eq!(scanner.name(), "mock");
        assert!(scanner.members().is_empty());

        let two = [
            ScannerSpec::mock(),
            ScannerSpec::Mock(MockEngineSpec {
                name: Some("second".into()),
                ..Default::default()
            }),
        ];
        let scanner =
            build_scanner(&two, EngineMode::Sequential, Duration::from_secs(1)).unwrap();
        assert_eq!(scanner.members().len(), 2);
    }
}
