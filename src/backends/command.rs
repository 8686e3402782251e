//! External command-line scanning engines.
//!
//! Each invocation runs `program [args...] <path>` and translates the exit
//! status into a verdict through an [`ExitCodeTable`]. The table is the
//! only engine-specific part; presets cover `clamscan` and Microsoft
//! Defender's `MpCmdRun`.
//!
//! # Exit code tables
//!
//! | Preset     | Clean | Suspect | Anything else |
//! |------------|-------|---------|---------------|
//! | `clamscan` | 0     | 1       | SCAN_ERROR    |
//! | `defender` | 0     | 2       | SCAN_ERROR    |
//!
//! A process killed by a signal has no exit code and is always `SCAN_ERROR`.

use crate::core::{EngineFinding, ScanError, ScanReport, ScanVerdict, Scanner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Longest engine output kept in a finding's detail.
const MAX_DETAIL_LEN: usize = 512;

/// Maps engine exit codes onto the three-value verdict contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeTable {
    /// Exit codes meaning "nothing found".
    pub clean: Vec<i32>,
    /// Exit codes meaning "threat found".
    pub suspect: Vec<i32>,
}

impl ExitCodeTable {
    /// Creates a custom table.
    pub fn new(clean: impl Into<Vec<i32>>, suspect: impl Into<Vec<i32>>) -> Self {
        Self {
            clean: clean.into(),
            suspect: suspect.into(),
        }
    }

    /// `clamscan`: 0 clean, 1 virus found, 2 error.
    pub fn clamscan() -> Self {
        Self::new([0], [1])
    }

    /// `MpCmdRun -Scan`: 0 clean, 2 threat found.
    pub fn defender() -> Self {
        Self::new([0], [2])
    }

    /// Translates an exit code (`None` for signal death) into a verdict.
    pub fn classify(&self, code: Option<i32>) -> ScanVerdict {
        match code {
            Some(c) if self.suspect.contains(&c) => ScanVerdict::Suspect,
            Some(c) if self.clean.contains(&c) => ScanVerdict::Clean,
            _ => ScanVerdict::ScanError,
        }
    }
}

/// Known engine command lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreset {
    /// ClamAV command-line scanner.
    Clamscan,
    /// Microsoft Defender command-line utility.
    Defender,
    /// Arguments and exit codes supplied by the operator.
    Custom,
}

impl EnginePreset {
    /// Default arguments placed before the file path.
    pub fn default_args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Clamscan => &["--no-summary", "--stdout"],
            Self::Defender => &["-Scan", "-ScanType", "3", "-DisableRemediation", "-File"],
            Self::Custom => &[],
        };
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Default exit code table.
    pub fn exit_codes(&self) -> ExitCodeTable {
        match self {
            Self::Clamscan => ExitCodeTable::clamscan(),
            Self::Defender => ExitCodeTable::defender(),
            Self::Custom => ExitCodeTable::new([0], [1]),
        }
    }

    /// Default arguments that make the program print its version.
    pub fn version_args(&self) -> Option<Vec<String>> {
        match self {
            Self::Clamscan => Some(vec!["--version".to_string()]),
            Self::Defender | Self::Custom => None,
        }
    }
}

/// Configuration of one command-line engine.
#[derive(Debug, Clone)]
pub struct CommandScannerConfig {
    /// Engine name used in logs and findings.
    pub name: String,
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments placed before the file path.
    pub args: Vec<String>,
    /// Exit code translation.
    pub exit_codes: ExitCodeTable,
    /// Output text that forces a `SUSPECT` verdict regardless of exit code.
    pub detection_pattern: Option<String>,
    /// Arguments that print the engine version, if supported.
    pub version_args: Option<Vec<String>>,
}

impl CommandScannerConfig {
    /// Creates a configuration from a preset.
    pub fn from_preset(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        preset: EnginePreset,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: preset.default_args(),
            exit_codes: preset.exit_codes(),
            detection_pattern: None,
            version_args: preset.version_args(),
        }
    }

    /// Replaces the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the exit code table.
    pub fn with_exit_codes(mut self, table: ExitCodeTable) -> Self {
        self.exit_codes = table;
        self
    }

    /// Sets the output text that marks a detection.
    pub fn with_detection_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.detection_pattern = Some(pattern.into());
        self
    }

    /// Sets the version arguments.
    pub fn with_version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = Some(args.into_iter().map(Into::into).collect());
        self
    }
}

/// A scanner that shells out to an external engine.
///
/// # Example
///
/// ```rust,ignore
/// use quarantine_gate::backends::{CommandScanner, CommandScannerConfig, EnginePreset};
///
/// let config = CommandScannerConfig::from_preset("clamav", "/usr/bin/clamscan", EnginePreset::Clamscan);
/// let scanner = CommandScanner::new(config)?;
/// ```
#[derive(Debug)]
pub struct CommandScanner {
    config: CommandScannerConfig,
}

impl CommandScanner {
    /// Creates a new command scanner.
    pub fn new(config: CommandScannerConfig) -> Result<Self, ScanError> {
        if config.name.trim().is_empty() {
            return Err(ScanError::configuration("engine name must not be empty"));
        }
        if config.program.as_os_str().is_empty() {
            return Err(ScanError::configuration(format!(
                "engine '{}' has no program",
                config.name
            )));
        }
        if config.exit_codes.clean.iter().any(|c| config.exit_codes.suspect.contains(c)) {
            return Err(ScanError::configuration(format!(
                "engine '{}' lists the same exit code as clean and suspect",
                config.name
            )));
        }
        Ok(Self { config })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CommandScannerConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ScanError {
        ScanError::Spawn {
            engine: self.config.name.clone(),
            program: self.config.program.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl Scanner for CommandScanner {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError> {
        if !path.is_file() {
            return Err(ScanError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let started = Instant::now();
        let output = self
            .command()
            .args(&self.config.args)
            .arg(path)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut verdict = self.config.exit_codes.classify(code);

        if let Some(pattern) = &self.config.detection_pattern {
            if stdout.contains(pattern.as_str()) {
                verdict = ScanVerdict::Suspect;
            }
        }

        let detail = match code {
            Some(c) => format!("exit code {c}: {}", summarize(&stdout)),
            None => "terminated by signal".to_string(),
        };

        tracing::debug!(
            engine = %self.config.name,
            path = %path.display(),
            exit_code = ?code,
            verdict = %verdict,
            duration_ms = started.elapsed().as_millis() as u64,
            "Engine finished"
        );

        Ok(ScanReport::single(
            EngineFinding::new(self.config.name.clone(), verdict, started.elapsed())
                .with_detail(detail),
        ))
    }

    async fn health_check(&self) -> Result<(), ScanError> {
        match &self.config.version_args {
            Some(args) => {
                let status = self
                    .command()
                    .args(args)
                    .status()
                    .await
                    .map_err(|e| self.spawn_error(e))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ScanError::engine_unavailable(
                        &self.config.name,
                        format!("version probe exited with {status}"),
                    ))
                }
            }
            None => Ok(()),
        }
    }

    async fn signature_version(&self) -> Option<String> {
        let args = self.config.version_args.as_ref()?;
        let output = self.command().args(args).output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// First non-empty output line, truncated.
fn summarize(output: &str) -> String {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.chars().take(MAX_DETAIL_LEN).collect()
}
