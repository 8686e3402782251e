//! # Quarantine Gate
//!
//! Moves files from an untrusted source directory to a trusted destination
//! only after malware scanning, with a quarantine-first workflow.
//!
//! ## Overview
//!
//! Every admitted file is:
//!
//! - Hashed, then copied into an isolated quarantine area and verified
//! - Scanned by one or more external engines, combined worst-of
//! - Delivered to the destination when clean, or moved into an optionally
//!   encrypted hazard archive when suspect. Never both, never neither
//!
//! Files without a usable verdict stay in quarantine. Admission is bounded
//! by free disk space and a persisted daily file/volume quota, and only one
//! instance runs against a lock path at a time.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quarantine_gate::config::{GateConfig, PathsConfig, ScannerSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GateConfig::new(PathsConfig::under("/srv/gate"))
//!         .with_engine(ScannerSpec::mock());
//!
//!     let summary = quarantine_gate::run(config).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Core**: Verdicts, hashes, the `Scanner` trait, errors
//! - **Backends**: Command-line, composite and mock engines
//! - **Quarantine**: Verified holding area and resume records
//! - **Routing**: Destination delivery and the hazard archive
//! - **Throttle**: Free-space and daily-quota admission control
//! - **Worker**: The per-file state machine
//! - **Orchestrator**: Lock, admission loop, run summary
//! - **Audit**: Structured logging for compliance

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod audit;
pub mod backends;
pub mod config;
pub mod core;
pub mod notify;
pub mod orchestrator;
pub mod quarantine;
pub mod routing;
pub mod throttle;
pub mod worker;

// Re-export commonly used types at the crate root
pub use crate::config::GateConfig;
pub use crate::core::{
    FailureKind, FileHash, FileHasher, GateError, ScanReport, ScanVerdict, Scanner, SourceFile,
    TaskId,
};
pub use crate::orchestrator::{run, Orchestrator, RunSummary, StopHandle};
pub use crate::throttle::{DailyUsageTracker, ThrottleDecision, ThrottleGate, ThrottleReason};
pub use crate::worker::{FileTask, TaskState};

/// Prelude module for convenient imports.
///
/// ```rust
/// use quarantine_gate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backends::{CommandScanner, CompositeScanner, MockScanner};
    pub use crate::config::{GateConfig, PathsConfig, ScannerSpec, ThrottleConfig};
    pub use crate::core::{
        FailureKind, FileHash, FileHasher, GateError, ScanReport, ScanVerdict, Scanner,
    };
    pub use crate::notify::{Notifier, NotifyLevel};
    pub use crate::orchestrator::{run, Orchestrator, RunSummary, StopHandle};
    pub use crate::routing::{CollisionPolicy, HazardKey};
    pub use crate::throttle::{ThrottleLimits, ThrottleReason};
    pub use crate::worker::{FileTask, TaskState};
}
