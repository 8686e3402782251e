//! Core types and traits for the quarantine gate.
//!
//! - [`types`] - Verdicts, hashes, task ids, source identity
//! - [`traits`] - The `Scanner` trait and the timeout-bounded `scan_within`
//! - [`error`] - Structured error types
//! - [`hasher`] - BLAKE3-based file hashing
//! - [`fsio`] - Atomic and durable file writes
//! - [`result`] - Engine findings and combined scan reports

pub mod error;
pub mod fsio;
pub mod hasher;
pub mod result;
pub mod traits;
pub mod types;

pub use error::{
    FailureKind, GateError, GateResult, QuarantineError, QuarantineResult, RouteError,
    RouteResult, ScanError, TrackerError,
};
pub use hasher::FileHasher;
pub use result::{EngineFinding, ScanReport};
pub use traits::{leaf_engines, scan_within, ArcScanner, BoxedScanner, Scanner};
pub use types::{FileHash, ScanVerdict, SourceFile, TaskId};
