//! Scanning backend implementations.
//!
//! This module contains implementations of the `Scanner` trait for the
//! engines the gate can drive.
//!
//! ## Available Backends
//!
//! - [`command`] - Any command-line engine, with `clamscan` and Defender presets
//! - [`composite`] - Several engines combined worst-of
//! - [`mock`] - A marker-based scanner for testing and dry runs
//!
//! ## Implementing a Custom Backend
//!
//! To add a new scanning engine, implement the `Scanner` trait:
//!
//! ```rust,ignore
//! use quarantine_gate::core::{Scanner, ScanReport, ScanError};
//! use async_trait::async_trait;
//! use std::path::Path;
//!
//! #[derive(Debug)]
//! pub struct MyScanner;
//!
//! #[async_trait]
//! impl Scanner for MyScanner {
//!     fn name(&self) -> &str {
//!         "my-scanner"
//!     }
//!
//!     async fn scan(&self, path: &Path) -> Result<ScanReport, ScanError> {
//!         // Run the engine and map its answer to CLEAN / SUSPECT / SCAN_ERROR
//!         todo!()
//!     }
//! }
//! ```

pub mod command;
pub mod composite;
pub mod mock;

// Re-exports
pub use command::{CommandScanner, CommandScannerConfig, EnginePreset, ExitCodeTable};
pub use composite::{CompositeScanner, EngineMode};
pub use mock::{MockScanner, EICAR_MARKER};
