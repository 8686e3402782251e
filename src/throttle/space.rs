//! Free-space probes.

use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports free space on the volume the gate writes to.
pub trait SpaceProbe: Send + Sync + Debug {
    /// Bytes available to this process.
    fn available_bytes(&self) -> io::Result<u64>;
}

/// Asks the filesystem holding `path`.
#[derive(Debug, Clone)]
pub struct FsSpaceProbe {
    path: PathBuf,
}

impl FsSpaceProbe {
    /// Probes the volume that holds `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpaceProbe for FsSpaceProbe {
    fn available_bytes(&self) -> io::Result<u64> {
        fs2::available_space(&self.path)
    }
}

/// A probe that reports whatever it was last told.
#[derive(Debug, Default)]
pub struct FixedSpaceProbe {
    bytes: AtomicU64,
}

impl FixedSpaceProbe {
    /// Reports `bytes` until changed.
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    /// Changes the reported value.
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self) -> io::Result<u64> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}
