//! Single-instance lock.

use crate::audit;
use crate::core::error::{GateError, GateResult};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const ATTEMPTS: usize = 4;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSentinel {
    /// Owning process.
    pub pid: u32,
    /// Host the owner runs on.
    pub hostname: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

impl LockSentinel {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now(),
        }
    }
}

/// Guard for the one orchestrator allowed to run against a lock path.
///
/// The guard holds an exclusive `fs2` lock on the lock file for its whole
/// life, so the OS releases it if the process dies. The file carries a
/// sentinel naming the owner. A sentinel left by a process that is no
/// longer alive on this host is reclaimed; one naming a live process or
/// another host means another instance is running. Dropping the guard
/// removes the file if it still names this process.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    sentinel: LockSentinel,
    // Holds the OS lock; closed after `drop` has removed the path.
    file: File,
}

impl InstanceLock {
    /// Takes the lock at `path`.
    ///
    /// # Errors
    ///
    /// `LockHeld` if a live instance owns it, `Configuration` if the lock
    /// file is not a sentinel this program wrote, `PathValidation` if the
    /// file cannot be opened or written.
    pub fn acquire(path: impl Into<PathBuf>) -> GateResult<Self> {
        let path = path.into();
        let sentinel = LockSentinel::current();

        for _ in 0..ATTEMPTS {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| GateError::path(&path, format!("cannot open lock: {e}")))?;

            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => {
                    let pid = read_sentinel(&mut file).ok().flatten().map(|s| s.pid);
                    return Err(GateError::LockHeld { path, pid });
                }
                Err(e) => return Err(GateError::path(&path, format!("cannot lock: {e}"))),
            }

            // The previous owner may have removed the path between our open
            // and our lock; a lock on an unlinked file guards nothing.
            let current = same_file(&file, &path)
                .map_err(|e| GateError::path(&path, format!("cannot stat lock: {e}")))?;
            if !current {
                continue;
            }

            let previous = Self::inspect(&path, &mut file)?;
            write_sentinel(&mut file, &sentinel)
                .map_err(|e| GateError::path(&path, format!("cannot write lock: {e}")))?;

            if let Some(previous) = previous {
                tracing::warn!(
                    path = %path.display(),
                    previous_pid = previous.pid,
                    "Reclaimed stale instance lock"
                );
                audit::emit_lock_event(&path, "reclaimed", Some(previous.pid));
            }
            tracing::info!(path = %path.display(), pid = sentinel.pid, "Instance lock acquired");
            audit::emit_lock_event(&path, "acquired", None);
            return Ok(Self {
                path,
                sentinel,
                file,
            });
        }

        Err(GateError::LockHeld { path, pid: None })
    }

    /// Reads the sentinel under a lock this process just took. Returns the
    /// previous owner if it is stale, nothing if the file was empty.
    fn inspect(path: &Path, file: &mut File) -> GateResult<Option<LockSentinel>> {
        // Empty and unlocked: the previous owner died before writing.
        let sentinel = read_sentinel(file).map_err(|e| {
            GateError::configuration(format!(
                "lock file {} is not a quarantine-gate lock ({e}); remove it by hand",
                path.display()
            ))
        })?;
        let Some(sentinel) = sentinel else {
            return Ok(None);
        };

        let foreign = sentinel.hostname != hostname();
        let live = sentinel.pid != std::process::id() && process_alive(sentinel.pid);
        if foreign || live {
            return Err(GateError::LockHeld {
                path: path.to_path_buf(),
                pid: Some(sentinel.pid),
            });
        }
        Ok(Some(sentinel))
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What this guard wrote.
    pub fn sentinel(&self) -> &LockSentinel {
        &self.sentinel
    }

    /// Releases the lock.
    pub fn release(self) {}
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let ours = same_file(&self.file, &self.path).unwrap_or(false)
            && read_sentinel(&mut self.file)
                .ok()
                .flatten()
                .is_some_and(|s| s == self.sentinel);
        if !ours {
            tracing::warn!(path = %self.path.display(), "Instance lock no longer ours, leaving it");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => audit::emit_lock_event(&self.path, "released", None),
            Err(e) => tracing::error!(path = %self.path.display(), error = %e, "Failed to release instance lock"),
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// `Ok(None)` for an empty file.
fn read_sentinel(file: &mut File) -> std::io::Result<Option<LockSentinel>> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text).map(Some).map_err(std::io::Error::from)
}

fn write_sentinel(file: &mut File, sentinel: &LockSentinel) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(sentinel)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_all()
}

/// Whether `path` still names the file behind `file`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

/// This host's name.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_default()
    }
}

/// Returns `true` unless `pid` is known to be gone.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Returns `true` unless `pid` is known to be gone.
#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}
