//! PID-based exclusive file lock with stale-owner detection.
//!
//! The acquire/collide/check-liveness/retry-once shape is grounded in
//! the segment-ownership staleness check from the shared-memory
//! discovery module in the pack: a lock file records its owner's PID and
//! creation time, and "no such process" is treated as sufficient proof
//! that the previous owner is gone.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LockError;

#[derive(Debug, Serialize, Deserialize)]
struct LockContents {
    pid: i32,
    created_unix_ms: u128,
}

/// Returns true if a process with the given pid is alive, using a
/// null-signal `kill` probe: `ESRCH` means the pid is free, any other
/// outcome (including success) is treated as "alive enough to not
/// steal the lock".
fn is_process_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    let errno = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(0);
    errno != libc::ESRCH
}

/// Holds an acquired lock for the lifetime of the value; the file is
/// removed on drop so the owning process's exit (clean or not, as long
/// as the destructor runs) releases it. Abnormal termination (SIGKILL)
/// leaves the file behind, which is exactly the case the staleness
/// check exists to recover from.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Attempts to acquire the lock at `path`. On collision with a dead
    /// owner, removes the stale file and retries exactly once; on
    /// collision with a live owner, fails with `AlreadyHeld`.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        match Self::try_create(&path) {
            Ok(()) => Ok(Self { path }),
            Err(LockError::AlreadyHeld(pid)) => {
                if is_process_alive(pid) {
                    Err(LockError::AlreadyHeld(pid))
                } else {
                    tracing::warn!(pid, path = %path.display(), "removing stale lock file");
                    std::fs::remove_file(&path).or_else(|e| {
                        if e.kind() == ErrorKind::NotFound {
                            Ok(())
                        } else {
                            Err(e)
                        }
                    })?;
                    Self::try_create(&path)?;
                    Ok(Self { path })
                }
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path) -> Result<(), LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::read_holder(path)?;
                return Err(LockError::AlreadyHeld(holder.pid));
            }
            Err(e) => return Err(e.into()),
        };

        let contents = LockContents {
            pid: std::process::id() as i32,
            created_unix_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        };
        let json = serde_json::to_string(&contents)
            .map_err(|e| LockError::Malformed(e.to_string()))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    fn read_holder(path: &Path) -> Result<LockContents, LockError> {
        let mut buf = String::new();
        std::fs::File::open(path)?.read_to_string(&mut buf)?;
        serde_json::from_str(&buf).map_err(|e| LockError::Malformed(e.to_string()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to remove lock file on release");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan0.lock");
        let _first = FileLock::acquire(&path).unwrap();
        let err = FileLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld(pid) if pid == std::process::id() as i32));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan0.lock");
        {
            let _first = FileLock::acquire(&path).unwrap();
        }
        let second = FileLock::acquire(&path);
        assert!(second.is_ok());
    }

    #[test]
    fn stale_lock_from_dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wan0.lock");
        // A pid vanishingly unlikely to be alive on any test host.
        let contents = LockContents {
            pid: 999_999,
            created_unix_ms: 0,
        };
        std::fs::write(&path, serde_json::to_string(&contents).unwrap()).unwrap();
        let acquired = FileLock::acquire(&path);
        assert!(acquired.is_ok());
    }
}
