//! The daemon lock file.
//!
//! One daemon per data directory. The lock file holds the serialized
//! [`DaemonState`] and is rewritten on every tick, so its `last_tick_at`
//! doubles as a heartbeat. A lock whose heartbeat is older than the stale
//! threshold belongs to a dead daemon and is taken over.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cadence_core::schedule::DaemonState;
use chrono::{SecondsFormat, Utc};

use super::DaemonError;

/// What `daemon status` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    NotRunning,
    Running(DaemonState),
    Stale(DaemonState),
}

/// Held while the daemon runs. Dropping it removes the lock file.
#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl DaemonLock {
    /// Create the lock file for `state`, taking over a stale one.
    pub fn acquire(path: &Path, state: &DaemonState, stale_after: Duration) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DaemonError::io(parent, e))?;
        }

        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let body = serialize(path, state)?;
                file.write_all(body.as_bytes()).map_err(|e| DaemonError::io(path, e))?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_state(path) {
                    Ok(Some(existing)) if !existing.is_stale(Utc::now(), stale_after) => {
                        return Err(DaemonError::AlreadyRunning {
                            pid: existing.pid,
                            last_tick_at: existing
                                .last_tick_at
                                .to_rfc3339_opts(SecondsFormat::Secs, true),
                        });
                    }
                    Ok(Some(existing)) => tracing::warn!(
                        pid = existing.pid,
                        last_tick_at = %existing.last_tick_at,
                        "taking over stale daemon lock"
                    ),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "replacing unreadable daemon lock"),
                }
                write_atomic(path, state)?;
            }
            Err(err) => return Err(DaemonError::io(path, err)),
        }

        tracing::debug!(path = %path.display(), pid = state.pid, "daemon lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid: state.pid,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the lock with a fresh heartbeat.
    pub fn refresh(&self, state: &DaemonState) -> Result<(), DaemonError> {
        write_atomic(&self.path, state)
    }

    /// Remove the lock file if it is still ours.
    pub fn release(mut self) -> Result<(), DaemonError> {
        self.released = true;
        remove_if_owned(&self.path, self.pid)
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if !self.released {
            // Best effort
            let _ = remove_if_owned(&self.path, self.pid);
        }
    }
}

fn remove_if_owned(path: &Path, pid: u32) -> Result<(), DaemonError> {
    match read_state(path) {
        Ok(Some(state)) if state.pid != pid => {
            tracing::warn!(owner = state.pid, "daemon lock was taken over, leaving it");
            Ok(())
        }
        _ => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DaemonError::io(path, e)),
        },
    }
}

fn serialize(path: &Path, state: &DaemonState) -> Result<String, DaemonError> {
    serde_json::to_string_pretty(state).map_err(|e| DaemonError::CorruptLock {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_atomic(path: &Path, state: &DaemonState) -> Result<(), DaemonError> {
    let body = serialize(path, state)?;
    let tmp = path.with_extension("lock.tmp");
    std::fs::write(&tmp, body).map_err(|e| DaemonError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| DaemonError::io(path, e))
}

/// Read the state in a lock file; `None` when there is no lock.
pub fn read_state(path: &Path) -> Result<Option<DaemonState>, DaemonError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DaemonError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| DaemonError::CorruptLock {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Classify the lock at `path`.
pub fn status(path: &Path, stale_after: Duration) -> Result<LockStatus, DaemonError> {
    Ok(match read_state(path)? {
        None => LockStatus::NotRunning,
        Some(state) if state.is_stale(Utc::now(), stale_after) => LockStatus::Stale(state),
        Some(state) => LockStatus::Running(state),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(120);

    #[test]
    fn test_acquire_refresh_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let mut state = DaemonState::new(std::process::id(), Utc::now());

        let lock = DaemonLock::acquire(&path, &state, STALE).unwrap();
        assert!(matches!(status(&path, STALE).unwrap(), LockStatus::Running(_)));

        state.in_flight = 2;
        lock.refresh(&state).unwrap();
        assert_eq!(read_state(&path).unwrap().unwrap().in_flight, 2);

        lock.release().unwrap();
        assert!(!path.exists());
        assert_eq!(status(&path, STALE).unwrap(), LockStatus::NotRunning);
    }

    #[test]
    fn test_second_daemon_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let _held = DaemonLock::acquire(&path, &DaemonState::new(1, Utc::now()), STALE).unwrap();

        let err = DaemonLock::acquire(&path, &DaemonState::new(2, Utc::now()), STALE).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning { pid: 1, .. }));
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        let mut old = DaemonState::new(1, Utc::now() - chrono::Duration::minutes(10));
        old.last_tick_at = Utc::now() - chrono::Duration::minutes(10);
        std::fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();
        assert!(matches!(status(&path, STALE).unwrap(), LockStatus::Stale(_)));

        let lock = DaemonLock::acquire(&path, &DaemonState::new(2, Utc::now()), STALE).unwrap();
        assert_eq!(read_state(&path).unwrap().unwrap().pid, 2);
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.lock");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(read_state(&path), Err(DaemonError::CorruptLock { .. })));

        let _lock = DaemonLock::acquire(&path, &DaemonState::new(3, Utc::now()), STALE).unwrap();
        assert_eq!(read_state(&path).unwrap().unwrap().pid, 3);
    }
}
