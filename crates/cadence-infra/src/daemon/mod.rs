//! Daemon process plumbing: the state lock file, background spawning and
//! OS service units.

pub mod lock;
pub mod service;

use std::path::PathBuf;

use thiserror::Error;

pub use lock::{read_state, DaemonLock, LockStatus};
pub use service::{install_service, render_service, spawn_background, uninstall_service, ServiceKind};

/// Errors from daemon process management.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running (pid {pid}, last tick {last_tick_at})")]
    AlreadyRunning { pid: u32, last_tick_at: String },

    #[error("lock file {path} is corrupt: {reason}")]
    CorruptLock { path: PathBuf, reason: String },

    #[error("service install is not supported on this platform")]
    UnsupportedPlatform,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DaemonError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
