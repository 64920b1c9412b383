//! Data directory layout for Cadence.
//!
//! ```text
//! {data_dir}/
//!   config.toml
//!   credentials.toml
//!   cadence.db
//!   daemon.lock
//!   presets/
//!   logs/daemon.log
//! ```

use std::path::{Path, PathBuf};

use crate::sqlite::pool::DATABASE_FILE;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CADENCE_DATA_DIR";

/// Paths inside one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data directory from the environment or the home directory.
    pub fn resolve() -> Self {
        Self::new(resolve_data_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.toml")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("daemon.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.logs_dir().join("daemon.log")
    }

    /// Create the directory and its `logs/` and `presets/` children.
    pub async fn ensure(&self) -> Result<(), std::io::Error> {
        tokio::fs::create_dir_all(self.logs_dir()).await?;
        tokio::fs::create_dir_all(self.root.join("presets")).await
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `CADENCE_DATA_DIR` environment variable
/// 2. `~/.cadence`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".cadence");
    }

    // Last resort: current directory
    PathBuf::from(".cadence")
}
