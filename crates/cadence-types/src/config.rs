//! Global configuration types for Cadence.
//!
//! `GlobalConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a serde default so a partial or empty file is
//! valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Directory searched for presets referenced by name
    /// (defaults to `{data_dir}/presets`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presets_dir: Option<PathBuf>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Execution engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for `shell` steps without an explicit `timeout` param.
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,

    /// Safety cap for `while` steps without an explicit `maxIterations`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Step outputs larger than this are replaced with a truncation marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,
}

fn default_shell_timeout_secs() -> u64 {
    300
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_step_output_bytes() -> usize {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout_secs(),
            max_iterations: default_max_iterations(),
            max_step_output_bytes: default_max_step_output_bytes(),
        }
    }
}

/// Scheduler daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Poll interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// A lock file whose last heartbeat is older than this is considered
    /// abandoned and may be taken over.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

fn default_tick_secs() -> u64 {
    15
}

fn default_stale_lock_secs() -> u64 {
    120
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}
