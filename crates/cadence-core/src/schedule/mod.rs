//! Scheduled tasks: the interval grammar, task operations and the daemon
//! poll loop.

pub mod daemon;
pub mod interval;
pub mod tasks;

use cadence_types::error::RepositoryError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::preset::PresetError;

pub use daemon::{DaemonState, Scheduler};
pub use interval::{compute_next_run, next_run_after, IntervalSpec, IntervalUnit};
pub use tasks::{NewTask, TaskService};

/// Errors from scheduling and task operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("a task named '{0}' already exists")]
    DuplicateTask(String),

    #[error(transparent)]
    Preset(#[from] PresetError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("store error: {0}")]
    Store(#[from] RepositoryError),
}
