//! Task repository trait definition.

use cadence_types::error::RepositoryError;
use cadence_types::task::Task;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence for scheduled tasks.
///
/// Every mutation is a single-row update. The two scheduling writes
/// ([`claim`](Self::claim) and [`reschedule`](Self::reschedule)) are
/// compare-and-swap on `next_run_at`, so a poll tick and a manual command
/// can never both win the same row.
pub trait TaskRepository: Send + Sync {
    /// Insert a new task. A duplicate name is a `Conflict`.
    fn create_task(
        &self,
        task: &Task,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    fn get_task_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Task>, RepositoryError>> + Send;

    /// All tasks ordered by name.
    fn list_tasks(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Set the enabled flag and next run time in one update.
    fn set_enabled(
        &self,
        id: &Uuid,
        enabled: bool,
        next_run_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a task. Returns `true` if it existed.
    fn delete_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Enabled tasks with `next_run_at <= now`, earliest first.
    fn list_due(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, RepositoryError>> + Send;

    /// Advance `next_run_at` from `observed` to `next` if nobody else has.
    /// Returns `true` when this caller won the claim.
    fn claim(
        &self,
        id: &Uuid,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// After a run: move `next_run_at` from `observed` to `next` and stamp
    /// `last_run_at`. Returns `false` if the row changed meanwhile (the
    /// task was re-enabled, for example), in which case only `last_run_at`
    /// is written.
    fn reschedule(
        &self,
        id: &Uuid,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
