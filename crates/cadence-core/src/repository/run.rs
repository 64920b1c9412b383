//! Run repository trait definition.
//!
//! Runs are append-only: a run row is created when execution starts, step
//! results are appended as they finish, and the row is finalized once.

use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, StepResult};
use uuid::Uuid;

/// Persistence for runs and their step results.
pub trait RunRepository: Send + Sync {
    /// Insert a run record (normally in `running` status).
    fn create_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Append one step result at sequence number `seq`.
    fn append_step_result(
        &self,
        run_id: &Uuid,
        seq: u32,
        result: &StepResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Write the terminal status, error and finish time.
    fn finish_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a run with its step results.
    fn get_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// Most recent runs first, optionally limited to one task. Step results
    /// are not loaded.
    fn list_runs(
        &self,
        task_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    /// Step results of a run in sequence order.
    fn list_step_results(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepResult>, RepositoryError>> + Send;

    /// Mark `running` runs with trigger `schedule` as `error` with the given
    /// message. Returns how many rows changed.
    fn mark_orphaned_runs(
        &self,
        error: &str,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
