//! Run observation and persistence.
//!
//! The engine reports progress to a [`RunObserver`]: once when the run
//! starts, once per recorded step result, and once when the run reaches a
//! terminal status. [`Recorder`] is the observer that writes those events
//! through a [`RunRepository`]. An observer error aborts the run.

use std::future::Future;

use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, StepResult};
use uuid::Uuid;

use crate::repository::RunRepository;

/// Receives run lifecycle events from the engine.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, run: &Run) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn step_finished(
        &self,
        run_id: Uuid,
        seq: u32,
        result: &StepResult,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn run_finished(&self, run: &Run) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    async fn run_started(&self, _run: &Run) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn step_finished(
        &self,
        _run_id: Uuid,
        _seq: u32,
        _result: &StepResult,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn run_finished(&self, _run: &Run) -> Result<(), RepositoryError> {
        Ok(())
    }
}

impl<T: RunObserver> RunObserver for &T {
    async fn run_started(&self, run: &Run) -> Result<(), RepositoryError> {
        (**self).run_started(run).await
    }

    async fn step_finished(
        &self,
        run_id: Uuid,
        seq: u32,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        (**self).step_finished(run_id, seq, result).await
    }

    async fn run_finished(&self, run: &Run) -> Result<(), RepositoryError> {
        (**self).run_finished(run).await
    }
}

/// Fan events out to two observers, first `A` then `B`.
impl<A: RunObserver, B: RunObserver> RunObserver for (A, B) {
    async fn run_started(&self, run: &Run) -> Result<(), RepositoryError> {
        self.0.run_started(run).await?;
        self.1.run_started(run).await
    }

    async fn step_finished(
        &self,
        run_id: Uuid,
        seq: u32,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        self.0.step_finished(run_id, seq, result).await?;
        self.1.step_finished(run_id, seq, result).await
    }

    async fn run_finished(&self, run: &Run) -> Result<(), RepositoryError> {
        self.0.run_finished(run).await?;
        self.1.run_finished(run).await
    }
}

/// Persists runs and step results as they happen.
#[derive(Debug, Clone)]
pub struct Recorder<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> Recorder<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }
}

impl<R: RunRepository> RunObserver for Recorder<R> {
    async fn run_started(&self, run: &Run) -> Result<(), RepositoryError> {
        self.repo.create_run(run).await
    }

    async fn step_finished(
        &self,
        run_id: Uuid,
        seq: u32,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        self.repo.append_step_result(&run_id, seq, result).await
    }

    async fn run_finished(&self, run: &Run) -> Result<(), RepositoryError> {
        self.repo.finish_run(run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use cadence_types::run::{RunStatus, RunTrigger, StepStatus};

    #[tokio::test]
    async fn test_recorder_persists_lifecycle() {
        let store = MemoryStore::default();
        let recorder = Recorder::new(store.clone());

        let mut run = Run::start("digest", None, RunTrigger::Manual);
        recorder.run_started(&run).await.unwrap();

        let result = StepResult {
            step_id: "a".into(),
            status: StepStatus::Success,
            duration_ms: 1,
            output: None,
            error: None,
            exit_code: None,
        };
        recorder.step_finished(run.id, 0, &result).await.unwrap();

        run.step_results.push(result);
        run.finish(RunStatus::Success, None);
        recorder.run_finished(&run).await.unwrap();

        let stored = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.step_results.len(), 1);
    }

    #[tokio::test]
    async fn test_pair_observer_stops_at_first_error() {
        let store = MemoryStore::default();
        store.fail_writes(true);
        let pair = (Recorder::new(store.clone()), NoopObserver);
        let run = Run::start("digest", None, RunTrigger::Manual);
        assert!(pair.run_started(&run).await.is_err());
    }
}
