//! In-memory store and scripted handlers for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, RunStatus, RunTrigger, StepResult};
use cadence_types::task::Task;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::handler::{HandlerOptions, HandlerResult, StepHandler};
use crate::repository::{RunRepository, TaskRepository};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    runs: HashMap<Uuid, Run>,
    results: HashMap<Uuid, Vec<(u32, StepResult)>>,
}

/// Shared in-memory implementation of both repositories.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    fail: Arc<AtomicBool>,
    steal: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Make every write fail with a query error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Act as a second daemon: every task handed out by `list_due` has its
    /// `next_run_at` advanced right after, so the caller's claim loses.
    pub fn steal_due_tasks(&self, steal: bool) {
        self.steal.store(steal, Ordering::SeqCst);
    }

    pub fn run_count(&self) -> usize {
        self.inner.lock().unwrap().runs.len()
    }

    pub fn runs(&self) -> Vec<Run> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.id);
        runs
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(RepositoryError::Query("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl TaskRepository for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.tasks.values().any(|t| t.name == task.name) {
            return Err(RepositoryError::Conflict(format!("task '{}' exists", task.name)));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>, RepositoryError> {
        Ok(self.inner.lock().unwrap().tasks.get(id).cloned())
    }

    async fn get_task_by_name(&self, name: &str) -> Result<Option<Task>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .find(|t| t.name == name)
            .cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, RepositoryError> {
        let mut tasks: Vec<Task> = self.inner.lock().unwrap().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    async fn set_enabled(
        &self,
        id: &Uuid,
        enabled: bool,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let task = inner.tasks.get_mut(id).ok_or(RepositoryError::NotFound)?;
        task.enabled = enabled;
        task.next_run_at = next_run_at;
        Ok(())
    }

    async fn delete_task(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.inner.lock().unwrap().tasks.remove(id).is_some())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Task>, RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let mut due: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_run_at);
        if self.steal.load(Ordering::SeqCst) {
            for task in &due {
                if let Some(stored) = inner.tasks.get_mut(&task.id) {
                    stored.next_run_at = now + chrono::Duration::hours(1);
                }
            }
        }
        Ok(due)
    }

    async fn claim(
        &self,
        id: &Uuid,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(id) {
            Some(task) if task.next_run_at == observed => {
                task.next_run_at = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        id: &Uuid,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(id) else {
            return Ok(false);
        };
        task.last_run_at = Some(last_run_at);
        if task.next_run_at == observed {
            task.next_run_at = next;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl RunRepository for MemoryStore {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.check()?;
        let mut stored = run.clone();
        stored.step_results.clear();
        self.inner.lock().unwrap().runs.insert(run.id, stored);
        Ok(())
    }

    async fn append_step_result(
        &self,
        run_id: &Uuid,
        seq: u32,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        self.check()?;
        self.inner
            .lock()
            .unwrap()
            .results
            .entry(*run_id)
            .or_default()
            .push((seq, result.clone()));
        Ok(())
    }

    async fn finish_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.runs.get_mut(&run.id).ok_or(RepositoryError::NotFound)?;
        stored.status = run.status;
        stored.error = run.error.clone();
        stored.finished_at = run.finished_at;
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.runs.get(id).map(|run| {
            let mut run = run.clone();
            let mut results = inner.results.get(id).cloned().unwrap_or_default();
            results.sort_by_key(|(seq, _)| *seq);
            run.step_results = results.into_iter().map(|(_, r)| r).collect();
            run
        }))
    }

    async fn list_runs(&self, task_id: Option<&Uuid>, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| task_id.is_none_or(|id| r.task_id.as_ref() == Some(id)))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_step_results(&self, run_id: &Uuid) -> Result<Vec<StepResult>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let mut results = inner.results.get(run_id).cloned().unwrap_or_default();
        results.sort_by_key(|(seq, _)| *seq);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    async fn mark_orphaned_runs(&self, error: &str) -> Result<u64, RepositoryError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        let mut changed = 0;
        for run in inner.runs.values_mut() {
            if run.status == RunStatus::Running && run.trigger == RunTrigger::Schedule {
                run.status = RunStatus::Error;
                run.error = Some(error.to_string());
                run.finished_at = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Handler that returns canned results per action and logs every call.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    responses: Arc<Mutex<HashMap<String, HandlerResult>>>,
    calls: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
}

impl ScriptedHandler {
    pub fn respond(self, action: &str, result: HandlerResult) -> Self {
        self.responses.lock().unwrap().insert(action.to_string(), result);
        self
    }

    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|(a, _)| a).collect()
    }
}

impl StepHandler for ScriptedHandler {
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        _opts: HandlerOptions,
    ) -> HandlerResult {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), params.clone()));
        self.responses
            .lock()
            .unwrap()
            .get(action)
            .cloned()
            .unwrap_or_else(|| HandlerResult::success(Value::Object(params.clone())))
    }
}

/// Handler that sleeps and tracks how many calls overlap.
#[derive(Clone, Default)]
pub struct SlowHandler {
    pub delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl StepHandler for SlowHandler {
    async fn execute(
        &self,
        _action: &str,
        params: &Map<String, Value>,
        _opts: HandlerOptions,
    ) -> HandlerResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);

        if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return HandlerResult::failure("asked to fail");
        }
        HandlerResult::success(Value::Object(params.clone()))
    }
}
