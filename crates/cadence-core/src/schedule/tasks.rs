//! Task operations used by the CLI.
//!
//! Each operation is a synchronous store update on one row. Enable and
//! disable write `enabled` and `next_run_at` together, so they never
//! interleave with the daemon's compare-and-swap claim on the same task.

use cadence_types::run::Run;
use cadence_types::task::Task;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{Engine, RunOptions};
use crate::preset::PresetLocator;
use crate::recorder::{Recorder, RunObserver};
use crate::repository::{RunRepository, TaskRepository};

use super::interval::{next_run_after, IntervalSpec};
use super::ScheduleError;

/// Input for [`TaskService::create`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub preset_ref: String,
    pub interval: String,
    pub var_overrides: Map<String, Value>,
    pub enabled: bool,
}

/// Task CRUD plus run-now and history.
#[derive(Debug, Clone)]
pub struct TaskService<T, R> {
    tasks: T,
    runs: R,
    locator: PresetLocator,
}

impl<T: TaskRepository, R: RunRepository + Clone> TaskService<T, R> {
    pub fn new(tasks: T, runs: R, locator: PresetLocator) -> Self {
        Self {
            tasks,
            runs,
            locator,
        }
    }

    pub fn locator(&self) -> &PresetLocator {
        &self.locator
    }

    /// Create a task after checking its interval and preset reference.
    pub async fn create(&self, new: NewTask) -> Result<Task, ScheduleError> {
        let spec = IntervalSpec::parse(&new.interval)?;
        self.locator.load(&new.preset_ref)?;

        let name = new.name.trim().to_string();
        if self.tasks.get_task_by_name(&name).await?.is_some() {
            return Err(ScheduleError::DuplicateTask(name));
        }

        let now = Utc::now();
        let task = Task {
            id: Uuid::now_v7(),
            name,
            preset_ref: new.preset_ref,
            interval_spec: spec.to_string(),
            var_overrides: new.var_overrides,
            enabled: new.enabled,
            next_run_at: next_run_after(&spec, now),
            created_at: now,
            last_run_at: None,
        };
        self.tasks.create_task(&task).await?;
        tracing::info!(
            task_id = %task.id,
            task = task.name.as_str(),
            interval = task.interval_spec.as_str(),
            next_run_at = %task.next_run_at,
            "task created"
        );
        Ok(task)
    }

    pub async fn list(&self) -> Result<Vec<Task>, ScheduleError> {
        Ok(self.tasks.list_tasks().await?)
    }

    /// Find a task by id or by name.
    pub async fn find(&self, key: &str) -> Result<Task, ScheduleError> {
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(task) = self.tasks.get_task(&id).await? {
                return Ok(task);
            }
        }
        self.tasks
            .get_task_by_name(key)
            .await?
            .ok_or_else(|| ScheduleError::TaskNotFound(key.to_string()))
    }

    /// Enable a task. A disabled task gets a fresh `next_run_at` from now;
    /// an already enabled task is left untouched.
    pub async fn enable(&self, key: &str) -> Result<Task, ScheduleError> {
        let mut task = self.find(key).await?;
        if task.enabled {
            return Ok(task);
        }
        let spec = IntervalSpec::parse(&task.interval_spec)?;
        let next = next_run_after(&spec, Utc::now());
        self.tasks.set_enabled(&task.id, true, next).await?;
        task.enabled = true;
        task.next_run_at = next;
        tracing::info!(task_id = %task.id, next_run_at = %next, "task enabled");
        Ok(task)
    }

    /// Disable a task. Disabling a disabled task changes nothing.
    pub async fn disable(&self, key: &str) -> Result<Task, ScheduleError> {
        let mut task = self.find(key).await?;
        if !task.enabled {
            return Ok(task);
        }
        self.tasks
            .set_enabled(&task.id, false, task.next_run_at)
            .await?;
        task.enabled = false;
        tracing::info!(task_id = %task.id, "task disabled");
        Ok(task)
    }

    pub async fn delete(&self, key: &str) -> Result<Task, ScheduleError> {
        let task = self.find(key).await?;
        if !self.tasks.delete_task(&task.id).await? {
            return Err(ScheduleError::TaskNotFound(key.to_string()));
        }
        tracing::info!(task_id = %task.id, "task deleted");
        Ok(task)
    }

    /// Run a task immediately. The run is persisted, linked to the task,
    /// with trigger `manual`; the task's schedule is not touched.
    pub async fn run_now<O: RunObserver>(
        &self,
        key: &str,
        engine: &Engine,
        options: RunOptions,
        observer: &O,
        cancel: &CancellationToken,
    ) -> Result<Run, ScheduleError> {
        let task = self.find(key).await?;
        let preset = self.locator.load(&task.preset_ref)?;
        let recorder = (Recorder::new(self.runs.clone()), observer);
        let run = engine
            .run(
                &preset,
                &task.var_overrides,
                options.for_task(task.id),
                &recorder,
                cancel,
            )
            .await?;
        Ok(run)
    }

    /// Most recent runs of a task.
    pub async fn history(&self, key: &str, limit: u32) -> Result<(Task, Vec<Run>), ScheduleError> {
        let task = self.find(key).await?;
        let runs = self.runs.list_runs(Some(&task.id), limit).await?;
        Ok((task, runs))
    }
}
