//! The scheduler daemon's poll loop.
//!
//! `stopped -> running -> stopped`. Each tick lists enabled tasks whose
//! `next_run_at` has passed, claims each one with a compare-and-swap on
//! `next_run_at`, and runs it on its own tokio task. When a run finishes the
//! task is rescheduled from the finish time under the same guard.
//!
//! Store errors during a tick are logged and polling continues. On start,
//! scheduled runs left in `running` by a previous process are marked
//! `error: interrupted`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_types::run::{Run, RunStatus, RunTrigger};
use cadence_types::task::Task;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{Engine, EngineError, RunOptions};
use crate::preset::PresetLocator;
use crate::recorder::Recorder;
use crate::repository::{RunRepository, TaskRepository};

use super::interval::{next_run_after, IntervalSpec};
use super::ScheduleError;

/// Default poll interval.
pub const DEFAULT_TICK_SECS: u64 = 15;

/// Error recorded on runs orphaned by a crash or kill.
pub const INTERRUPTED: &str = "interrupted";

/// Snapshot of a running daemon, persisted in its lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_tick_at: DateTime<Utc>,
    pub in_flight: usize,
}

impl DaemonState {
    pub fn new(pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at: now,
            last_tick_at: now,
            in_flight: 0,
        }
    }

    /// Whether the last heartbeat is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        now - self.last_tick_at > threshold
    }
}

type Heartbeat = Arc<dyn Fn(&DaemonState) + Send + Sync>;

/// Polls for due tasks and runs them.
pub struct Scheduler<T, R> {
    tasks: T,
    runs: R,
    engine: Engine,
    locator: PresetLocator,
    tick: Duration,
    in_flight: Arc<DashMap<Uuid, DateTime<Utc>>>,
    state: Arc<Mutex<DaemonState>>,
    heartbeat: Option<Heartbeat>,
}

impl<T: Clone, R: Clone> Clone for Scheduler<T, R> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            runs: self.runs.clone(),
            engine: self.engine.clone(),
            locator: self.locator.clone(),
            tick: self.tick,
            in_flight: Arc::clone(&self.in_flight),
            state: Arc::clone(&self.state),
            heartbeat: self.heartbeat.clone(),
        }
    }
}

impl<T, R> Scheduler<T, R>
where
    T: TaskRepository + Clone + 'static,
    R: RunRepository + Clone + 'static,
{
    pub fn new(tasks: T, runs: R, engine: Engine, locator: PresetLocator) -> Self {
        Self {
            tasks,
            runs,
            engine,
            locator,
            tick: Duration::from_secs(DEFAULT_TICK_SECS),
            in_flight: Arc::new(DashMap::new()),
            state: Arc::new(Mutex::new(DaemonState::new(std::process::id(), Utc::now()))),
            heartbeat: None,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(10));
        self
    }

    /// Called with the daemon state after every tick.
    pub fn with_heartbeat(mut self, heartbeat: impl Fn(&DaemonState) + Send + Sync + 'static) -> Self {
        self.heartbeat = Some(Arc::new(heartbeat));
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Mark scheduled runs left `running` by a previous process.
    pub async fn recover(&self) -> Result<u64, ScheduleError> {
        let count = self.runs.mark_orphaned_runs(INTERRUPTED).await?;
        if count > 0 {
            tracing::warn!(count, "marked orphaned scheduled runs as interrupted");
        }
        Ok(count)
    }

    /// Poll until `shutdown` is cancelled, then cancel in-flight runs and
    /// wait for them to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ScheduleError> {
        self.recover().await?;

        let runs_cancel = CancellationToken::new();
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(tick_secs = self.tick.as_secs_f64(), "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            while join_set.try_join_next().is_some() {}

            match self.tick_once(Utc::now(), &mut join_set, &runs_cancel).await {
                Ok(0) => {}
                Ok(dispatched) => tracing::debug!(dispatched, "dispatched due tasks"),
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }
            self.beat(Utc::now());
        }

        let pending = join_set.len();
        if pending > 0 {
            tracing::info!(pending, "stopping in-flight runs");
        }
        runs_cancel.cancel();
        while join_set.join_next().await.is_some() {}
        tracing::info!("scheduler stopped");
        Ok(())
    }

    /// One poll: claim and spawn every due task. Returns how many started.
    pub async fn tick_once(
        &self,
        now: DateTime<Utc>,
        join_set: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Result<usize, ScheduleError> {
        let due = self.tasks.list_due(now).await?;
        let mut dispatched = 0;

        for task in due {
            if self.in_flight.contains_key(&task.id) {
                tracing::debug!(task_id = %task.id, "task still running, skipping");
                continue;
            }
            let spec = match IntervalSpec::parse(&task.interval_spec) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "task has an invalid interval");
                    continue;
                }
            };

            let claimed_next = next_run_after(&spec, now);
            if !self.tasks.claim(&task.id, task.next_run_at, claimed_next).await? {
                tracing::debug!(task_id = %task.id, "lost claim on task");
                continue;
            }

            self.in_flight.insert(task.id, now);
            let this = self.clone();
            let cancel = cancel.child_token();
            join_set.spawn(async move {
                this.execute(task, spec, claimed_next, cancel).await;
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn execute(&self, task: Task, spec: IntervalSpec, claimed_next: DateTime<Utc>, cancel: CancellationToken) {
        tracing::info!(task_id = %task.id, task = task.name.as_str(), "running scheduled task");

        match self.run_task(&task, &cancel).await {
            Ok(run) => tracing::info!(
                task_id = %task.id,
                run_id = %run.id,
                status = %run.status,
                "scheduled run finished"
            ),
            Err(e) => tracing::error!(task_id = %task.id, error = %e, "scheduled run failed"),
        }

        let finished = Utc::now();
        let next = next_run_after(&spec, finished);
        match self.tasks.reschedule(&task.id, claimed_next, next, finished).await {
            Ok(true) => tracing::debug!(task_id = %task.id, next_run_at = %next, "task rescheduled"),
            Ok(false) => tracing::debug!(task_id = %task.id, "task changed during run, keeping its schedule"),
            Err(e) => tracing::error!(task_id = %task.id, error = %e, "failed to reschedule task"),
        }
        self.in_flight.remove(&task.id);
    }

    async fn run_task(&self, task: &Task, cancel: &CancellationToken) -> Result<Run, ScheduleError> {
        let preset = match self.locator.load(&task.preset_ref) {
            Ok(preset) => preset,
            Err(e) => return self.record_failure(task, e.to_string()).await,
        };
        let recorder = Recorder::new(self.runs.clone());
        match self
            .engine
            .run(
                &preset,
                &task.var_overrides,
                RunOptions::scheduled(task.id),
                &recorder,
                cancel,
            )
            .await
        {
            Ok(run) => Ok(run),
            Err(EngineError::Preset(e)) => self.record_failure(task, e.to_string()).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a run that failed before its first step so it shows in history.
    async fn record_failure(&self, task: &Task, error: String) -> Result<Run, ScheduleError> {
        let mut run = Run::start(&task.preset_ref, Some(task.id), RunTrigger::Schedule);
        self.runs.create_run(&run).await?;
        run.finish(RunStatus::Error, Some(error));
        self.runs.finish_run(&run).await?;
        Ok(run)
    }

    fn beat(&self, now: DateTime<Utc>) {
        let snapshot = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.last_tick_at = now;
            state.in_flight = self.in_flight.len();
            state.clone()
        };
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat(&snapshot);
        }
    }
}
