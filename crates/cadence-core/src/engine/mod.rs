//! Preset execution engine.
//!
//! [`Engine::run`] walks a validated [`StepGraph`] with a pointer that starts
//! at the first sequential step. Each step's params are resolved against the
//! run's [`ExecutionContext`], control actions are interpreted in-engine and
//! everything else is dispatched to the [`HandlerRegistry`]. The outcome is
//! folded through the step's `onError` policy, recorded once in the context
//! and reported to a [`RunObserver`].
//!
//! # Flow
//!
//! 1. Validate the preset and bind variables (fatal before any step).
//! 2. Report run start.
//! 3. Per step: execute, settle policy, record, advance (or jump for `if`).
//! 4. Report run finish with `success`, `error` or `cancelled`.
//!
//! Step-level failures never escape as errors; only preset validation and
//! observer (store) failures do.

mod builtins;
pub mod context;
mod groups;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_types::config::EngineConfig;
use cadence_types::error::RepositoryError;
use cadence_types::preset::{OnError, Preset, Step};
use cadence_types::run::{Run, RunStatus, RunTrigger, StepResult, StepStatus};
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::expression;
use crate::handler::{HandlerOptions, HandlerRegistry, HandlerResult, Prompter};
use crate::preset::vars::bind_variables;
use crate::preset::{ControlAction, PresetError, StepGraph};
use crate::recorder::RunObserver;

pub use context::{cap_output, env_snapshot, ExecutionContext, MAX_STEP_OUTPUT_SIZE};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default timeout for the `shell` built-in (5 minutes).
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 300;

/// Default `while` iteration cap.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that end a run before or outside step execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Preset(#[from] PresetError),

    #[error("store error: {0}")]
    Store(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Settings and options
// ---------------------------------------------------------------------------

/// Engine-wide limits.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub shell_timeout: Duration,
    pub max_iterations: u32,
    pub max_output_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            shell_timeout: Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_output_bytes: MAX_STEP_OUTPUT_SIZE,
        }
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            shell_timeout: Duration::from_secs(config.shell_timeout_secs),
            max_iterations: config.max_iterations.max(1),
            max_output_bytes: config.max_step_output_bytes,
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub task_id: Option<Uuid>,
    pub trigger: RunTrigger,
    /// Evaluate control flow without calling handlers or spawning shells.
    pub dry_run: bool,
    /// An operator is attached; `prompt` may ask questions.
    pub interactive: bool,
    /// Values bound to the `env` expression root.
    pub env: Map<String, Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            trigger: RunTrigger::Manual,
            dry_run: false,
            interactive: false,
            env: Map::new(),
        }
    }
}

impl RunOptions {
    /// A manual run seeing the process environment.
    pub fn manual() -> Self {
        Self {
            env: env_snapshot(),
            ..Self::default()
        }
    }

    /// A daemon-triggered run of a task.
    pub fn scheduled(task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            trigger: RunTrigger::Schedule,
            env: env_snapshot(),
            ..Self::default()
        }
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }
}

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

/// What executing one step produced, before `onError` is applied.
#[derive(Debug, Clone)]
pub(crate) struct StepOutcome {
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    /// Variables to merge into the parent context on success.
    pub var_updates: Map<String, Value>,
    pub cancelled: bool,
}

impl StepOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            exit_code: None,
            var_updates: Map::new(),
            cancelled: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            output: None,
            error: Some(error.into()),
            exit_code: None,
            var_updates: Map::new(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::failure("cancelled")
        }
    }

    pub fn from_handler(result: HandlerResult) -> Self {
        let status = if result.is_success() {
            StepStatus::Success
        } else {
            StepStatus::Error
        };
        Self {
            status,
            output: result.output,
            error: match status {
                StepStatus::Error => Some(
                    result
                        .error
                        .unwrap_or_else(|| "handler reported an error".to_string()),
                ),
                _ => None,
            },
            exit_code: result.exit_code,
            var_updates: Map::new(),
            cancelled: false,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_vars(mut self, updates: Map<String, Value>) -> Self {
        self.var_updates = updates;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Whether execution continues after a settled step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop(String),
    Cancelled,
}

/// Apply a step's `onError` policy to its outcome.
pub(crate) fn settle(
    step: &Step,
    outcome: StepOutcome,
    duration: Duration,
    max_output_bytes: usize,
) -> (StepResult, Flow, Map<String, Value>) {
    let output = outcome
        .output
        .map(|o| cap_output(&step.id, o, max_output_bytes));
    let mut result = StepResult {
        step_id: step.id.clone(),
        status: outcome.status,
        duration_ms: duration.as_millis() as u64,
        output,
        error: outcome.error,
        exit_code: outcome.exit_code,
    };

    if outcome.cancelled {
        result.status = StepStatus::Error;
        return (result, Flow::Cancelled, Map::new());
    }
    if outcome.status != StepStatus::Error {
        return (result, Flow::Continue, outcome.var_updates);
    }

    match step.on_error {
        OnError::Stop => {
            let message = format!(
                "step '{}' failed: {}",
                step.id,
                result.error.as_deref().unwrap_or("unknown error")
            );
            (result, Flow::Stop(message), Map::new())
        }
        OnError::Continue => (result, Flow::Continue, Map::new()),
        OnError::Skip => {
            tracing::debug!(
                step_id = step.id.as_str(),
                error = result.error.as_deref().unwrap_or(""),
                "step failed, marking skipped"
            );
            result.status = StepStatus::Skipped;
            result.error = None;
            (result, Flow::Continue, Map::new())
        }
    }
}

fn dry_run_output(action: &str, params: &Map<String, Value>) -> Value {
    json!({
        "dryRun": true,
        "action": action,
        "params": params,
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs presets. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<HandlerRegistry>,
    prompter: Option<Arc<dyn Prompter>>,
    settings: Arc<EngineSettings>,
}

impl Engine {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            prompter: None,
            settings: Arc::new(EngineSettings::default()),
        }
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Execute a preset from its first step to completion.
    pub async fn run<O: RunObserver>(
        &self,
        preset: &Preset,
        overrides: &Map<String, Value>,
        options: RunOptions,
        observer: &O,
        cancel: &CancellationToken,
    ) -> Result<Run, EngineError> {
        let graph = StepGraph::build(preset)?;
        let vars = bind_variables(preset, overrides)?;

        let mut run = Run::start(&preset.name, options.task_id, options.trigger);
        tracing::info!(
            run_id = %run.id,
            preset = preset.name.as_str(),
            trigger = %run.trigger,
            dry_run = options.dry_run,
            "run started"
        );
        observer.run_started(&run).await?;

        let invocation = Invocation {
            engine: self.clone(),
            dry_run: options.dry_run,
            interactive: options.interactive,
            cancel: cancel.clone(),
        };
        let mut ctx = ExecutionContext::new(vars, options.env);
        let mut pointer = graph.entry();
        let mut dropped = vec![false; graph.len()];
        let mut final_status = RunStatus::Success;
        let mut run_error = None;

        while let Some(idx) = pointer {
            if cancel.is_cancelled() {
                final_status = RunStatus::Cancelled;
                run_error = Some("cancelled".to_string());
                break;
            }

            let step = graph.step(idx);
            let started = Instant::now();
            let mut next = None;

            let outcome = match ControlAction::parse(&step.action) {
                Some(ControlAction::If) => {
                    let (outcome, decision) = builtins::branch(step, &ctx.scope());
                    if let Some(untaken) = decision.untaken.and_then(|t| graph.position(&t)) {
                        dropped[untaken] = true;
                    }
                    next = decision.target.and_then(|t| graph.position(&t));
                    outcome
                }
                Some(ControlAction::Parallel) => {
                    let members: Vec<Step> =
                        graph.parallel_members(step).into_iter().cloned().collect();
                    let group = groups::parallel(&invocation, step, members, &ctx).await;
                    for (member, outcome, elapsed) in group.members {
                        let (result, _, _) =
                            settle(&member, outcome, elapsed, self.settings.max_output_bytes);
                        self.record(&mut run, &mut ctx, observer, result).await?;
                    }
                    group.outcome
                }
                _ => invocation.execute(step.clone(), ctx.clone()).await,
            };

            let (result, flow, var_updates) =
                settle(step, outcome, started.elapsed(), self.settings.max_output_bytes);
            tracing::debug!(
                run_id = %run.id,
                step_id = step.id.as_str(),
                status = %result.status,
                duration_ms = result.duration_ms,
                "step finished"
            );
            ctx.merge_vars(var_updates);
            self.record(&mut run, &mut ctx, observer, result).await?;

            match flow {
                Flow::Continue => {
                    pointer = next.or_else(|| next_in_sequence(&graph, idx, &dropped));
                }
                Flow::Stop(message) => {
                    final_status = RunStatus::Error;
                    run_error = Some(message);
                    break;
                }
                Flow::Cancelled => {
                    final_status = RunStatus::Cancelled;
                    run_error = Some("cancelled".to_string());
                    break;
                }
            }
        }

        run.finish(final_status, run_error);
        tracing::info!(
            run_id = %run.id,
            preset = preset.name.as_str(),
            status = %run.status,
            steps = run.step_results.len(),
            duration_ms = run.duration_ms().unwrap_or_default(),
            "run finished"
        );
        observer.run_finished(&run).await?;
        Ok(run)
    }

    async fn record<O: RunObserver>(
        &self,
        run: &mut Run,
        ctx: &mut ExecutionContext,
        observer: &O,
        result: StepResult,
    ) -> Result<(), EngineError> {
        ctx.record(&result);
        let seq = run.step_results.len() as u32;
        observer.step_finished(run.id, seq, &result).await?;
        run.step_results.push(result);
        Ok(())
    }
}

/// Positional successor of `idx`, passing over targets dropped by an `if`.
fn next_in_sequence(graph: &StepGraph, idx: usize, dropped: &[bool]) -> Option<usize> {
    let mut next = graph.next_sequential(idx);
    while let Some(j) = next {
        if !dropped[j] {
            break;
        }
        next = graph.next_sequential(j);
    }
    next
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("prompter", &self.prompter.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything a single step needs, owned so it can move into spawned tasks.
#[derive(Clone)]
pub(crate) struct Invocation {
    pub engine: Engine,
    pub dry_run: bool,
    pub interactive: bool,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn settings(&self) -> &EngineSettings {
        &self.engine.settings
    }

    /// Execute one non-branching step against a read view of the context.
    pub fn execute(&self, step: Step, ctx: ExecutionContext) -> BoxFuture<'static, StepOutcome> {
        let this = self.clone();
        Box::pin(async move {
            let control = ControlAction::parse(&step.action);
            match control {
                Some(ControlAction::ForEach) => return groups::for_each(&this, &step, &ctx).await,
                Some(ControlAction::While) => return groups::while_loop(&this, &step, ctx).await,
                Some(ControlAction::If | ControlAction::Parallel) => {
                    return StepOutcome::failure(format!(
                        "'{}' cannot run inside a group or loop",
                        step.action
                    ));
                }
                _ => {}
            }

            let params = match expression::resolve_params(&step.params, &ctx.scope()) {
                Ok(params) => params,
                Err(e) => return StepOutcome::failure(e.to_string()),
            };

            match control {
                Some(ControlAction::Set) => builtins::set(params),
                Some(ControlAction::Log) => builtins::log(&step, params),
                Some(ControlAction::Prompt) => builtins::prompt(&this, &step, params).await,
                Some(ControlAction::Shell) => builtins::shell(&this, &step, params).await,
                _ => this.dispatch(&step, params).await,
            }
        })
    }

    async fn dispatch(&self, step: &Step, params: Map<String, Value>) -> StepOutcome {
        let registry = Arc::clone(&self.engine.registry);
        if self.dry_run {
            if !registry.contains(&step.action) {
                return StepOutcome::failure(format!(
                    "no handler registered for action '{}'",
                    step.action
                ));
            }
            return StepOutcome::success(dry_run_output(&step.action, &params));
        }

        let opts = HandlerOptions {
            interactive: step.interactive && self.interactive,
        };
        tokio::select! {
            result = registry.dispatch(&step.action, &params, opts) => StepOutcome::from_handler(result),
            _ = self.cancel.cancelled() => StepOutcome::cancelled(),
        }
    }
}

#[cfg(test)]
mod tests;
