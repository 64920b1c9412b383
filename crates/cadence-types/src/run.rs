//! Run and step result types.
//!
//! A `Run` is the audit record of one preset execution, on demand or
//! scheduled. It is created when execution starts, finalized once, and never
//! mutated afterward.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Error => write!(f, "error"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => write!(f, "success"),
            StepStatus::Error => write!(f, "error"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StepStatus::Success),
            "error" => Ok(StepStatus::Error),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// `cadence run` or `cadence task run`.
    Manual,
    /// The scheduler daemon.
    Schedule,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTrigger::Manual => write!(f, "manual"),
            RunTrigger::Schedule => write!(f, "schedule"),
        }
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "schedule" => Ok(RunTrigger::Schedule),
            other => Err(format!("invalid run trigger: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step result
// ---------------------------------------------------------------------------

/// Recorded outcome of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One concrete execution of a preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Scheduled task this run belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub preset_name: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Run-level error (failed step message, cancellation, interruption).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Ordered step outcomes.
    #[serde(default)]
    pub step_results: Vec<StepResult>,
}

impl Run {
    /// Start a new run record in `Running` status.
    pub fn start(preset_name: impl Into<String>, task_id: Option<Uuid>, trigger: RunTrigger) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            preset_name: preset_name.into(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            error: None,
            step_results: Vec::new(),
        }
    }

    /// Mark the run terminal.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Look up the recorded result for a step id.
    pub fn result_for(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// Wall-clock duration, if finished.
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display_agree() {
        for status in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Error,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
        assert_eq!("skipped".parse::<StepStatus>().unwrap(), StepStatus::Skipped);
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::start("digest", None, RunTrigger::Manual);
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.status.is_terminal());
        assert!(run.duration_ms().is_none());

        run.finish(RunStatus::Success, None);
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
        assert!(run.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_skipped_result_omits_error_field() {
        let result = StepResult {
            step_id: "flaky".to_string(),
            status: StepStatus::Skipped,
            duration_ms: 3,
            output: None,
            error: None,
            exit_code: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(json.get("error").is_none());
        assert_eq!(json["stepId"], "flaky");
    }
}
