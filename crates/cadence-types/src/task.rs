//! Scheduled task types.
//!
//! A task binds a preset (plus variable overrides) to a recurring interval.
//! The scheduler daemon owns `next_run_at`; explicit enable/disable/delete
//! operations are the only other writers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A persisted recurring binding of a preset to a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// UUIDv7 task ID.
    pub id: Uuid,
    /// Unique task name.
    pub name: String,
    /// Preset file path or preset name.
    pub preset_ref: String,
    /// Normalized interval specification (e.g. "every 15 minutes").
    pub interval_spec: String,
    /// Variable overrides applied on every run.
    #[serde(default)]
    pub var_overrides: Map<String, Value>,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether the task should be picked up by a poll at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }
}
