//! Preset domain types for Cadence.
//!
//! A preset is a declarative automation workflow: typed variables plus an
//! ordered list of steps. The list order gives the default control flow, while
//! `if` steps jump by id and `forEach`/`while`/`parallel` steps reference or
//! embed other steps. Presets are authored as JSON or YAML.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Preset
// ---------------------------------------------------------------------------

/// A named automation workflow loaded from a preset file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    /// Format discriminator (e.g. "cadence/preset@1").
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Human-readable preset name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// How the preset is meant to be started.
    #[serde(default)]
    pub trigger: Trigger,
    /// Declared variables, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, VarDef>,
    /// Ordered step list.
    pub steps: Vec<Step>,
}

/// How a preset is triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Run explicitly from the CLI.
    #[default]
    Manual,
    /// Suggested recurring schedule (e.g. "every 15 minutes").
    Schedule { interval: String },
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Declaration of a preset variable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VarDef {
    #[serde(rename = "type")]
    pub var_type: VarType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// The value type of a preset variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Number,
    Boolean,
    /// Any type name not listed above. Rejected by preset validation.
    #[serde(other)]
    #[schemars(skip)]
    Unknown,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::String => write!(f, "string"),
            VarType::Number => write!(f, "number"),
            VarType::Boolean => write!(f, "boolean"),
            VarType::Unknown => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One action within a preset.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the preset. Letters, digits, `-` and `_`.
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Action name: a control action (`if`, `set`, `forEach`, ...) or a
    /// registered handler (`http.get`, `file.read`, ...).
    pub action: String,
    /// Parameters; string values may contain `{{ }}` placeholders.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub on_error: OnError,
    /// Whether the handler may interact with the operator.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interactive: bool,
    /// Condition for `if` and `while`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step id to jump to when an `if` condition is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<String>,
    /// Step id to jump to when an `if` condition is false.
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<String>,
    /// Loop body for `forEach` and `while`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Box<StepRef>>,
}

impl Step {
    /// Name for display, falling back to the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A loop body: either the id of a declared step or an inline step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StepRef {
    Id(String),
    Inline(Step),
}

/// Per-step failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Record the failure and end the run with status `error`.
    #[default]
    Stop,
    /// Record the failure and keep going.
    Continue,
    /// Record the step as skipped and keep going.
    Skip,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnError::Stop => write!(f, "stop"),
            OnError::Continue => write!(f, "continue"),
            OnError::Skip => write!(f, "skip"),
        }
    }
}
