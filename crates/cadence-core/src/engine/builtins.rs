//! Built-in actions interpreted by the engine: `if`, `set`, `log`, `prompt`
//! and `shell`.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::preset::Step;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use crate::expression::{self, value_to_string};
use crate::handler::PromptRequest;

use super::{dry_run_output, Invocation, StepOutcome};

/// Read a positive integer param given as a number or a numeric string.
pub(crate) fn param_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Where an `if` sends the run.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct BranchDecision {
    /// Step to jump to; `None` advances in sequence.
    pub target: Option<String>,
    /// The other branch's target, dropped from this run once the jump is
    /// taken. Only set when both branches name a target.
    pub untaken: Option<String>,
}

/// Evaluate an `if` step. Returns the outcome and where to go next.
pub(crate) fn branch(step: &Step, scope: &Value) -> (StepOutcome, BranchDecision) {
    let condition = step.condition.as_deref().unwrap_or_default();
    match expression::evaluate_condition(condition, scope) {
        Ok(flag) => {
            let (branch, target, other) = if flag {
                ("then", step.then.clone(), step.otherwise.clone())
            } else {
                ("else", step.otherwise.clone(), step.then.clone())
            };
            tracing::debug!(
                step_id = step.id.as_str(),
                condition = flag,
                target = target.as_deref().unwrap_or("<next>"),
                "branch evaluated"
            );
            let output = json!({
                "condition": flag,
                "branch": branch,
                "target": target,
            });
            let untaken = match (&target, other) {
                (Some(taken), Some(other)) if *taken != other => Some(other),
                _ => None,
            };
            (StepOutcome::success(output), BranchDecision { target, untaken })
        }
        Err(e) => (StepOutcome::failure(e.to_string()), BranchDecision::default()),
    }
}

/// `set`: merge resolved params into `vars`.
pub(crate) fn set(params: Map<String, Value>) -> StepOutcome {
    StepOutcome::success(Value::Object(params.clone())).with_vars(params)
}

/// `log`: emit a message at the requested level.
pub(crate) fn log(step: &Step, params: Map<String, Value>) -> StepOutcome {
    let message = params.get("message").map(value_to_string).unwrap_or_default();
    let level = param_str(&params, "level").unwrap_or("info").to_ascii_lowercase();
    let step_id = step.id.as_str();

    match level.as_str() {
        "trace" => tracing::trace!(step_id, "{message}"),
        "debug" => tracing::debug!(step_id, "{message}"),
        "info" => tracing::info!(step_id, "{message}"),
        "warn" | "warning" => tracing::warn!(step_id, "{message}"),
        "error" => tracing::error!(step_id, "{message}"),
        other => {
            return StepOutcome::failure(format!("unknown log level '{other}'"));
        }
    }

    StepOutcome::success(json!({ "message": message, "level": level }))
}

/// `prompt`: ask the operator, or fall back to `default` when unattended.
pub(crate) async fn prompt(
    inv: &Invocation,
    step: &Step,
    params: Map<String, Value>,
) -> StepOutcome {
    let Some(message) = param_str(&params, "message").map(str::to_string) else {
        return StepOutcome::failure("'prompt' requires a 'message' param");
    };
    let default = params
        .get("default")
        .filter(|v| !v.is_null())
        .map(value_to_string);
    let choices: Vec<String> = params
        .get("choices")
        .and_then(Value::as_array)
        .map(|list| list.iter().map(value_to_string).collect())
        .unwrap_or_default();

    if inv.dry_run {
        return StepOutcome::success(dry_run_output(&step.action, &params));
    }

    let answer = match (&inv.engine.prompter, inv.interactive) {
        (Some(prompter), true) => {
            let prompter = Arc::clone(prompter);
            let request = PromptRequest {
                step_id: step.id.clone(),
                message,
                default,
                choices: choices.clone(),
            };
            let task = tokio::task::spawn_blocking(move || prompter.prompt(&request));
            tokio::select! {
                joined = task => match joined {
                    Ok(Ok(answer)) => answer,
                    Ok(Err(e)) => return StepOutcome::failure(format!("prompt failed: {e}")),
                    Err(e) => return StepOutcome::failure(format!("prompt task failed: {e}")),
                },
                _ = inv.cancel.cancelled() => return StepOutcome::cancelled(),
            }
        }
        _ => match default {
            Some(default) => {
                tracing::info!(
                    step_id = step.id.as_str(),
                    "no operator attached, using prompt default"
                );
                default
            }
            None => {
                return StepOutcome::failure(
                    "prompt needs an interactive session or a 'default' param",
                );
            }
        },
    };

    if !choices.is_empty() && !choices.contains(&answer) {
        return StepOutcome::failure(format!(
            "answer '{answer}' is not one of: {}",
            choices.join(", ")
        ));
    }

    let mut updates = Map::new();
    if let Some(var) = param_str(&params, "var") {
        updates.insert(var.to_string(), Value::String(answer.clone()));
    }
    StepOutcome::success(json!({ "answer": answer })).with_vars(updates)
}

/// `shell`: run a command through the platform shell.
///
/// Output is `{stdout, exitCode}` with stdout trimmed. A non-zero exit is a
/// failure carrying stderr. The child is killed on timeout or cancellation.
pub(crate) async fn shell(inv: &Invocation, step: &Step, params: Map<String, Value>) -> StepOutcome {
    let Some(command) = param_str(&params, "command") else {
        return StepOutcome::failure("'shell' requires a 'command' param");
    };
    if inv.dry_run {
        return StepOutcome::success(dry_run_output(&step.action, &params));
    }

    let timeout = param_u64(params.get("timeout"))
        .map(Duration::from_secs)
        .unwrap_or(inv.settings().shell_timeout);

    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    if let Some(cwd) = param_str(&params, "cwd") {
        cmd.current_dir(cwd);
    }
    if let Some(Value::Object(env)) = params.get("env") {
        for (key, value) in env {
            cmd.env(key, value_to_string(value));
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return StepOutcome::failure(format!("failed to spawn shell: {e}")),
    };
    tracing::debug!(step_id = step.id.as_str(), command, "shell started");

    tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let code = output.status.code();
                let value = json!({ "stdout": stdout, "exitCode": code });
                if output.status.success() {
                    StepOutcome::success(value).with_exit_code(code)
                } else {
                    let status = code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
                    StepOutcome::failure(format!("command exited with {status}: {stderr}"))
                        .with_output(value)
                        .with_exit_code(code)
                }
            }
            Ok(Err(e)) => StepOutcome::failure(format!("shell I/O error: {e}")),
            Err(_) => StepOutcome::failure(format!("command timed out after {}s", timeout.as_secs())),
        },
        _ = inv.cancel.cancelled() => StepOutcome::cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::run::StepStatus;

    fn step(value: Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_branch_then_and_else() {
        let s = step(json!({
            "id": "check", "action": "if",
            "condition": "{{ vars.n > 2 }}", "then": "big", "else": "small"
        }));
        let (outcome, decision) = branch(&s, &json!({ "vars": { "n": 5 }, "steps": {}, "env": {} }));
        assert_eq!(decision.target.as_deref(), Some("big"));
        assert_eq!(decision.untaken.as_deref(), Some("small"));
        assert_eq!(outcome.output.unwrap()["branch"], "then");

        let (outcome, decision) = branch(&s, &json!({ "vars": { "n": 1 }, "steps": {}, "env": {} }));
        assert_eq!(decision.target.as_deref(), Some("small"));
        assert_eq!(decision.untaken.as_deref(), Some("big"));
        assert_eq!(outcome.output.unwrap()["condition"], false);
    }

    #[test]
    fn test_branch_without_else_advances() {
        let s = step(json!({ "id": "check", "action": "if", "condition": "vars.flag", "then": "yes" }));
        let (outcome, decision) = branch(&s, &json!({ "vars": { "flag": false }, "steps": {}, "env": {} }));
        assert_eq!(decision, BranchDecision::default());
        assert!(outcome.is_success());
    }

    #[test]
    fn test_branch_fall_through_keeps_other_target() {
        let s = step(json!({ "id": "check", "action": "if", "condition": "vars.ok", "else": "cleanup" }));
        let (_, decision) = branch(&s, &json!({ "vars": { "ok": true }, "steps": {}, "env": {} }));
        assert!(decision.target.is_none());
        assert!(decision.untaken.is_none());
    }

    #[test]
    fn test_set_produces_var_updates() {
        let mut params = Map::new();
        params.insert("count".into(), json!(3));
        let outcome = set(params);
        assert_eq!(outcome.var_updates["count"], 3);
    }

    #[test]
    fn test_log_rejects_unknown_level() {
        let s = step(json!({ "id": "l", "action": "log" }));
        let mut params = Map::new();
        params.insert("message".into(), json!("hi"));
        params.insert("level".into(), json!("loud"));
        assert_eq!(log(&s, params).status, StepStatus::Error);
    }

    #[test]
    fn test_param_u64() {
        assert_eq!(param_u64(Some(&json!(3))), Some(3));
        assert_eq!(param_u64(Some(&json!(" 7 "))), Some(7));
        assert_eq!(param_u64(Some(&json!(-1))), None);
        assert_eq!(param_u64(None), None);
    }
}
