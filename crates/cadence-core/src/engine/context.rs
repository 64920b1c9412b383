//! Per-run execution context.
//!
//! `ExecutionContext` holds the three expression roots: `vars`, `steps` and
//! `env`. Step records are written once per id; loops and fan-out groups work
//! on clones, so an iteration never writes into its parent.

use cadence_types::run::StepResult;
use serde_json::{json, Map, Value};

/// Default cap on a single stored step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Mutable state flowing through one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    vars: Map<String, Value>,
    steps: Map<String, Value>,
    env: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(vars: Map<String, Value>, env: Map<String, Value>) -> Self {
        Self {
            vars,
            steps: Map::new(),
            env,
        }
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Merge variable updates produced by `set` (or a loop containing one).
    pub fn merge_vars(&mut self, updates: Map<String, Value>) {
        self.vars.extend(updates);
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    /// The `{output, status, duration, error}` record of a finished step.
    pub fn step_record(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// Record a finished step. Returns `false` (and leaves the existing
    /// record alone) when the id was already recorded.
    pub fn record(&mut self, result: &StepResult) -> bool {
        if self.steps.contains_key(&result.step_id) {
            tracing::warn!(
                step_id = result.step_id.as_str(),
                "step already recorded in this context, keeping first result"
            );
            return false;
        }
        self.steps.insert(
            result.step_id.clone(),
            json!({
                "output": result.output.clone().unwrap_or(Value::Null),
                "status": result.status.to_string(),
                "duration": result.duration_ms,
                "error": result.error,
            }),
        );
        true
    }

    /// The expression scope: `{vars, steps, env}`.
    pub fn scope(&self) -> Value {
        json!({
            "vars": self.vars,
            "steps": self.steps,
            "env": self.env,
        })
    }
}

/// Snapshot of the process environment as a JSON object.
pub fn env_snapshot() -> Map<String, Value> {
    std::env::vars()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

/// Replace an oversized output with a marker describing its size.
pub fn cap_output(step_id: &str, output: Value, max_bytes: usize) -> Value {
    let size = match serde_json::to_vec(&output) {
        Ok(bytes) => bytes.len(),
        Err(_) => return output,
    };
    if size <= max_bytes {
        return output;
    }
    tracing::warn!(
        step_id,
        size,
        max = max_bytes,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size_bytes": size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::run::StepStatus;

    fn result(id: &str, output: Value) -> StepResult {
        StepResult {
            step_id: id.to_string(),
            status: StepStatus::Success,
            duration_ms: 5,
            output: Some(output),
            error: None,
            exit_code: None,
        }
    }

    #[test]
    fn test_record_is_write_once() {
        let mut ctx = ExecutionContext::default();
        assert!(ctx.record(&result("a", json!(1))));
        assert!(!ctx.record(&result("a", json!(2))));
        assert_eq!(ctx.step_record("a").unwrap()["output"], json!(1));
        assert_eq!(ctx.step_record("a").unwrap()["status"], "success");
    }

    #[test]
    fn test_scope_shape() {
        let mut vars = Map::new();
        vars.insert("n".into(), json!(3));
        let mut env = Map::new();
        env.insert("HOME".into(), json!("/home/ops"));
        let mut ctx = ExecutionContext::new(vars, env);
        ctx.record(&result("fetch", json!({ "ok": true })));

        let scope = ctx.scope();
        assert_eq!(scope["vars"]["n"], 3);
        assert_eq!(scope["env"]["HOME"], "/home/ops");
        assert_eq!(scope["steps"]["fetch"]["output"]["ok"], true);
    }

    #[test]
    fn test_cap_output() {
        let small = json!({ "a": 1 });
        assert_eq!(cap_output("s", small.clone(), 1024), small);

        let big = json!("x".repeat(2048));
        let capped = cap_output("s", big, 1024);
        assert_eq!(capped["_truncated"], true);
        assert_eq!(capped["_original_size_bytes"], 2050);
    }

    #[test]
    fn test_merge_vars_overwrites() {
        let mut ctx = ExecutionContext::default();
        ctx.set_var("a", json!(1));
        let mut updates = Map::new();
        updates.insert("a".into(), json!(2));
        updates.insert("b".into(), json!("x"));
        ctx.merge_vars(updates);
        assert_eq!(ctx.vars()["a"], 2);
        assert_eq!(ctx.vars()["b"], "x");
    }
}
