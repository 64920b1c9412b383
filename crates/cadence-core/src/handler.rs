//! Step handler contract and the action registry.
//!
//! Every non-control action (`http.get`, `file.write`, `notify`, ...) is
//! executed by a [`StepHandler`] looked up by action name. Handlers receive
//! fully resolved params and return data only through [`HandlerResult`];
//! they never see the execution context.
//!
//! Object safety follows the usual pattern:
//! 1. [`StepHandler`] uses RPITIT for ergonomic implementations
//! 2. [`StepHandlerDyn`] is the object-safe twin with boxed futures
//! 3. a blanket impl bridges the two, and the registry stores `Arc<dyn StepHandlerDyn>`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// Options passed alongside resolved params.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// The step allows operator interaction and the run is attended.
    pub interactive: bool,
}

/// Success or failure as reported by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Success,
    Error,
}

/// The `{status, output?, error?, exitCode?}` result of a handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult {
    pub status: HandlerStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl HandlerResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: HandlerStatus::Success,
            output: Some(output),
            error: None,
            exit_code: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Error,
            output: None,
            error: Some(error.into()),
            exit_code: None,
        }
    }

    /// Attach output to a result (useful for failures that still carry data).
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == HandlerStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// External implementation of one action family.
pub trait StepHandler: Send + Sync {
    /// Execute `action` with resolved params.
    fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        opts: HandlerOptions,
    ) -> impl Future<Output = HandlerResult> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        action: &'a str,
        params: &'a Map<String, Value>,
        opts: HandlerOptions,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        action: &'a str,
        params: &'a Map<String, Value>,
        opts: HandlerOptions,
    ) -> Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(self.execute(action, params, opts))
    }
}

// ---------------------------------------------------------------------------
// Prompter
// ---------------------------------------------------------------------------

/// A question posed by the `prompt` built-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub step_id: String,
    pub message: String,
    pub default: Option<String>,
    /// When non-empty, the answer must be one of these.
    pub choices: Vec<String>,
}

/// Asks the operator a question. Blocking; the engine calls it from a
/// blocking task.
pub trait Prompter: Send + Sync {
    fn prompt(&self, request: &PromptRequest) -> Result<String, String>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Capability-indexed set of handlers keyed by action name.
///
/// Lookup tries the exact action first, then its family prefix: a handler
/// registered for `http` serves `http.get`, `http.post`, ...
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact action name or an action family.
    pub fn register<H: StepHandler + 'static>(&mut self, action: impl Into<String>, handler: H) {
        self.handlers.insert(action.into(), Arc::new(handler));
    }

    /// Register an already shared handler under another name.
    pub fn register_shared(&mut self, action: impl Into<String>, handler: Arc<dyn StepHandlerDyn>) {
        self.handlers.insert(action.into(), handler);
    }

    /// Builder-style registration.
    pub fn with<H: StepHandler + 'static>(mut self, action: impl Into<String>, handler: H) -> Self {
        self.register(action, handler);
        self
    }

    pub fn lookup(&self, action: &str) -> Option<&Arc<dyn StepHandlerDyn>> {
        self.handlers.get(action).or_else(|| {
            action
                .split_once('.')
                .and_then(|(family, _)| self.handlers.get(family))
        })
    }

    pub fn contains(&self, action: &str) -> bool {
        self.lookup(action).is_some()
    }

    /// Registered names, sorted.
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Dispatch an action. Unknown actions are reported as handler failures.
    pub async fn dispatch(
        &self,
        action: &str,
        params: &Map<String, Value>,
        opts: HandlerOptions,
    ) -> HandlerResult {
        match self.lookup(action) {
            Some(handler) => handler.execute_boxed(action, params, opts).await,
            None => HandlerResult::failure(format!("no handler registered for action '{action}'")),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl StepHandler for Echo {
        async fn execute(
            &self,
            action: &str,
            params: &Map<String, Value>,
            opts: HandlerOptions,
        ) -> HandlerResult {
            HandlerResult::success(json!({
                "action": action,
                "params": params,
                "interactive": opts.interactive,
            }))
        }
    }

    #[tokio::test]
    async fn test_exact_and_family_lookup() {
        let registry = HandlerRegistry::new().with("http", Echo).with("notify", Echo);
        assert!(registry.contains("http.get"));
        assert!(registry.contains("notify"));
        assert!(!registry.contains("file.read"));

        let mut params = Map::new();
        params.insert("url".into(), json!("https://example.com"));
        let result = registry
            .dispatch("http.get", &params, HandlerOptions { interactive: true })
            .await;
        assert!(result.is_success());
        let output = result.output.unwrap();
        assert_eq!(output["action"], "http.get");
        assert_eq!(output["params"]["url"], "https://example.com");
        assert_eq!(output["interactive"], true);
    }

    #[tokio::test]
    async fn test_unknown_action_is_failure() {
        let registry = HandlerRegistry::new();
        let result = registry
            .dispatch("git.status", &Map::new(), HandlerOptions::default())
            .await;
        assert_eq!(result.status, HandlerStatus::Error);
        assert!(result.error.unwrap().contains("git.status"));
    }

    #[test]
    fn test_actions_sorted() {
        let registry = HandlerRegistry::new().with("notify", Echo).with("file", Echo);
        assert_eq!(registry.actions(), vec!["file", "notify"]);
    }
}
