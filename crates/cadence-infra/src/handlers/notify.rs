//! The `notify` action.
//!
//! Emits a structured notification event on the `cadence::notify` tracing
//! target and hands it to an optional listener (the CLI prints it; the
//! daemon's log file records it).

use std::sync::Arc;

use cadence_core::handler::{HandlerOptions, HandlerResult, StepHandler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// A notification raised by a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub level: String,
    pub sent_at: DateTime<Utc>,
}

type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handler for `notify`.
#[derive(Default, Clone)]
pub struct NotifyHandler {
    listener: Option<Listener>,
}

impl NotifyHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every notification after it is logged.
    pub fn with_listener(mut self, listener: impl Fn(&Notification) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }
}

impl StepHandler for NotifyHandler {
    async fn execute(
        &self,
        _action: &str,
        params: &Map<String, Value>,
        _opts: HandlerOptions,
    ) -> HandlerResult {
        let Some(message) = params.get("message").map(cadence_core::expression::value_to_string) else {
            return HandlerResult::failure("missing required param 'message'");
        };
        let title = params
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("cadence")
            .to_string();
        let level = params
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("info")
            .to_ascii_lowercase();

        let notification = Notification {
            title,
            message,
            level,
            sent_at: Utc::now(),
        };
        match notification.level.as_str() {
            "error" => tracing::error!(target: "cadence::notify", title = notification.title.as_str(), "{}", notification.message),
            "warn" | "warning" => tracing::warn!(target: "cadence::notify", title = notification.title.as_str(), "{}", notification.message),
            _ => tracing::info!(target: "cadence::notify", title = notification.title.as_str(), "{}", notification.message),
        }
        if let Some(listener) = &self.listener {
            listener(&notification);
        }

        match serde_json::to_value(&notification) {
            Ok(output) => HandlerResult::success(output),
            Err(e) => HandlerResult::failure(e.to_string()),
        }
    }
}
