//! `http.*` actions backed by reqwest.
//!
//! Params: `url` (required), `method` (for `http.request`), `headers`,
//! `query`, `body` (string bodies are sent as-is, anything else as JSON),
//! `credential`, `timeout` (seconds) and `failOnStatus` (default `true`).
//! Output is `{status, headers, body}` with JSON bodies parsed.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::credential::CredentialResolver;
use cadence_core::expression::value_to_string;
use cadence_core::handler::{HandlerOptions, HandlerResult, StepHandler};
use reqwest::Method;
use serde_json::{json, Map, Value};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Handler for the `http` action family.
pub struct HttpHandler {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialResolver>,
}

impl HttpHandler {
    pub fn new(credentials: Arc<dyn CredentialResolver>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            credentials,
        })
    }

    async fn send(&self, action: &str, params: &Map<String, Value>) -> Result<HandlerResult, String> {
        let method = method_for(action, params)?;
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| "missing required param 'url'".to_string())?;
        let timeout = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_secs(timeout));

        if let Some(query) = params.get("query").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect();
            request = request.query(&pairs);
        }
        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                request = request.header(name.as_str(), value_to_string(value));
            }
        }
        if let Some(name) = params.get("credential").and_then(Value::as_str) {
            let contributions = self.credentials.resolve(name).map_err(|e| e.to_string())?;
            for (header, value) in contributions {
                request = request.header(header, value);
            }
        }
        match params.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(other) => request = request.json(other),
        }

        tracing::debug!(method = %method, url, "sending http request");
        let response = request.send().await.map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let is_json = headers
            .get("content-type")
            .and_then(Value::as_str)
            .is_some_and(|ct| ct.contains("json"));
        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {e}"))?;
        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        let output = json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        });

        let fail_on_status = params
            .get("failOnStatus")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if fail_on_status && !status.is_success() {
            return Ok(HandlerResult::failure(format!("{method} {url} returned {status}")).with_output(output));
        }
        Ok(HandlerResult::success(output))
    }
}

/// The HTTP method for an action, from its suffix or the `method` param.
fn method_for(action: &str, params: &Map<String, Value>) -> Result<Method, String> {
    let verb = match action.split_once('.').map(|(_, verb)| verb) {
        None | Some("request") => params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_string(),
        Some(verb) => verb.to_string(),
    };
    let upper = verb.to_ascii_uppercase();
    match upper.as_str() {
        "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD" | "OPTIONS" => {
            Method::from_bytes(upper.as_bytes()).map_err(|e| e.to_string())
        }
        _ => Err(format!("unsupported http method '{verb}'")),
    }
}

impl StepHandler for HttpHandler {
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        _opts: HandlerOptions,
    ) -> HandlerResult {
        match self.send(action, params).await {
            Ok(result) => result,
            Err(e) => HandlerResult::failure(e),
        }
    }
}
