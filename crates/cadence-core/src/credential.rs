//! Credential lookup contract used by HTTP-family handlers.
//!
//! A named credential resolves to the headers it contributes to a request.
//! Storage is someone else's concern; the file-backed implementation lives
//! in cadence-infra.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::expression;

/// Header name to header value.
pub type HeaderContributions = BTreeMap<String, String>;

/// Errors from credential lookup.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("invalid credential '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a credential name to header contributions.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<HeaderContributions, CredentialError>;
}

/// Resolver with no credentials; every lookup is `NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialResolver for NoCredentials {
    fn resolve(&self, name: &str) -> Result<HeaderContributions, CredentialError> {
        Err(CredentialError::NotFound(name.to_string()))
    }
}

/// Resolve a credential value that may reference the environment
/// (`"{{ env.GITHUB_TOKEN }}"`). Only `env` is bound.
pub fn resolve_env_template(
    name: &str,
    template: &str,
    env: &Map<String, Value>,
) -> Result<String, CredentialError> {
    let scope = serde_json::json!({ "vars": {}, "steps": {}, "env": env });
    let value = expression::resolve(template, &scope).map_err(|e| CredentialError::Invalid {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let rendered = expression::value_to_string(&value);
    if rendered.is_empty() {
        return Err(CredentialError::Invalid {
            name: name.to_string(),
            reason: format!("'{template}' resolved to an empty value"),
        });
    }
    Ok(rendered)
}
