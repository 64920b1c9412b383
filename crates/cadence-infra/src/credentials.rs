//! File-backed credential resolver.
//!
//! Credentials live in `{data_dir}/credentials.toml`:
//!
//! ```toml
//! [credentials.github]
//! type = "bearer"
//! token = "{{ env.GITHUB_TOKEN }}"
//!
//! [credentials.jira]
//! type = "basic"
//! username = "bot@example.com"
//! password = "{{ env.JIRA_TOKEN }}"
//!
//! [credentials.internal]
//! type = "header"
//! name = "X-Internal-Auth"
//! value = "{{ env.INTERNAL_AUTH }}"
//!
//! [credentials.weather]
//! type = "api_key"
//! header = "X-Api-Key"        # optional, this is the default
//! key = "{{ env.WEATHER_KEY }}"
//! ```
//!
//! Values are held as [`SecretString`] and only exposed while rendering the
//! header for a request.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine as _;
use cadence_core::credential::{
    resolve_env_template, CredentialError, CredentialResolver, HeaderContributions,
};
use cadence_core::engine::context::env_snapshot;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};

const DEFAULT_API_KEY_HEADER: &str = "X-Api-Key";

/// One stored credential.
pub enum Credential {
    Bearer { token: SecretString },
    Basic { username: String, password: SecretString },
    Header { name: String, value: SecretString },
    ApiKey { header: String, key: SecretString },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Bearer { .. } => "bearer",
            Self::Basic { .. } => "basic",
            Self::Header { .. } => "header",
            Self::ApiKey { .. } => "api_key",
        };
        f.debug_struct("Credential")
            .field("type", &kind)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawCredential {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Header {
        name: String,
        value: String,
    },
    ApiKey {
        #[serde(default)]
        header: Option<String>,
        key: String,
    },
}

impl From<RawCredential> for Credential {
    fn from(raw: RawCredential) -> Self {
        match raw {
            RawCredential::Bearer { token } => Self::Bearer {
                token: SecretString::from(token),
            },
            RawCredential::Basic { username, password } => Self::Basic {
                username,
                password: SecretString::from(password),
            },
            RawCredential::Header { name, value } => Self::Header {
                name,
                value: SecretString::from(value),
            },
            RawCredential::ApiKey { header, key } => Self::ApiKey {
                header: header.unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
                key: SecretString::from(key),
            },
        }
    }
}

#[derive(Deserialize, Default)]
struct CredentialsFile {
    #[serde(default)]
    credentials: BTreeMap<String, RawCredential>,
}

/// Resolves credentials from `credentials.toml`.
#[derive(Debug, Default)]
pub struct FileCredentialResolver {
    credentials: BTreeMap<String, Credential>,
    env: Option<Map<String, Value>>,
}

impl FileCredentialResolver {
    /// Load credentials from `path`. A missing file yields an empty resolver.
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No credentials file at {}", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(CredentialError::Unavailable(format!(
                    "failed to read {}: {err}",
                    path.display()
                )));
            }
        };
        Self::parse(&content).map_err(|e| {
            CredentialError::Unavailable(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Parse the contents of a credentials file.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let file: CredentialsFile = toml::from_str(content)?;
        let credentials = file
            .credentials
            .into_iter()
            .map(|(name, raw)| (name, Credential::from(raw)))
            .collect();
        Ok(Self {
            credentials,
            env: None,
        })
    }

    /// Resolve `{{ env.X }}` against a fixed environment instead of the
    /// process environment.
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.credentials.keys().map(String::as_str).collect()
    }
}

impl CredentialResolver for FileCredentialResolver {
    fn resolve(&self, name: &str) -> Result<HeaderContributions, CredentialError> {
        let credential = self
            .credentials
            .get(name)
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))?;

        let process_env;
        let env = match &self.env {
            Some(env) => env,
            None => {
                process_env = env_snapshot();
                &process_env
            }
        };
        let render = |secret: &SecretString| resolve_env_template(name, secret.expose_secret(), env);

        let mut headers = HeaderContributions::new();
        match credential {
            Credential::Bearer { token } => {
                headers.insert("Authorization".into(), format!("Bearer {}", render(token)?));
            }
            Credential::Basic { username, password } => {
                let user = resolve_env_template(name, username, env)?;
                let pair = format!("{user}:{}", render(password)?);
                let encoded = base64::engine::general_purpose::STANDARD.encode(pair);
                headers.insert("Authorization".into(), format!("Basic {encoded}"));
            }
            Credential::Header { name: header, value } => {
                headers.insert(header.clone(), render(value)?);
            }
            Credential::ApiKey { header, key } => {
                headers.insert(header.clone(), render(key)?);
            }
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FILE: &str = r#"
[credentials.github]
type = "bearer"
token = "{{ env.GITHUB_TOKEN }}"

[credentials.jira]
type = "basic"
username = "bot"
password = "hunter2"

[credentials.internal]
type = "header"
name = "X-Internal-Auth"
value = "static-value"

[credentials.weather]
type = "api_key"
key = "{{ env.WEATHER_KEY }}"
"#;

    fn resolver() -> FileCredentialResolver {
        let mut env = Map::new();
        env.insert("GITHUB_TOKEN".into(), json!("ghp_abc"));
        FileCredentialResolver::parse(FILE).unwrap().with_env(env)
    }

    #[test]
    fn test_bearer_from_env() {
        let headers = resolver().resolve("github").unwrap();
        assert_eq!(headers["Authorization"], "Bearer ghp_abc");
    }

    #[test]
    fn test_basic_is_base64() {
        let headers = resolver().resolve("jira").unwrap();
        assert_eq!(headers["Authorization"], "Basic Ym90Omh1bnRlcjI=");
    }

    #[test]
    fn test_header_and_api_key() {
        let r = resolver();
        assert_eq!(r.resolve("internal").unwrap()["X-Internal-Auth"], "static-value");
        // WEATHER_KEY is unset: the rendered value is empty, which is invalid.
        assert!(matches!(
            r.resolve("weather"),
            Err(CredentialError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unknown_credential() {
        assert!(matches!(
            resolver().resolve("nope"),
            Err(CredentialError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileCredentialResolver::load(&dir.path().join("credentials.toml")).unwrap();
        assert!(resolver.names().is_empty());
    }

    #[test]
    fn test_debug_hides_values() {
        let r = resolver();
        let debug = format!("{r:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("static-value"));
    }
}
