//! `file.*` actions on the local filesystem.
//!
//! - `file.read { path }` -> `{path, content, size}`
//! - `file.write { path, content, append?, createDirs? }` -> `{path, bytes}`
//! - `file.exists { path }` -> `{path, exists, isDir}`
//! - `file.list { path }` -> `{path, entries: [{name, isDir, size}]}`
//!
//! A leading `~/` expands to the home directory. Non-string `content` is
//! written as pretty JSON.

use std::path::PathBuf;

use cadence_core::handler::{HandlerOptions, HandlerResult, StepHandler};
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

/// Handler for the `file` action family.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHandler;

impl FileHandler {
    pub fn new() -> Self {
        Self
    }
}

fn path_param(params: &Map<String, Value>) -> Result<PathBuf, String> {
    let raw = params
        .get("path")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| "missing required param 'path'".to_string())?;
    Ok(expand_home(raw))
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}

async fn read(params: &Map<String, Value>) -> Result<Value, String> {
    let path = path_param(params)?;
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    Ok(json!({
        "path": path.display().to_string(),
        "size": content.len(),
        "content": content,
    }))
}

async fn write(params: &Map<String, Value>) -> Result<Value, String> {
    let path = path_param(params)?;
    let content = match params.get("content") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string_pretty(other).map_err(|e| e.to_string())?,
    };
    let append = params.get("append").and_then(Value::as_bool).unwrap_or(false);
    let create_dirs = params.get("createDirs").and_then(Value::as_bool).unwrap_or(true);

    if create_dirs {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .await
        .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    file.flush().await.map_err(|e| e.to_string())?;

    Ok(json!({ "path": path.display().to_string(), "bytes": content.len() }))
}

async fn exists(params: &Map<String, Value>) -> Result<Value, String> {
    let path = path_param(params)?;
    let metadata = tokio::fs::metadata(&path).await.ok();
    Ok(json!({
        "path": path.display().to_string(),
        "exists": metadata.is_some(),
        "isDir": metadata.is_some_and(|m| m.is_dir()),
    }))
}

async fn list(params: &Map<String, Value>) -> Result<Value, String> {
    let path = path_param(params)?;
    let mut dir = tokio::fs::read_dir(&path)
        .await
        .map_err(|e| format!("failed to list {}: {e}", path.display()))?;

    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(|e| e.to_string())? {
        let metadata = entry.metadata().await.map_err(|e| e.to_string())?;
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            metadata.is_dir(),
            metadata.len(),
        ));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let entries: Vec<Value> = entries
        .into_iter()
        .map(|(name, is_dir, size)| json!({ "name": name, "isDir": is_dir, "size": size }))
        .collect();
    Ok(json!({ "path": path.display().to_string(), "entries": entries }))
}

impl StepHandler for FileHandler {
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        _opts: HandlerOptions,
    ) -> HandlerResult {
        let result = match action {
            "file.read" => read(params).await,
            "file.write" => write(params).await,
            "file.exists" => exists(params).await,
            "file.list" => list(params).await,
            other => Err(format!("unknown file action '{other}'")),
        };
        match result {
            Ok(output) => HandlerResult::success(output),
            Err(e) => HandlerResult::failure(e),
        }
    }
}
