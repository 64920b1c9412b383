//! Preset parsing, validation, and filesystem operations.
//!
//! Presets are JSON or YAML files. Parsing always runs the full load-time
//! validation (see [`graph::StepGraph::build`]), so a returned `Preset` is
//! structurally valid: unique ids, resolvable references, acyclic control
//! flow and known variable types.

pub mod graph;
pub mod vars;

use std::path::{Path, PathBuf};

use cadence_types::preset::Preset;
use thiserror::Error;

pub use graph::StepGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a preset.
#[derive(Debug, Error)]
pub enum PresetError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure (duplicate id, dangling reference,
    /// unknown var type, cycle, bad variable value).
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No preset file matches the reference.
    #[error("preset not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Control actions
// ---------------------------------------------------------------------------

/// Actions interpreted by the engine itself rather than dispatched to a
/// registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAction {
    If,
    Set,
    Log,
    Prompt,
    Shell,
    ForEach,
    While,
    Parallel,
}

impl ControlAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "if" => Some(Self::If),
            "set" => Some(Self::Set),
            "log" => Some(Self::Log),
            "prompt" => Some(Self::Prompt),
            "shell" => Some(Self::Shell),
            "forEach" => Some(Self::ForEach),
            "while" => Some(Self::While),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }

    /// Actions that carry a nested loop body in `step`.
    pub fn has_body(self) -> bool {
        matches!(self, Self::ForEach | Self::While)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Serialization format of a preset file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetFormat {
    Json,
    Yaml,
}

impl PresetFormat {
    /// Pick the format from a file extension (`.json`, `.yaml`, `.yml`).
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// Parse and validate a preset.
pub fn parse_preset(content: &str, format: PresetFormat) -> Result<Preset, PresetError> {
    let preset: Preset = match format {
        PresetFormat::Json => {
            serde_json::from_str(content).map_err(|e| PresetError::Parse(e.to_string()))?
        }
        PresetFormat::Yaml => {
            serde_yaml_ng::from_str(content).map_err(|e| PresetError::Parse(e.to_string()))?
        }
    };
    validate_preset(&preset)?;
    Ok(preset)
}

/// Run every load-time check on an already-deserialized preset.
pub fn validate_preset(preset: &Preset) -> Result<(), PresetError> {
    StepGraph::build(preset).map(|_| ())
}

/// Serialize a preset in the given format.
pub fn serialize_preset(preset: &Preset, format: PresetFormat) -> Result<String, PresetError> {
    match format {
        PresetFormat::Json => {
            serde_json::to_string_pretty(preset).map_err(|e| PresetError::Parse(e.to_string()))
        }
        PresetFormat::Yaml => {
            serde_yaml_ng::to_string(preset).map_err(|e| PresetError::Parse(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a preset from a `.json`, `.yaml` or `.yml` file.
pub fn load_preset_file(path: &Path) -> Result<Preset, PresetError> {
    let format = PresetFormat::from_path(path).ok_or_else(|| {
        PresetError::Parse(format!(
            "unsupported preset file extension: {}",
            path.display()
        ))
    })?;
    let content = std::fs::read_to_string(path)?;
    parse_preset(&content, format)
}

/// Discover all preset files under `base_dir`, recursively.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_presets(base_dir: &Path) -> Result<Vec<(PathBuf, Preset)>, PresetError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(dir: &Path, results: &mut Vec<(PathBuf, Preset)>) -> Result<(), PresetError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if PresetFormat::from_path(&path).is_some() {
            match load_preset_file(&path) {
                Ok(preset) => results.push((path, preset)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping invalid preset file");
                }
            }
        }
    }
    Ok(())
}

/// Resolves preset references (a file path or a bare name) to files.
///
/// A name `backup` matches `backup.json`, `backup.yaml` or `backup.yml` in the
/// presets directory, in that order.
#[derive(Debug, Clone)]
pub struct PresetLocator {
    presets_dir: PathBuf,
}

impl PresetLocator {
    pub fn new(presets_dir: impl Into<PathBuf>) -> Self {
        Self {
            presets_dir: presets_dir.into(),
        }
    }

    pub fn presets_dir(&self) -> &Path {
        &self.presets_dir
    }

    /// Find the file a reference points to.
    pub fn locate(&self, reference: &str) -> Result<PathBuf, PresetError> {
        let direct = Path::new(reference);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }

        for ext in ["json", "yaml", "yml"] {
            let candidate = self.presets_dir.join(format!("{reference}.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        Err(PresetError::NotFound(reference.to_string()))
    }

    /// Locate and load a preset.
    pub fn load(&self, reference: &str) -> Result<Preset, PresetError> {
        let path = self.locate(reference)?;
        load_preset_file(&path)
    }

    /// All valid presets in the presets directory.
    pub fn list(&self) -> Result<Vec<(PathBuf, Preset)>, PresetError> {
        discover_presets(&self.presets_dir)
    }
}
