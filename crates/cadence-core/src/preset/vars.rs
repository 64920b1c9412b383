//! Variable binding and type coercion.
//!
//! Overrides arrive as strings from the CLI (`--var n=3`) or as JSON from a
//! task row; both are coerced to the declared `VarType` before any step runs.

use cadence_types::preset::{Preset, VarType};
use serde_json::{Map, Number, Value};

use super::PresetError;

/// Coerce a value to a declared variable type.
pub fn coerce(var_type: VarType, value: &Value) -> Result<Value, String> {
    match (var_type, value) {
        (VarType::String, Value::String(_)) => Ok(value.clone()),
        (VarType::String, Value::Null) => Ok(Value::String(String::new())),
        (VarType::String, other) => Ok(Value::String(other.to_string())),

        (VarType::Number, Value::Number(_)) => Ok(value.clone()),
        (VarType::Number, Value::String(s)) => parse_number(s.trim())
            .ok_or_else(|| format!("'{s}' is not a number")),
        (VarType::Number, Value::Bool(b)) => Ok(Value::from(u8::from(*b))),

        (VarType::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (VarType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(Value::Bool(true)),
            "false" | "no" | "0" | "off" | "" => Ok(Value::Bool(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        (VarType::Boolean, Value::Number(n)) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),

        (VarType::Unknown, _) => Err("unknown variable type".to_string()),
        (expected, other) => Err(format!("expected {expected}, got {other}")),
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Build the initial `vars` map for a run.
///
/// Declared variables take the override, else the default; a required
/// variable with neither is a validation error. Undeclared overrides pass
/// through unchanged.
pub fn bind_variables(
    preset: &Preset,
    overrides: &Map<String, Value>,
) -> Result<Map<String, Value>, PresetError> {
    let mut vars = Map::new();

    for (name, def) in &preset.vars {
        let raw = overrides.get(name).or(def.default.as_ref());
        match raw {
            Some(raw) => {
                let value = coerce(def.var_type, raw).map_err(|e| {
                    PresetError::Validation(format!("variable '{name}': {e}"))
                })?;
                vars.insert(name.clone(), value);
            }
            None if def.required => {
                return Err(PresetError::Validation(format!(
                    "missing required variable '{name}'"
                )));
            }
            None => {
                vars.insert(name.clone(), Value::Null);
            }
        }
    }

    for (name, value) in overrides {
        if !preset.vars.contains_key(name) {
            tracing::debug!(variable = name.as_str(), "override for undeclared variable");
            vars.insert(name.clone(), value.clone());
        }
    }

    Ok(vars)
}

/// Parse `key=value` pairs as given on the command line.
pub fn parse_overrides<'a>(
    pairs: impl IntoIterator<Item = &'a str>,
) -> Result<Map<String, Value>, PresetError> {
    pairs
        .into_iter()
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                PresetError::Validation(format!("invalid variable override '{pair}', expected key=value"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(PresetError::Validation(format!(
                    "invalid variable override '{pair}', empty key"
                )));
            }
            Ok((key.to_string(), Value::String(value.to_string())))
        })
        .collect()
}
