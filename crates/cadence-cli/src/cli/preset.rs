//! CLI preset subcommands: list, show, validate and schema.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use cadence_core::handler::HandlerRegistry;
use cadence_core::preset::{load_preset_file, ControlAction};
use cadence_infra::handlers::NotifyHandler;
use cadence_types::preset::{Preset, Step, StepRef, Trigger};

use crate::output::clip;
use crate::state::AppState;

/// Preset subcommands.
#[derive(Subcommand)]
pub enum PresetCommand {
    /// List presets in the presets directory.
    List,

    /// Show a preset's variables and steps.
    Show {
        /// Preset file path or preset name.
        preset: String,
    },

    /// Validate a preset file without running it.
    Validate {
        /// Path to the preset file.
        file: PathBuf,
    },

    /// Print the JSON Schema of the preset format.
    Schema,
}

/// Handle a preset subcommand.
pub async fn handle_preset_command(cmd: PresetCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        PresetCommand::List => handle_list(state, json),
        PresetCommand::Show { preset } => handle_show(&preset, state, json),
        PresetCommand::Validate { file } => handle_validate(&file, state, json),
        PresetCommand::Schema => handle_schema(),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let found = state
        .locator
        .list()
        .context("Failed to scan presets directory")?;

    if json {
        let out: Vec<_> = found
            .iter()
            .map(|(path, p)| {
                serde_json::json!({
                    "name": p.name,
                    "path": path.display().to_string(),
                    "description": p.description,
                    "steps": p.steps.len(),
                    "trigger": p.trigger,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if found.is_empty() {
        println!();
        println!(
            "  No presets found in {}.",
            style(state.locator.presets_dir().display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Steps"),
            Cell::new("Trigger"),
            Cell::new("File"),
        ]);

    for (path, p) in &found {
        let file = path
            .strip_prefix(state.locator.presets_dir())
            .unwrap_or(path);
        table.add_row(vec![
            Cell::new(&p.name),
            Cell::new(p.steps.len()),
            Cell::new(trigger_label(&p.trigger)),
            Cell::new(file.display()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

fn handle_show(reference: &str, state: &AppState, json: bool) -> Result<()> {
    let preset = state
        .locator
        .load(reference)
        .with_context(|| format!("Failed to load preset '{reference}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&preset)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Preset:").bold(), style(&preset.name).cyan());
    if let Some(ref description) = preset.description {
        println!("  {}", style(description).dim());
    }
    println!("  Trigger: {}", trigger_label(&preset.trigger));

    if !preset.vars.is_empty() {
        let mut vars = Table::new();
        vars.load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Variable").fg(Color::Cyan),
                Cell::new("Type"),
                Cell::new("Required"),
                Cell::new("Default"),
                Cell::new("Description"),
            ]);
        for (name, def) in &preset.vars {
            vars.add_row(vec![
                Cell::new(name),
                Cell::new(def.var_type),
                Cell::new(if def.required { "yes" } else { "" }),
                Cell::new(def.default.as_ref().map(|v| v.to_string()).unwrap_or_default()),
                Cell::new(&def.description),
            ]);
        }
        println!();
        println!("{vars}");
    }

    let mut steps = Table::new();
    steps
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Action"),
            Cell::new("On error"),
            Cell::new("Flow"),
        ]);
    for (i, step) in preset.steps.iter().enumerate() {
        steps.add_row(vec![
            Cell::new(i + 1),
            Cell::new(step.label()),
            Cell::new(&step.action),
            Cell::new(format!("{:?}", step.on_error).to_lowercase()),
            Cell::new(clip(&flow_label(step), 48)),
        ]);
    }
    println!();
    println!("{steps}");
    println!();
    Ok(())
}

fn trigger_label(trigger: &Trigger) -> String {
    match trigger {
        Trigger::Manual => "manual".to_string(),
        Trigger::Schedule { interval } => format!("schedule ({interval})"),
    }
}

fn flow_label(step: &Step) -> String {
    let mut parts = Vec::new();
    if let Some(ref condition) = step.condition {
        parts.push(format!("when {condition}"));
    }
    if let Some(ref then) = step.then {
        parts.push(format!("then -> {then}"));
    }
    if let Some(ref otherwise) = step.otherwise {
        parts.push(format!("else -> {otherwise}"));
    }
    match step.step.as_deref() {
        Some(StepRef::Id(id)) => parts.push(format!("body {id}")),
        Some(StepRef::Inline(inner)) => parts.push(format!("body {} ({})", inner.id, inner.action)),
        None => {}
    }
    parts.join(", ")
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let preset = load_preset_file(file)
        .with_context(|| format!("{} is not a valid preset", file.display()))?;

    let engine = state.engine(NotifyHandler::new())?;
    let unknown = unknown_actions(&preset, engine.registry());

    if json {
        let out = serde_json::json!({
            "valid": true,
            "name": preset.name,
            "steps": preset.steps.len(),
            "unknownActions": unknown,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} steps)",
        style("✓").green().bold(),
        style(&preset.name).cyan(),
        preset.steps.len()
    );
    for action in &unknown {
        println!(
            "  {} no handler registered for action '{}'",
            style("!").yellow().bold(),
            action
        );
    }
    println!();
    Ok(())
}

/// Actions that are neither control actions nor served by the registry.
fn unknown_actions(preset: &Preset, registry: &HandlerRegistry) -> Vec<String> {
    fn visit(step: &Step, registry: &HandlerRegistry, out: &mut Vec<String>) {
        if ControlAction::parse(&step.action).is_none()
            && !registry.contains(&step.action)
            && !out.contains(&step.action)
        {
            out.push(step.action.clone());
        }
        if let Some(StepRef::Inline(inner)) = step.step.as_deref() {
            visit(inner, registry, out);
        }
    }

    let mut out = Vec::new();
    for step in &preset.steps {
        visit(step, registry, &mut out);
    }
    out
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn handle_schema() -> Result<()> {
    let schema = schemars::schema_for!(Preset);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::handler::{HandlerOptions, HandlerResult, StepHandler};
    use serde_json::{Map, Value};

    struct Echo;

    impl StepHandler for Echo {
        async fn execute(
            &self,
            _action: &str,
            params: &Map<String, Value>,
            _opts: HandlerOptions,
        ) -> HandlerResult {
            HandlerResult::success(Value::Object(params.clone()))
        }
    }

    #[test]
    fn test_unknown_actions_walks_inline_bodies() {
        let preset: Preset = serde_json::from_value(serde_json::json!({
            "name": "scan",
            "steps": [
                { "id": "fetch", "action": "http.get", "params": { "url": "https://example.com" } },
                { "id": "each", "action": "forEach", "params": { "items": "{{ steps.fetch.output.body }}" },
                  "step": { "id": "mail", "action": "email.send" } },
                { "id": "done", "action": "log", "params": { "message": "ok" } }
            ]
        }))
        .unwrap();
        let registry = HandlerRegistry::new().with("http", Echo);
        assert_eq!(unknown_actions(&preset, &registry), vec!["email.send".to_string()]);
    }

    #[test]
    fn test_flow_label() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "check", "action": "if", "condition": "steps.fetch.output.status == 200",
            "then": "notify", "else": "alert"
        }))
        .unwrap();
        assert_eq!(
            flow_label(&step),
            "when steps.fetch.output.status == 200, then -> notify, else -> alert"
        );
    }

    #[test]
    fn test_schema_names_preset_fields() {
        let schema = serde_json::to_value(schemars::schema_for!(Preset)).unwrap();
        let properties = &schema["properties"];
        assert!(properties.get("steps").is_some());
        assert!(properties.get("vars").is_some());
    }
}
