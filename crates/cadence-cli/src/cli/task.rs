//! CLI task subcommands.
//!
//! Create, list, show, enable, disable, delete, run and history for
//! scheduled tasks. Tasks are addressed by name or UUID.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use dialoguer::Confirm;
use tokio_util::sync::CancellationToken;

use cadence_core::engine::RunOptions;
use cadence_core::preset::vars::parse_overrides;
use cadence_core::schedule::NewTask;
use cadence_types::run::RunStatus;
use cadence_types::task::Task;

use crate::output::{
    clip, format_local, notify_handler, print_run_summary, run_status_cell, short_id,
    ConsoleObserver, DialoguerPrompter,
};
use crate::state::AppState;

/// Task management subcommands.
#[derive(Subcommand)]
pub enum TaskCommand {
    /// Schedule a preset.
    Create {
        /// Unique task name.
        #[arg(long)]
        name: String,

        /// Preset file path or preset name.
        #[arg(long)]
        preset: String,

        /// Interval, e.g. "15 minutes", "day at 09:00" or "hourly".
        #[arg(long = "every", value_name = "INTERVAL")]
        interval: String,

        /// Variable override applied on every run (repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Create the task without scheduling it.
        #[arg(long)]
        disabled: bool,
    },

    /// List scheduled tasks.
    #[command(alias = "ls")]
    List,

    /// Show one task.
    Show {
        /// Task name or UUID.
        task: String,
    },

    /// Resume scheduling a task.
    Enable {
        /// Task name or UUID.
        task: String,
    },

    /// Stop scheduling a task.
    Disable {
        /// Task name or UUID.
        task: String,
    },

    /// Delete a task. Its runs are kept.
    #[command(alias = "rm")]
    Delete {
        /// Task name or UUID.
        task: String,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Run a task now without touching its schedule.
    Run {
        /// Task name or UUID.
        task: String,
    },

    /// Show recent runs of a task.
    History {
        /// Task name or UUID.
        task: String,

        /// Maximum number of runs to display.
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },
}

/// Handle a task subcommand. Returns the run status for `task run`.
pub async fn handle_task_command(
    cmd: TaskCommand,
    state: &AppState,
    json: bool,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<Option<RunStatus>> {
    match cmd {
        TaskCommand::Create {
            name,
            preset,
            interval,
            vars,
            disabled,
        } => handle_create(state, name, preset, interval, &vars, !disabled, json).await?,
        TaskCommand::List => handle_list(state, json).await?,
        TaskCommand::Show { task } => handle_show(&task, state, json).await?,
        TaskCommand::Enable { task } => handle_toggle(&task, true, state, json).await?,
        TaskCommand::Disable { task } => handle_toggle(&task, false, state, json).await?,
        TaskCommand::Delete { task, force } => handle_delete(&task, force, state, json).await?,
        TaskCommand::Run { task } => {
            return handle_run(&task, state, json, quiet, cancel).await.map(Some);
        }
        TaskCommand::History { task, limit } => handle_history(&task, limit, state, json).await?,
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

async fn handle_create(
    state: &AppState,
    name: String,
    preset_ref: String,
    interval: String,
    vars: &[String],
    enabled: bool,
    json: bool,
) -> Result<()> {
    let var_overrides = parse_overrides(vars.iter().map(String::as_str))?;
    let task = state
        .task_service()
        .create(NewTask {
            name,
            preset_ref,
            interval: interval_text(&interval),
            var_overrides,
            enabled,
        })
        .await
        .context("Failed to create task")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Created task '{}'",
        style("*").green().bold(),
        style(&task.name).cyan()
    );
    println!("  ID: {}", task.id);
    println!("  Preset: {}", task.preset_ref);
    println!("  Schedule: {}", task.interval_spec);
    if task.enabled {
        println!("  Next run: {}", format_local(&task.next_run_at));
        println!();
        println!(
            "  Make sure the scheduler is running: {}",
            style("cadence daemon status").dim()
        );
    } else {
        println!("  Status: {}", style("disabled").yellow());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List / show
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let tasks = state
        .task_service()
        .list()
        .await
        .context("Failed to list tasks")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!();
        println!("  No scheduled tasks.");
        println!(
            "  Create one with: {}",
            style("cadence task create --name <name> --preset <preset> --every \"1 hour\"").dim()
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
            Cell::new("Preset"),
            Cell::new("Schedule"),
            Cell::new("Enabled"),
            Cell::new("Next run"),
            Cell::new("Last run"),
        ]);

    for t in &tasks {
        let enabled = if t.enabled {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        let next = if t.enabled {
            format_local(&t.next_run_at)
        } else {
            "-".to_string()
        };
        table.add_row(vec![
            Cell::new(&t.name),
            Cell::new(clip(&t.preset_ref, 32)),
            Cell::new(&t.interval_spec),
            enabled,
            Cell::new(next),
            Cell::new(t.last_run_at.as_ref().map(format_local).unwrap_or_else(|| "-".into())),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(key: &str, state: &AppState, json: bool) -> Result<()> {
    let task = state.task_service().find(key).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }
    print_task(&task);
    Ok(())
}

fn print_task(task: &Task) {
    println!();
    println!("  {} {}", style("Task:").bold(), style(&task.name).cyan());
    println!("  ID: {}", task.id);
    println!("  Preset: {}", task.preset_ref);
    println!("  Schedule: {}", task.interval_spec);
    println!(
        "  Enabled: {}",
        if task.enabled {
            style("yes").green()
        } else {
            style("no").yellow()
        }
    );
    if task.enabled {
        println!("  Next run: {}", format_local(&task.next_run_at));
    }
    if let Some(ref last) = task.last_run_at {
        println!("  Last run: {}", format_local(last));
    }
    println!("  Created: {}", format_local(&task.created_at));
    if !task.var_overrides.is_empty() {
        println!("  Variables:");
        for (k, v) in &task.var_overrides {
            println!("    {k} = {v}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// Enable / disable / delete
// ---------------------------------------------------------------------------

async fn handle_toggle(key: &str, enable: bool, state: &AppState, json: bool) -> Result<()> {
    let service = state.task_service();
    let task = if enable {
        service.enable(key).await?
    } else {
        service.disable(key).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!();
    if task.enabled {
        println!(
            "  {} Task '{}' enabled, next run {}",
            style("*").green().bold(),
            style(&task.name).cyan(),
            format_local(&task.next_run_at)
        );
    } else {
        println!(
            "  {} Task '{}' disabled",
            style("*").yellow().bold(),
            style(&task.name).cyan()
        );
    }
    println!();
    Ok(())
}

async fn handle_delete(key: &str, force: bool, state: &AppState, json: bool) -> Result<()> {
    let service = state.task_service();
    let task = service.find(key).await?;

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete task '{}'? Its run history is kept.",
                style(&task.name).red().bold()
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let deleted = service.delete(&task.id.to_string()).await?;

    if json {
        let out = serde_json::json!({
            "deleted": true,
            "id": deleted.id.to_string(),
            "name": deleted.name,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "  {} Deleted task '{}'",
            style("*").green().bold(),
            style(&deleted.name).cyan()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run now / history
// ---------------------------------------------------------------------------

async fn handle_run(
    key: &str,
    state: &AppState,
    json: bool,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<RunStatus> {
    let live = !json && !quiet;
    let engine = state
        .engine(notify_handler(live))?
        .with_prompter(Arc::new(DialoguerPrompter));
    let options = RunOptions::manual().interactive(!json && console::user_attended());

    let run = state
        .task_service()
        .run_now(key, &engine, options, &ConsoleObserver::new(live), cancel)
        .await?;

    print_run_summary(&run, json, quiet)?;
    Ok(run.status)
}

async fn handle_history(key: &str, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let (task, runs) = state.task_service().history(key, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs for task '{}'.", task.name);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Trigger"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for r in &runs {
        let duration = r
            .duration_ms()
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            run_status_cell(r.status),
            Cell::new(r.trigger),
            Cell::new(format_local(&r.started_at)),
            Cell::new(duration),
            Cell::new(clip(r.error.as_deref().unwrap_or(""), 40)),
        ]);
    }

    println!();
    println!("  Runs for task '{}'", style(&task.name).cyan());
    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Accept `--every "15 minutes"` as well as the full `every 15 minutes`.
fn interval_text(every: &str) -> String {
    let trimmed = every.trim();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("every ") || lower == "hourly" || lower == "daily" {
        trimmed.to_string()
    } else {
        format!("every {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_text() {
        assert_eq!(interval_text("15 minutes"), "every 15 minutes");
        assert_eq!(interval_text("day at 09:00"), "every day at 09:00");
        assert_eq!(interval_text("Every 2 hours"), "Every 2 hours");
        assert_eq!(interval_text("daily"), "daily");
    }
}
