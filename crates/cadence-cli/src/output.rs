//! Terminal output shared by the command handlers: live step progress,
//! run summaries, notifications and the interactive prompter.

use cadence_core::handler::{PromptRequest, Prompter};
use cadence_core::recorder::RunObserver;
use cadence_infra::handlers::{Notification, NotifyHandler};
use cadence_types::error::RepositoryError;
use cadence_types::run::{Run, RunStatus, StepResult, StepStatus};
use chrono::{DateTime, Local, Utc};
use comfy_table::{Cell, Color};
use console::style;
use dialoguer::{Input, Select};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Live progress
// ---------------------------------------------------------------------------

/// Prints one line per finished step while a run executes.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleObserver {
    enabled: bool,
}

impl ConsoleObserver {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl RunObserver for ConsoleObserver {
    async fn run_started(&self, run: &Run) -> Result<(), RepositoryError> {
        if self.enabled {
            println!();
            println!(
                "  {} Running preset '{}'",
                style("*").green().bold(),
                style(&run.preset_name).cyan()
            );
            println!();
        }
        Ok(())
    }

    async fn step_finished(
        &self,
        _run_id: Uuid,
        _seq: u32,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        if self.enabled {
            println!(
                "  {} {} {}",
                step_mark(result.status),
                result.step_id,
                style(format!("({}ms)", result.duration_ms)).dim()
            );
            if let Some(ref err) = result.error {
                println!("      {}", style(err).red());
            }
        }
        Ok(())
    }

    async fn run_finished(&self, _run: &Run) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Notify handler that echoes notifications to the terminal.
pub fn notify_handler(enabled: bool) -> NotifyHandler {
    NotifyHandler::new().with_listener(move |n: &Notification| {
        if enabled {
            println!(
                "  {} {}: {}",
                style("!").yellow().bold(),
                style(&n.title).bold(),
                n.message
            );
        }
    })
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Print the outcome of a finished run.
pub fn print_run_summary(run: &Run, json: bool, quiet: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }
    if quiet {
        return Ok(());
    }

    println!();
    let duration = run
        .duration_ms()
        .map(|ms| format!(" in {ms}ms"))
        .unwrap_or_default();
    let headline = match run.status {
        RunStatus::Success => style("Run succeeded").green().bold(),
        RunStatus::Error => style("Run failed").red().bold(),
        RunStatus::Cancelled => style("Run cancelled").yellow().bold(),
        RunStatus::Running => style("Run still running").dim(),
    };
    println!("  {headline}{duration}");
    println!("  Run ID: {}", run.id);
    if let Some(ref err) = run.error {
        println!("  Error: {}", style(err).red());
    }
    println!(
        "  Details: {}",
        style(format!("cadence inspect {}", run.id)).dim()
    );
    println!();
    Ok(())
}

fn step_mark(status: StepStatus) -> String {
    match status {
        StepStatus::Success => style("✓").green().to_string(),
        StepStatus::Error => style("✗").red().to_string(),
        StepStatus::Skipped => style("-").dim().to_string(),
    }
}

/// Colored table cell for a run status.
pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Success => Color::Green,
        RunStatus::Error => Color::Red,
        RunStatus::Cancelled => Color::Yellow,
        RunStatus::Running => Color::Blue,
    };
    Cell::new(status.to_string()).fg(color)
}

/// Colored table cell for a step status.
pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Success => Color::Green,
        StepStatus::Error => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.to_string()).fg(color)
}

/// First eight characters of an id, for tables.
pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// A timestamp in the local zone, for tables.
pub fn format_local(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Clip text to `max` characters for a table cell.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(3)).collect();
    clipped.push_str("...");
    clipped
}

// ---------------------------------------------------------------------------
// Prompter
// ---------------------------------------------------------------------------

/// Answers `prompt` steps with dialoguer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn prompt(&self, request: &PromptRequest) -> Result<String, String> {
        if !request.choices.is_empty() {
            let default = request
                .default
                .as_ref()
                .and_then(|d| request.choices.iter().position(|c| c == d))
                .unwrap_or(0);
            let selection = Select::new()
                .with_prompt(&request.message)
                .items(&request.choices)
                .default(default)
                .interact()
                .map_err(|e| e.to_string())?;
            return request
                .choices
                .get(selection)
                .cloned()
                .ok_or_else(|| format!("invalid selection {selection}"));
        }

        let mut input = Input::<String>::new().with_prompt(&request.message);
        if let Some(ref default) = request.default {
            input = input.default(default.clone());
        }
        input.interact_text().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip() {
        assert_eq!(clip("short", 10), "short");
        assert_eq!(clip("a much longer error message", 10), "a much ...");
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::parse_str("0190f6c2-7a3b-7c00-8000-000000000000").unwrap();
        assert_eq!(short_id(&id), "0190f6c2");
    }
}
