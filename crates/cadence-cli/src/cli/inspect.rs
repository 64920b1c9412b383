//! `cadence inspect`: step results of one run.

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use cadence_core::repository::RunRepository;
use cadence_types::run::Run;

use crate::output::{clip, format_local, step_status_cell};
use crate::state::AppState;

pub async fn handle_inspect(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id: Uuid = run_id
        .parse()
        .with_context(|| format!("Invalid run ID: '{run_id}'"))?;

    let run = state
        .runs
        .get_run(&id)
        .await
        .context("Failed to load run")?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    print_run(&run);
    Ok(())
}

fn print_run(run: &Run) {
    println!();
    println!(
        "  {} {}",
        style("Run:").bold(),
        style(run.id.to_string()).cyan()
    );
    println!("  Preset: {}", style(&run.preset_name).cyan());
    if let Some(task_id) = run.task_id {
        println!("  Task: {task_id}");
    }
    println!("  Trigger: {}", run.trigger);
    println!("  Status: {}", run.status);
    println!("  Started: {}", format_local(&run.started_at));
    if let Some(ref finished) = run.finished_at {
        println!("  Finished: {}", format_local(finished));
    }
    if let Some(ms) = run.duration_ms() {
        println!("  Duration: {ms}ms");
    }
    if let Some(ref err) = run.error {
        println!("  Error: {}", style(err).red());
    }

    if run.step_results.is_empty() {
        println!();
        println!("  No steps recorded.");
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Exit"),
            Cell::new("Output / error"),
        ]);

    for (seq, r) in run.step_results.iter().enumerate() {
        let detail = match (&r.error, &r.output) {
            (Some(err), _) => err.clone(),
            (None, Some(output)) => output.to_string(),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            Cell::new(seq),
            Cell::new(&r.step_id),
            step_status_cell(r.status),
            Cell::new(format!("{}ms", r.duration_ms)),
            Cell::new(r.exit_code.map(|c| c.to_string()).unwrap_or_default()),
            Cell::new(clip(&detail, 80)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
}
