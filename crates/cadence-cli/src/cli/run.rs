//! `cadence run`: execute a preset on demand.

use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_core::engine::RunOptions;
use cadence_core::preset::vars::parse_overrides;
use cadence_core::recorder::Recorder;
use cadence_types::run::RunStatus;
use tokio_util::sync::CancellationToken;

use crate::output::{notify_handler, print_run_summary, ConsoleObserver, DialoguerPrompter};
use crate::state::AppState;

/// Run a preset and print the outcome. Dry runs are not recorded.
pub async fn handle_run(
    state: &AppState,
    preset_ref: &str,
    dry_run: bool,
    vars: &[String],
    json: bool,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<RunStatus> {
    let preset = state
        .locator
        .load(preset_ref)
        .with_context(|| format!("Failed to load preset '{preset_ref}'"))?;
    let overrides = parse_overrides(vars.iter().map(String::as_str))?;

    let live = !json && !quiet;
    let engine = state
        .engine(notify_handler(live))?
        .with_prompter(Arc::new(DialoguerPrompter));
    let options = RunOptions::manual()
        .dry_run(dry_run)
        .interactive(!json && console::user_attended());
    let console_observer = ConsoleObserver::new(live);

    let run = if dry_run {
        engine
            .run(&preset, &overrides, options, &console_observer, cancel)
            .await
    } else {
        let observer = (Recorder::new(state.runs.clone()), console_observer);
        engine
            .run(&preset, &overrides, options, &observer, cancel)
            .await
    }
    .with_context(|| format!("Preset '{}' did not run", preset.name))?;

    print_run_summary(&run, json, quiet)?;
    Ok(run.status)
}
