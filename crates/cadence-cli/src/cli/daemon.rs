//! CLI daemon subcommands: start, status, install, uninstall and tail.
//!
//! `daemon start --foreground` is the scheduler process itself. Without
//! `--foreground` the command re-executes the binary detached, with output
//! appended to `logs/daemon.log`.

use std::io::{SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use console::style;
use notify_debouncer_mini::notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cadence_core::schedule::{DaemonState, Scheduler};
use cadence_infra::daemon::lock::status as lock_status;
use cadence_infra::daemon::{
    install_service, spawn_background, uninstall_service, DaemonLock, LockStatus, ServiceKind,
};
use cadence_infra::handlers::NotifyHandler;

use crate::output::format_local;
use crate::state::AppState;

/// How long `daemon start` waits for the detached process to take the lock.
const START_WAIT: Duration = Duration::from_secs(3);

/// Daemon management subcommands.
#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the scheduler.
    Start {
        /// Run in this process instead of detaching.
        #[arg(long)]
        foreground: bool,
    },

    /// Show whether the scheduler is running.
    Status,

    /// Install the scheduler as a user service (systemd or launchd).
    Install,

    /// Remove the user service.
    Uninstall,

    /// Print the end of the daemon log.
    Tail {
        /// Number of lines to print.
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Keep printing as the log grows.
        #[arg(short, long)]
        follow: bool,
    },
}

/// Handle a daemon subcommand.
pub async fn handle_daemon_command(
    cmd: DaemonCommand,
    state: &AppState,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    match cmd {
        DaemonCommand::Start { foreground: true } => run_foreground(state, cancel).await,
        DaemonCommand::Start { foreground: false } => start_background(state, json).await,
        DaemonCommand::Status => handle_status(state, json).await,
        DaemonCommand::Install => handle_install(state, json),
        DaemonCommand::Uninstall => handle_uninstall(json),
        DaemonCommand::Tail { lines, follow } => handle_tail(state, lines, follow, cancel).await,
    }
}

fn stale_after(state: &AppState) -> Duration {
    Duration::from_secs(state.config.daemon.stale_lock_secs)
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// Run the scheduler until Ctrl+C or SIGTERM.
async fn run_foreground(state: &AppState, cancel: &CancellationToken) -> Result<()> {
    let pid = std::process::id();
    let lock_path = state.data_dir.lock_file();
    let lock = Arc::new(DaemonLock::acquire(
        &lock_path,
        &DaemonState::new(pid, Utc::now()),
        stale_after(state),
    )?);

    // Scheduled runs are unattended: no prompter, notifications go to the log.
    let engine = state.engine(NotifyHandler::new())?;

    let heartbeat_lock = Arc::clone(&lock);
    let scheduler = Scheduler::new(
        state.tasks.clone(),
        state.runs.clone(),
        engine,
        state.locator.clone(),
    )
    .with_tick(Duration::from_secs(state.config.daemon.tick_secs))
    .with_heartbeat(move |daemon_state| {
        if let Err(e) = heartbeat_lock.refresh(daemon_state) {
            tracing::warn!(error = %e, "failed to refresh daemon lock");
        }
    });

    tracing::info!(
        pid,
        data_dir = %state.data_dir.root().display(),
        presets_dir = %state.locator.presets_dir().display(),
        "daemon started"
    );

    let result = scheduler.run(cancel.clone()).await;
    drop(scheduler);

    match Arc::try_unwrap(lock) {
        Ok(lock) => lock.release()?,
        Err(_) => tracing::warn!("daemon lock still shared at shutdown"),
    }
    tracing::info!(pid, "daemon stopped");
    result?;
    Ok(())
}

async fn start_background(state: &AppState, json: bool) -> Result<()> {
    let lock_path = state.data_dir.lock_file();
    if let LockStatus::Running(running) = lock_status(&lock_path, stale_after(state))? {
        if json {
            let out = serde_json::json!({ "started": false, "pid": running.pid });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else {
            println!();
            println!(
                "  Daemon already running (pid {}).",
                style(running.pid).cyan()
            );
            println!();
        }
        return Ok(());
    }

    let exe = std::env::current_exe().context("Failed to locate the cadence executable")?;
    let pid = spawn_background(&exe, &state.data_dir)?;

    // Wait for the child to take the lock so failures surface here.
    let deadline = tokio::time::Instant::now() + START_WAIT;
    let mut confirmed = false;
    while tokio::time::Instant::now() < deadline {
        // The child may be mid-write; an unreadable lock just means not yet.
        if let Ok(LockStatus::Running(running)) = lock_status(&lock_path, stale_after(state)) {
            if running.pid == pid {
                confirmed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if json {
        let out = serde_json::json!({
            "started": confirmed,
            "pid": pid,
            "log": state.data_dir.daemon_log().display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if confirmed {
        println!(
            "  {} Daemon started (pid {})",
            style("*").green().bold(),
            style(pid).cyan()
        );
    } else {
        println!(
            "  {} Daemon spawned (pid {}) but has not reported in yet",
            style("!").yellow().bold(),
            style(pid).cyan()
        );
    }
    println!(
        "  Logs: {}",
        style(state.data_dir.daemon_log().display()).dim()
    );
    println!("  Follow with: {}", style("cadence daemon tail -f").dim());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn handle_status(state: &AppState, json: bool) -> Result<()> {
    let status = lock_status(&state.data_dir.lock_file(), stale_after(state))?;
    let tasks = state.task_service().list().await?;
    let enabled = tasks.iter().filter(|t| t.enabled).count();
    let next = tasks
        .iter()
        .filter(|t| t.enabled)
        .min_by_key(|t| t.next_run_at);

    if json {
        let (label, daemon) = match &status {
            LockStatus::NotRunning => ("stopped", None),
            LockStatus::Running(s) => ("running", Some(s)),
            LockStatus::Stale(s) => ("stale", Some(s)),
        };
        let out = serde_json::json!({
            "status": label,
            "daemon": daemon,
            "tasks": tasks.len(),
            "enabledTasks": enabled,
            "nextRun": next.map(|t| serde_json::json!({
                "task": t.name,
                "at": t.next_run_at.to_rfc3339(),
            })),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    match &status {
        LockStatus::NotRunning => {
            println!("  {} Daemon is not running", style("o").dim());
            println!("  Start it with: {}", style("cadence daemon start").dim());
        }
        LockStatus::Running(s) => {
            println!(
                "  {} Daemon running (pid {})",
                style("*").green().bold(),
                style(s.pid).cyan()
            );
            println!("  Started: {}", format_local(&s.started_at));
            println!("  Last tick: {}", format_local(&s.last_tick_at));
            println!("  In flight: {}", s.in_flight);
        }
        LockStatus::Stale(s) => {
            println!(
                "  {} Daemon lock is stale (pid {}, last tick {})",
                style("!").yellow().bold(),
                s.pid,
                format_local(&s.last_tick_at)
            );
            println!("  The process is gone or hung; `cadence daemon start` will take over.");
        }
    }
    println!("  Tasks: {} ({} enabled)", tasks.len(), enabled);
    if let Some(t) = next {
        println!(
            "  Next run: {} at {}",
            style(&t.name).cyan(),
            format_local(&t.next_run_at)
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Install / uninstall
// ---------------------------------------------------------------------------

fn handle_install(state: &AppState, json: bool) -> Result<()> {
    let kind = ServiceKind::current()?;
    let exe = std::env::current_exe().context("Failed to locate the cadence executable")?;
    let unit_path = install_service(kind, &exe, &state.data_dir)?;

    if json {
        let out = serde_json::json!({
            "installed": true,
            "path": unit_path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Wrote {}",
        style("*").green().bold(),
        style(unit_path.display()).cyan()
    );
    println!("  Activate with: {}", style(kind.activate_hint(&unit_path)).dim());
    println!();
    Ok(())
}

fn handle_uninstall(json: bool) -> Result<()> {
    let kind = ServiceKind::current()?;
    let unit_path = kind.unit_path()?;
    let removed = uninstall_service(kind)?;

    if json {
        let out = serde_json::json!({
            "removed": removed,
            "path": unit_path.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if removed {
        println!(
            "  {} Removed {}",
            style("*").green().bold(),
            style(unit_path.display()).cyan()
        );
        println!("  Also run: {}", style(kind.deactivate_hint(&unit_path)).dim());
    } else {
        println!("  No service installed at {}.", unit_path.display());
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tail
// ---------------------------------------------------------------------------

async fn handle_tail(
    state: &AppState,
    lines: usize,
    follow: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = state.data_dir.daemon_log();
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !follow {
                println!("  No daemon log at {}.", path.display());
                return Ok(());
            }
            String::new()
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    for line in last_lines(&content, lines) {
        println!("{line}");
    }

    if follow {
        follow_log(&path, content.len() as u64, cancel).await?;
    }
    Ok(())
}

/// The last `n` lines of `content`.
fn last_lines(content: &str, n: usize) -> Vec<&str> {
    let all: Vec<&str> = content.lines().collect();
    all[all.len().saturating_sub(n)..].to_vec()
}

/// Print bytes appended to `path` after `offset` until cancelled.
async fn follow_log(path: &Path, mut offset: u64, cancel: &CancellationToken) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<()>(16);

    let mut debouncer = new_debouncer(
        Duration::from_millis(200),
        move |result: DebounceEventResult| match result {
            Ok(_) => {
                // A pending wakeup already covers these events.
                let _ = tx.try_send(());
            }
            Err(err) => tracing::warn!(error = %err, "log watcher error"),
        },
    )
    .context("Failed to create log watcher")?;

    // Watch the directory so a log created or replaced later is still seen.
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("log path has no parent directory"))?;
    debouncer
        .watcher()
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
                offset = print_appended(path, offset).await?;
            }
        }
    }
    Ok(())
}

/// Print what was written after `offset`; returns the new offset. A file
/// shorter than `offset` was truncated and is printed from the start.
async fn print_appended(path: &Path, offset: u64) -> Result<u64> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };
    let len = file.metadata().await?.len();
    let start = if len < offset { 0 } else { offset };

    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    if !buf.is_empty() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&buf)?;
        stdout.flush()?;
    }
    Ok(start + buf.len() as u64)
}
