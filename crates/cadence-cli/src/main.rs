//! Cadence CLI entry point.
//!
//! Binary name: `cadence`
//!
//! Parses CLI arguments, initializes tracing, the data directory and the
//! database, then dispatches to the command handlers. Runs exit 1 when they
//! end in `error` and 130 when interrupted.

mod cli;
mod output;
mod state;

use std::process::ExitCode;

use cadence_observe::{filter_for_verbosity, init_tracing, shutdown_tracing, TracingOptions};
use cadence_types::run::RunStatus;
use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use cli::daemon::DaemonCommand;
use cli::{Cli, Commands};
use state::AppState;

/// Exit code for a run interrupted by Ctrl+C or SIGTERM.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The foreground daemon logs JSON lines; everything else logs for humans.
    let daemon_foreground = matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Start { foreground: true }
        }
    );
    let options = TracingOptions {
        default_filter: if daemon_foreground && cli.verbose == 0 {
            "info".to_string()
        } else {
            filter_for_verbosity(cli.verbose, cli.quiet).to_string()
        },
        json: daemon_foreground,
        otel: std::env::var_os("CADENCE_OTEL").is_some(),
        ansi: !daemon_foreground,
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let code = match dispatch(cli, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("  {} {e:#}", console::style("error:").red().bold());
            if cancel.is_cancelled() {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::FAILURE
            }
        }
    };

    shutdown_tracing();
    code
}

async fn dispatch(cli: Cli, cancel: &CancellationToken) -> anyhow::Result<ExitCode> {
    let state = AppState::init().await?;
    let json = cli.json;
    let quiet = cli.quiet;

    match cli.command {
        Commands::Run {
            preset,
            dry_run,
            vars,
        } => {
            let status =
                cli::run::handle_run(&state, &preset, dry_run, &vars, json, quiet, cancel).await?;
            Ok(exit_code_for(status))
        }

        Commands::Preset { command } => {
            cli::preset::handle_preset_command(command, &state, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Task { command } => {
            match cli::task::handle_task_command(command, &state, json, quiet, cancel).await? {
                Some(status) => Ok(exit_code_for(status)),
                None => Ok(ExitCode::SUCCESS),
            }
        }

        Commands::Inspect { run_id } => {
            cli::inspect::handle_inspect(&run_id, &state, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Daemon { command } => {
            cli::daemon::handle_daemon_command(command, &state, json, cancel).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

/// Process exit code for a finished run.
fn exit_code_for(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Success | RunStatus::Running => ExitCode::SUCCESS,
        RunStatus::Error => ExitCode::FAILURE,
        RunStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
