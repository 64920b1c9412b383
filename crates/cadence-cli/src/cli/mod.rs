//! CLI command definitions for the `cadence` binary.
//!
//! Uses clap derive macros. Top-level commands are nouns (`preset`, `task`,
//! `daemon`) with verb subcommands, plus `run` and `inspect` for the common
//! one-shot operations.

pub mod daemon;
pub mod inspect;
pub mod preset;
pub mod run;
pub mod task;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use daemon::DaemonCommand;
use preset::PresetCommand;
use task::TaskCommand;

/// Run and schedule automation presets.
#[derive(Parser)]
#[command(name = "cadence", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a preset now.
    Run {
        /// Preset file path or preset name.
        preset: String,

        /// Walk the control flow without calling handlers or shells.
        #[arg(long)]
        dry_run: bool,

        /// Variable override (repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Inspect and validate presets.
    Preset {
        #[command(subcommand)]
        command: PresetCommand,
    },

    /// Manage scheduled tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Show the step results of one run.
    Inspect {
        /// Run UUID.
        run_id: String,
    },

    /// Control the scheduler daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_collects_repeated_vars() {
        let cli = Cli::try_parse_from([
            "cadence", "run", "digest", "--dry-run", "--var", "to=ops", "--var", "limit=5",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                preset,
                dry_run,
                vars,
            } => {
                assert_eq!(preset, "digest");
                assert!(dry_run);
                assert_eq!(vars, vec!["to=ops", "limit=5"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cadence", "task", "list", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_daemon_start_foreground() {
        let cli = Cli::try_parse_from(["cadence", "daemon", "start", "--foreground"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                command: DaemonCommand::Start { foreground: true }
            }
        ));
    }

    #[test]
    fn test_task_create_requires_interval() {
        assert!(Cli::try_parse_from(["cadence", "task", "create", "--name", "n", "--preset", "p"])
            .is_err());
    }
}
