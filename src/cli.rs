//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cnat - run a command at a given time
#[derive(Parser, Debug)]
#[command(name = "cnat")]
#[command(version)]
#[command(about = "Run a command once at a scheduled time, the Kubernetes way")]
#[command(
    long_about = "cnat reconciles scheduled tasks: each task waits for its schedule, launches a one-shot execution unit running its command, and is marked DONE once the unit terminates."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller locally against tasks from a manifest
    Run {
        /// YAML manifest listing the tasks
        #[arg(short, long)]
        manifest: PathBuf,

        /// TOML controller configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Exit once every task is DONE
        #[arg(long, default_value_t = false)]
        exit_when_done: bool,

        /// Restarts allowed for a failing command before it is reported failed
        #[arg(long, default_value_t = 3)]
        max_restarts: u32,
    },

    /// Show how long until a schedule elapses
    Schedule {
        /// Timestamp in YYYY-MM-DDTHH:MM:SSZ form
        timestamp: String,
    },

    /// Print the execution units a manifest would create
    Render {
        /// YAML manifest listing the tasks
        #[arg(short, long)]
        manifest: PathBuf,

        /// TOML controller configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["cnat", "run", "-m", "tasks.yaml", "--exit-when-done"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Run {
                exit_when_done: true,
                max_restarts: 3,
                config: None,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_schedule() {
        let cli = Cli::try_parse_from(["cnat", "schedule", "2030-01-01T00:00:00Z"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Schedule { timestamp }) if timestamp == "2030-01-01T00:00:00Z"
        ));
    }
}
