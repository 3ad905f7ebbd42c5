//! Command line interface
//!
//! The binary builds an [`App`] and calls [`run`]. The `worker` command is
//! how the supervisor starts workers and is hidden from help.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::app::App;
use crate::commands;
use crate::config::DEFAULT_CONFIG_PATH;
use crate::logging;

#[derive(Parser, Debug)]
#[command(name = "jobd")]
#[command(about = "Job-queue worker daemon")]
pub struct Args {
    /// Configuration file
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the daemon
    Start {
        /// Stay attached to the terminal
        #[arg(long, short = 'f')]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show whether the daemon is running
    Status,

    #[command(hide = true)]
    Worker {
        /// Take over from a restarting worker
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

/// Parse the process arguments and run the selected command
pub fn run(app: App) -> Result<(), Box<dyn std::error::Error>> {
    run_with(Args::parse(), app)
}

pub fn run_with(args: Args, app: App) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Start { foreground } => commands::start(&args.config, foreground, &app),
        Command::Stop => {
            logging::init_terminal("info");
            commands::stop(&args.config)
        }
        Command::Status => {
            logging::init_terminal("warn");
            commands::status(&args.config)
        }
        Command::Worker { snapshot } => commands::worker(&args.config, snapshot, app),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["jobd", "start"]).unwrap();
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(matches!(args.command, Command::Start { foreground: false }));
    }

    #[test]
    fn test_worker_snapshot() {
        let args = Args::try_parse_from([
            "jobd",
            "worker",
            "--config",
            "/etc/other.toml",
            "--snapshot",
            "/tmp/jobd_restart_1",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/other.toml"));
        match args.command {
            Command::Worker { snapshot } => {
                assert_eq!(snapshot, Some(PathBuf::from("/tmp/jobd_restart_1")))
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_config_after_command() {
        let args = Args::try_parse_from(["jobd", "status", "-c", "/tmp/jobd.toml"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/tmp/jobd.toml"));
        assert!(matches!(args.command, Command::Status));
    }
}
