//! CLI interface for Forge
//!
//! This module provides the command-line interface using clap's derive API.
//! It is a thin host over `AgentService` and the memory store.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Forge code-generation agent
///
/// Plans a programming task, writes and runs code for each step, and repairs
/// failures until every step succeeds or runs out of attempts.
#[derive(Parser, Debug)]
#[command(name = "forge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a task to completion and print its report
    Run {
        /// Natural-language description of the task
        task: String,
    },

    /// Show the status of a task
    Status {
        /// Task ID
        task_id: String,
    },

    /// Show the full record of a task
    Result {
        /// Task ID
        task_id: String,
    },

    /// Show recent tasks
    History {
        /// Number of tasks to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the version log of a task
    Versions {
        /// Task ID
        task_id: String,
    },

    /// Print the artifacts of a task up to and including one step
    Rollback {
        /// Task ID
        task_id: String,
        /// Step ID to roll back to
        step_id: String,
    },

    /// Show the most common error kinds
    Errors {
        /// Number of error kinds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Find past experiences similar to a text
    Similar {
        /// Text to compare against
        text: String,
        /// Number of results
        #[arg(short, default_value = "5")]
        k: usize,
    },

    /// Run system diagnostics
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["forge", "--json", "--log", "debug", "doctor"]);
        assert!(cli.json);
        assert_eq!(cli.log.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Doctor));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["forge", "history", "--config", "/tmp/forge.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/forge.toml")));
        assert!(!cli.json);
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["forge", "run", "print the first ten primes"]);
        if let Command::Run { task } = cli.command {
            assert_eq!(task, "print the first ten primes");
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_history_default_limit() {
        let cli = Cli::parse_from(["forge", "history"]);
        if let Command::History { limit } = cli.command {
            assert_eq!(limit, 10);
        } else {
            panic!("Expected History command");
        }
    }

    #[test]
    fn test_rollback_command() {
        let cli = Cli::parse_from(["forge", "rollback", "task-1", "step-2"]);
        if let Command::Rollback { task_id, step_id } = cli.command {
            assert_eq!(task_id, "task-1");
            assert_eq!(step_id, "step-2");
        } else {
            panic!("Expected Rollback command");
        }
    }

    #[test]
    fn test_similar_command() {
        let cli = Cli::parse_from(["forge", "similar", "parse a csv file", "-k", "3"]);
        if let Command::Similar { text, k } = cli.command {
            assert_eq!(text, "parse a csv file");
            assert_eq!(k, 3);
        } else {
            panic!("Expected Similar command");
        }
    }

    #[test]
    fn test_errors_limit() {
        let cli = Cli::parse_from(["forge", "errors", "--limit", "3"]);
        assert!(matches!(cli.command, Command::Errors { limit: 3 }));
    }
}
