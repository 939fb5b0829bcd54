//! CLI command definitions using clap.
//!
//! - create: store a new run for an issue
//! - process: drive one run to REVIEWING or FAILED
//! - work: drain every pending run with the worker pool
//! - retry / review: move a run out of CI_RUNNING or REVIEWING
//! - status / logs: inspect the store

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// patchrun - turn tracked issues into reviewed pull requests
#[derive(Parser, Debug)]
#[command(name = "patchrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a run for an issue
    Create {
        /// Repository locator (https URL, ssh URL or owner/name)
        repo_url: String,

        /// Issue number
        #[arg(short, long)]
        issue: i64,

        /// Model override for this run
        #[arg(short, long)]
        model: Option<String>,

        /// Iteration budget for this run
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Process the run immediately
        #[arg(long)]
        now: bool,
    },

    /// Process one run by id
    Process {
        run_id: String,
    },

    /// Process every NEW or NEEDS_FIX run
    Work {
        /// Worker count (defaults to workers.count)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Send the latest run for an issue back for a fix
    Retry {
        repo_url: String,

        #[arg(short, long)]
        issue: i64,
    },

    /// Ask the reviewer for a verdict on a REVIEWING run
    Review {
        run_id: String,

        /// Pull request summary handed to the reviewer
        #[arg(short, long, default_value = "")]
        summary: String,
    },

    /// Show one run, or list all runs
    Status {
        run_id: Option<String>,
    },

    /// Show the audit log of a run
    Logs {
        run_id: String,

        /// Include event payloads
        #[arg(short, long)]
        payload: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["patchrun"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["patchrun", "status", "-v", "-c", "/tmp/p.yml"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.yml")));
    }

    #[test]
    fn test_create() {
        let cli = Cli::try_parse_from([
            "patchrun",
            "create",
            "acme/widgets",
            "--issue",
            "42",
            "--max-iterations",
            "3",
            "--now",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                repo_url,
                issue,
                model,
                max_iterations,
                now,
            } => {
                assert_eq!(repo_url, "acme/widgets");
                assert_eq!(issue, 42);
                assert!(model.is_none());
                assert_eq!(max_iterations, Some(3));
                assert!(now);
            }
            other => panic!("Expected create, got {:?}", other),
        }
    }

    #[test]
    fn test_create_requires_issue() {
        assert!(Cli::try_parse_from(["patchrun", "create", "acme/widgets"]).is_err());
    }

    #[test]
    fn test_work_and_retry() {
        let cli = Cli::try_parse_from(["patchrun", "work", "-w", "4"]).unwrap();
        assert!(matches!(cli.command, Commands::Work { workers: Some(4) }));

        let cli = Cli::try_parse_from(["patchrun", "retry", "acme/widgets", "-i", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Retry { issue: 7, .. }));
    }

    #[test]
    fn test_status_optional_id() {
        let cli = Cli::try_parse_from(["patchrun", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { run_id: None }));
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }
}
