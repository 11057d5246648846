//! Command-line interface for Mooring
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Mooring - health checks and self-healing for NFS and SMB mounts
#[derive(Parser)]
#[command(name = "mooring")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path [default: /etc/mooring/mooring.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run one check cycle: probe, repair, notify, audit
    Check {
        /// Probe and report without unmounting, mounting or notifying
        #[arg(long)]
        dry_run: bool,

        /// Log at debug level and mail the cycle's full output with the summary
        #[arg(long)]
        debug: bool,
    },

    /// Show the last-known status of each mount
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Schedule periodic checks in root's crontab
    Install {
        /// Minutes between checks (overrides the config file)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=59))]
        interval: Option<u32>,
    },

    /// Remove the scheduled check from root's crontab
    Remove,

    /// Generate shell completions
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "mooring", &mut std::io::stdout());
    }
}
