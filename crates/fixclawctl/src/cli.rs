//! CLI - Command-line argument parsing
//!
//! Keeps argument parsing separate from execution in `commands`.

use clap::{Parser, Subcommand};
use fixclaw_common::paths::DEFAULT_CONFIG_PATH;

/// fixclaw control CLI
#[derive(Parser)]
#[command(name = "fixclawctl")]
#[command(about = "fixclaw - self-healing watchdog for OpenClaw", long_about = None)]
#[command(version = env!("FIXCLAW_VERSION"))]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Probe the target once (exit 0 healthy, 1 unhealthy, 3 indeterminate)
    Check {
        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Probe and repair if needed (exit 0 healthy, 1 not recovered or skipped, 2 busy)
    Repair {
        /// Ignore the cooldown interval (the daily limit still applies)
        #[arg(long)]
        force: bool,

        /// Output JSON only
        #[arg(long)]
        json: bool,
    },

    /// Run the monitor loop in the foreground
    Monitor,

    /// Create the configuration if missing, then monitor
    Up,

    /// Show cooldown state, lock holder and recent attempts
    Status {
        /// Output JSON only
        #[arg(long)]
        json: bool,

        /// Number of attempts to list
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}
