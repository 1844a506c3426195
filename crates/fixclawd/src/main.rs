//! fixclawd - watchdog daemon
//!
//! Loads the configuration and runs the monitor loop until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use fixclaw_common::config;
use fixclaw_common::paths::expand_path;
use fixclawd::logging::{self, LogSettings};
use fixclawd::monitor::{self, MonitorOptions};
use fixclawd::Orchestrator;
use tracing::info;

#[derive(Parser)]
#[command(name = "fixclawd")]
#[command(about = "fixclaw watchdog daemon", long_about = None)]
#[command(version = fixclawd::VERSION)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "~/.fixclaw/config.toml")]
    config: String,

    /// Exit after this many cycles
    #[arg(long, hide = true)]
    cycles: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let app = config::load_config(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    let plan = app.validate().context("Invalid configuration")?;

    let _log_guard = logging::init(&LogSettings {
        dir: expand_path(&app.monitor.log_dir),
        level: app.monitor.log_level.clone(),
        max_files: app.monitor.log_max_files,
        console: true,
    })?;

    info!(
        version = fixclawd::VERSION,
        state_dir = %plan.state.root.display(),
        "fixclawd starting"
    );

    let options = MonitorOptions {
        interval: plan.interval,
        max_cycles: args.cycles,
    };
    let orchestrator = Orchestrator::new(plan);
    monitor::run(&orchestrator, options, monitor::shutdown_signal()).await;

    info!("fixclawd stopped");
    Ok(())
}
