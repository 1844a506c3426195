//! Tracing setup for the daemon and the CLI
//!
//! Events go without ANSI colors to a daily-rotated file under the log
//! directory and, when `console` is set, compactly to stderr. `RUST_LOG`
//! overrides the configured level.
//!
//! Alerts are ordinary `error!` events carrying `alert = true`, so anything
//! that tails the log file can pick them up.

use anyhow::{Context, Result};
use std::path::PathBuf;
pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "fixclaw";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub level: String,
    /// Rotated files kept on disk
    pub max_files: usize,
    /// Also print events to stderr
    pub console: bool,
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered lines are lost.
pub fn init(settings: &LogSettings) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.dir)
        .with_context(|| format!("Failed to create log directory {}", settings.dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(settings.max_files.max(1))
        .build(&settings.dir)
        .context("Failed to create rolling log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(dir = %settings.dir.display(), "tracing initialized");
    Ok(guard)
}
