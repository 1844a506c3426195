//! Monitor loop
//!
//! Calls `run_once` on a fixed interval until shutdown. A failed cycle is
//! logged and the loop keeps going; only the shutdown future ends it.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::orchestrator::{Orchestrator, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub interval: Duration,
    /// Stop after this many cycles (tests, `--cycles`)
    pub max_cycles: Option<u64>,
}

impl MonitorOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_cycles: None,
        }
    }
}

/// Counters for one monitor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub cycles: u64,
    pub healthy: u64,
    pub indeterminate: u64,
    pub skipped: u64,
    pub busy: u64,
    pub attempts: u64,
    pub recovered: u64,
    pub errors: u64,
}

impl MonitorStats {
    fn count(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::NoAction { verdict } if verdict.is_healthy() => self.healthy += 1,
            RunOutcome::NoAction { .. } => self.indeterminate += 1,
            RunOutcome::Skipped { .. } => self.skipped += 1,
            RunOutcome::AlreadyRunning { .. } => self.busy += 1,
            RunOutcome::Attempted { .. } => {
                self.attempts += 1;
                if outcome.is_healthy() {
                    self.recovered += 1;
                }
            }
        }
    }
}

/// Run until `shutdown` resolves (or `max_cycles` is reached)
pub async fn run<F>(orchestrator: &Orchestrator, options: MonitorOptions, shutdown: F) -> MonitorStats
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut stats = MonitorStats::default();

    info!(
        interval_s = options.interval.as_secs(),
        tiers = ?orchestrator.tier_kinds(),
        "monitor started"
    );

    loop {
        let cycle = orchestrator.run_once(false);
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested during cycle");
                break;
            }
            result = cycle => {
                stats.cycles += 1;
                match result {
                    Ok(outcome) => stats.count(&outcome),
                    Err(e) => {
                        stats.errors += 1;
                        error!(error = %e, "monitor cycle failed");
                    }
                }
            }
        }

        if options.max_cycles.is_some_and(|max| stats.cycles >= max) {
            break;
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = orchestrator.sleep(options.interval) => {}
        }
    }

    info!(
        cycles = stats.cycles,
        attempts = stats.attempts,
        recovered = stats.recovered,
        errors = stats.errors,
        "monitor stopped"
    );
    stats
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::probe::ScriptedProbe;
    use crate::runner::ProcessRunner;
    use chrono::Utc;
    use fixclaw_common::{AppConfig, Verdict};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn orchestrator(temp: &TempDir, probe: ScriptedProbe) -> Orchestrator {
        let mut config = AppConfig::default();
        config.monitor.state_dir = temp.path().join("state").display().to_string();
        config.repair.enabled = false;
        Orchestrator::with_parts(
            config.validate().unwrap(),
            ProcessRunner::default(),
            Arc::new(probe),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    #[tokio::test]
    async fn test_monitor_counts_cycles() {
        let temp = TempDir::new().unwrap();
        let probe = ScriptedProbe::new(&[Verdict::Healthy, Verdict::Indeterminate, Verdict::Healthy]);
        let orch = orchestrator(&temp, probe.clone());

        let options = MonitorOptions {
            interval: Duration::from_secs(60),
            max_cycles: Some(3),
        };
        let stats = run(&orch, options, std::future::pending()).await;

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.indeterminate, 1);
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(&temp, ScriptedProbe::new(&[Verdict::Healthy]));

        let stats = run(&orch, MonitorOptions::every(Duration::from_secs(60)), async {}).await;
        assert!(stats.cycles <= 1);
    }
}
