//! Command handlers for fixclawctl.

use anyhow::{Context, Result};
use chrono::Utc;
use fixclaw_common::config::{self, AppConfig};
use fixclaw_common::paths::expand_path;
use fixclaw_common::{AttemptVerdict, ConfigError, OrchestratorConfig, Verdict};
use fixclawd::logging::{self, LogSettings, WorkerGuard};
use fixclawd::monitor::{self, MonitorOptions};
use fixclawd::orchestrator::StatusReport;
use fixclawd::{Orchestrator, ProbeReport, RunOutcome, SkipReason};
use owo_colors::OwoColorize;

/// Exit codes
pub const EXIT_OK: i32 = 0;
pub const EXIT_UNHEALTHY: i32 = 1;
pub const EXIT_BUSY: i32 = 2;
pub const EXIT_INDETERMINATE: i32 = 3;

const KEY_WIDTH: usize = 16;

struct Loaded {
    app: AppConfig,
    plan: OrchestratorConfig,
    _log: WorkerGuard,
}

fn load(path: &str, console: bool) -> Result<Loaded> {
    let app = config::load_config(path).map_err(|e| match e {
        ConfigError::NotFound(p) => anyhow::anyhow!(
            "No configuration at {} (run `fixclawctl init` first)",
            p.display()
        ),
        other => anyhow::Error::new(other),
    })?;
    let plan = app.validate().context("Invalid configuration")?;
    let log = logging::init(&LogSettings {
        dir: expand_path(&app.monitor.log_dir),
        level: app.monitor.log_level.clone(),
        max_files: app.monitor.log_max_files,
        console,
    })?;
    Ok(Loaded { app, plan, _log: log })
}

fn print_kv(key: &str, value: &str) {
    println!("{:width$} {}", key.dimmed(), value, width = KEY_WIDTH);
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// init
// ============================================================================

pub fn init(config_path: &str, force: bool) -> Result<i32> {
    let path = config::write_default_config(config_path, force)
        .with_context(|| format!("Failed to write configuration to {}", config_path))?;
    println!("{} wrote {}", "✓".green(), path.display());
    Ok(EXIT_OK)
}

// ============================================================================
// check
// ============================================================================

pub async fn check(config_path: &str, json: bool) -> Result<i32> {
    let loaded = load(config_path, !json)?;
    let orchestrator = Orchestrator::new(loaded.plan);
    let report = orchestrator.check_only().await?;

    if json {
        print_json(&report)?;
    } else {
        print_probe(&report);
    }
    Ok(verdict_exit_code(report.verdict))
}

pub fn verdict_exit_code(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::Healthy => EXIT_OK,
        Verdict::Unhealthy => EXIT_UNHEALTHY,
        Verdict::Indeterminate => EXIT_INDETERMINATE,
    }
}

fn print_probe(report: &ProbeReport) {
    println!();
    print_kv("verdict", &colored_verdict(report.verdict));
    for check in &report.checks {
        print_kv(
            &check.label,
            &format!("{}  {}", colored_verdict(check.verdict), check.reason.dimmed()),
        );
    }
    println!();
}

fn colored_verdict(verdict: Verdict) -> String {
    match verdict {
        Verdict::Healthy => verdict.as_str().green().to_string(),
        Verdict::Unhealthy => verdict.as_str().red().to_string(),
        Verdict::Indeterminate => verdict.as_str().yellow().to_string(),
    }
}

// ============================================================================
// repair
// ============================================================================

pub async fn repair(config_path: &str, force: bool, json: bool) -> Result<i32> {
    let loaded = load(config_path, !json)?;
    let orchestrator = Orchestrator::new(loaded.plan);
    let outcome = orchestrator.run_once(force).await?;

    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }
    Ok(outcome_exit_code(&outcome))
}

pub fn outcome_exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::AlreadyRunning { .. } => EXIT_BUSY,
        other if other.is_healthy() => EXIT_OK,
        _ => EXIT_UNHEALTHY,
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    match outcome {
        RunOutcome::NoAction { verdict } => {
            print_kv("verdict", &colored_verdict(*verdict));
            print_kv("action", "none");
        }
        RunOutcome::Skipped { verdict, skip } => {
            print_kv("verdict", &colored_verdict(*verdict));
            let reason = match skip {
                SkipReason::RepairDisabled => "repair disabled in config".to_string(),
                SkipReason::RateLimited { admission } => admission.describe(),
            };
            print_kv("action", &format!("{} ({})", "skipped".yellow(), reason));
        }
        RunOutcome::AlreadyRunning { holder } => {
            print_kv(
                "action",
                &format!(
                    "{} (pid {} on {} since {})",
                    "another instance is running".yellow(),
                    holder.pid,
                    holder.hostname,
                    holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
            );
        }
        RunOutcome::Attempted { summary } => {
            let verdict = match summary.verdict {
                AttemptVerdict::Recovered => summary.verdict.as_str().green().to_string(),
                _ => summary.verdict.as_str().red().to_string(),
            };
            print_kv("attempt", &summary.id);
            print_kv("verdict", &verdict);
            print_kv(
                "tier reached",
                summary.tier_reached.map(|t| t.as_str()).unwrap_or("none"),
            );
            print_kv("steps", &summary.step_count.to_string());
            print_kv("evidence", &summary.dir.display().to_string());
        }
    }
    println!();
}

// ============================================================================
// monitor / up
// ============================================================================

pub async fn monitor(config_path: &str) -> Result<i32> {
    let loaded = load(config_path, true)?;
    let options = MonitorOptions::every(loaded.plan.interval);
    let orchestrator = Orchestrator::new(loaded.plan);
    let stats = monitor::run(&orchestrator, options, monitor::shutdown_signal()).await;
    tracing::info!(cycles = stats.cycles, "monitor exited");
    Ok(EXIT_OK)
}

pub async fn up(config_path: &str) -> Result<i32> {
    if !expand_path(config_path).exists() {
        let path = config::write_default_config(config_path, false)?;
        println!("{} wrote default configuration to {}", "✓".green(), path.display());
    }
    monitor(config_path).await
}

// ============================================================================
// status
// ============================================================================

pub fn status(config_path: &str, json: bool, limit: usize) -> Result<i32> {
    let loaded = load(config_path, false)?;
    let orchestrator = Orchestrator::new(loaded.plan);
    let report = orchestrator.status(limit)?;

    if json {
        print_json(&report)?;
    } else {
        print_status(&loaded.app, &report);
    }
    Ok(EXIT_OK)
}

fn print_status(app: &AppConfig, report: &StatusReport) {
    println!();
    println!("{}", format!("fixclaw v{}", env!("FIXCLAW_VERSION")).bold());
    println!();

    print_kv("target", &app.target.command);
    print_kv("state dir", &expand_path(&app.monitor.state_dir).display().to_string());
    print_kv(
        "repair",
        if app.repair.enabled { "enabled" } else { "disabled" },
    );
    print_kv("ai", if app.ai.enabled { "enabled" } else { "disabled" });
    println!();

    match &report.cooldown {
        Some(state) => {
            let last = state
                .last_attempt_at()
                .map(|t| {
                    let ago = Utc::now().signed_duration_since(t);
                    format!("{} ({}m ago)", t.format("%Y-%m-%d %H:%M:%S UTC"), ago.num_minutes())
                })
                .unwrap_or_else(|| "never".to_string());
            print_kv("last attempt", &last);
            print_kv(
                "today",
                &format!(
                    "{}/{} repairs, {}/{} ai",
                    state.attempts_today,
                    app.monitor.max_repairs_per_day,
                    state.ai_attempts_today,
                    app.ai.max_attempts_per_day
                ),
            );
            if let Some(ok) = state.last_ok_at {
                print_kv("last healthy", &ok.format("%Y-%m-%d %H:%M:%S UTC").to_string());
            }
        }
        None => print_kv("last attempt", "never"),
    }

    match &report.lock_holder {
        Some(holder) => print_kv(
            "running",
            &format!("pid {} on {} since {}", holder.pid, holder.hostname, holder.acquired_at),
        ),
        None => print_kv("running", "no"),
    }
    println!();

    if report.attempts.is_empty() {
        println!("{}", "no repair attempts recorded".dimmed());
    }
    for attempt in &report.attempts {
        let (verdict, tier) = match &attempt.summary {
            Some(s) => (
                match s.verdict {
                    AttemptVerdict::Recovered => s.verdict.as_str().green().to_string(),
                    _ => s.verdict.as_str().red().to_string(),
                },
                s.tier_reached.map(|t| t.as_str()).unwrap_or("none"),
            ),
            None => ("unsealed".yellow().to_string(), "-"),
        };
        println!("  {}  {:14} {}", attempt.id, verdict, tier.dimmed());
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixclaw_common::{AttemptSummary, TierKind};
    use std::path::PathBuf;

    #[test]
    fn test_verdict_exit_codes() {
        assert_eq!(verdict_exit_code(Verdict::Healthy), 0);
        assert_eq!(verdict_exit_code(Verdict::Unhealthy), 1);
        assert_eq!(verdict_exit_code(Verdict::Indeterminate), 3);
    }

    #[test]
    fn test_outcome_exit_codes() {
        let now = Utc::now();
        let summary = |verdict| AttemptSummary {
            id: "20260101T000000Z".into(),
            dir: PathBuf::from("/tmp/a"),
            verdict,
            tier_reached: Some(TierKind::Official),
            tiers_run: vec![TierKind::Official],
            step_count: 3,
            started_at: now,
            finished_at: now,
        };

        assert_eq!(outcome_exit_code(&RunOutcome::NoAction { verdict: Verdict::Healthy }), 0);
        assert_eq!(
            outcome_exit_code(&RunOutcome::NoAction {
                verdict: Verdict::Indeterminate
            }),
            1
        );
        assert_eq!(
            outcome_exit_code(&RunOutcome::Attempted {
                summary: summary(AttemptVerdict::Recovered)
            }),
            0
        );
        assert_eq!(
            outcome_exit_code(&RunOutcome::Attempted {
                summary: summary(AttemptVerdict::NotRecovered)
            }),
            1
        );
        assert_eq!(
            outcome_exit_code(&RunOutcome::Skipped {
                verdict: Verdict::Unhealthy,
                skip: SkipReason::RepairDisabled
            }),
            1
        );
    }
}
