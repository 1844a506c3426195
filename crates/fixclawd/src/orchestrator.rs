//! Recovery orchestrator
//!
//! One invocation (`run_once`) walks this state machine:
//!
//! ```text
//! lock -> probe -> (healthy | indeterminate: done)
//!      -> confirm unhealthy -> admission (enabled, cooldown, daily ceiling)
//!      -> count the attempt, open it, adopt probe evidence, capture logs
//!      -> tier[0] -> probe -> (healthy: sealed Recovered)
//!      -> tier[1] -> probe -> ...
//!      -> sealed NotRecovered / ProbeError + alert
//! ```
//!
//! Escalation is decided only from the post-tier probe. The attempt is
//! counted against the rate limits before any tier runs, so a crash mid-repair
//! still consumes budget. The lock guard is released on every exit path.

use fixclaw_common::{AttemptSummary, AttemptVerdict, OrchestratorConfig, TierKind, Verdict};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::cooldown::{Admission, CooldownState, CooldownTracker};
use crate::error::OrchestratorError;
use crate::evidence::{AttemptListing, EvidenceStore, TierRecord};
use crate::lock::{InstanceLock, LockAttempt, LockInfo};
use crate::probe::{CommandProbe, HealthProbe, ProbeReport};
use crate::runner::{ProcessRunner, RunnerOptions};
use crate::tiers::{self, TierEnv};

/// Why a confirmed-unhealthy target was left alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    RepairDisabled,
    RateLimited { admission: Admission },
}

/// Result of one invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Healthy, or Indeterminate (which never escalates)
    NoAction { verdict: Verdict },
    /// Unhealthy but repair was not allowed to start
    Skipped { verdict: Verdict, skip: SkipReason },
    /// Another orchestrator holds the lock
    AlreadyRunning { holder: LockInfo },
    Attempted { summary: AttemptSummary },
}

impl RunOutcome {
    /// Target healthy at the end of the invocation
    pub fn is_healthy(&self) -> bool {
        match self {
            Self::NoAction { verdict } => verdict.is_healthy(),
            Self::Attempted { summary } => summary.verdict == AttemptVerdict::Recovered,
            _ => false,
        }
    }
}

/// Snapshot for `fixclawctl status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub cooldown: Option<CooldownState>,
    pub lock_holder: Option<LockInfo>,
    pub attempts: Vec<AttemptListing>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    runner: ProcessRunner,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    evidence: EvidenceStore,
    cooldown: CooldownTracker,
    lock: InstanceLock,
}

impl Orchestrator {
    /// Production wiring: real commands, wall clock
    pub fn new(config: OrchestratorConfig) -> Self {
        let runner = ProcessRunner::new(RunnerOptions {
            stdout_prefix_bytes: config.probe.stdout_prefix_bytes,
            ..RunnerOptions::default()
        });
        let probe = Arc::new(
            CommandProbe::new(runner.clone(), config.probe.clone()).in_dir(&config.workspace_dir),
        );
        Self::with_parts(config, runner, probe, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: OrchestratorConfig,
        runner: ProcessRunner,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let evidence = EvidenceStore::new(&config.state);
        let cooldown = CooldownTracker::new(&config.state.cooldown_file, config.cooldown);
        let lock = InstanceLock::new(&config.state.lock_file);
        Self {
            config,
            runner,
            probe,
            clock,
            evidence,
            cooldown,
            lock,
        }
    }

    /// Probe once. No lock, no counters, no attempt directory.
    pub async fn check_only(&self) -> Result<ProbeReport, OrchestratorError> {
        let mut scratch = self.evidence.scratch()?;
        Ok(self.probe.check(&mut scratch).await?)
    }

    /// Read-only view of the durable state
    pub fn status(&self, recent: usize) -> Result<StatusReport, OrchestratorError> {
        Ok(StatusReport {
            cooldown: self.cooldown.peek()?,
            lock_holder: self.lock.holder()?,
            attempts: self.evidence.list_attempts(recent)?,
        })
    }

    /// One full probe/repair cycle. `force` skips the cooldown interval but
    /// not the daily ceiling.
    pub async fn run_once(&self, force: bool) -> Result<RunOutcome, OrchestratorError> {
        let _guard = match self.lock.try_acquire(self.clock.now())? {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Held(holder) => {
                info!(pid = holder.pid, host = %holder.hostname, "another instance is running, skipping");
                return Ok(RunOutcome::AlreadyRunning { holder });
            }
        };

        // Probing
        let mut scratch = self.evidence.scratch()?;
        let mut unhealthy = 0;
        loop {
            let report = self.probe.check(&mut scratch).await?;
            match report.verdict {
                Verdict::Healthy => {
                    if unhealthy > 0 {
                        info!(after = unhealthy, "unhealthy verdict not confirmed, target healthy");
                    } else {
                        info!("target healthy");
                    }
                    self.cooldown.record_ok(self.clock.now())?;
                    return Ok(RunOutcome::NoAction {
                        verdict: Verdict::Healthy,
                    });
                }
                Verdict::Indeterminate => {
                    warn!(checks = ?report.checks, "probe indeterminate, not escalating");
                    return Ok(RunOutcome::NoAction {
                        verdict: Verdict::Indeterminate,
                    });
                }
                Verdict::Unhealthy => {
                    unhealthy += 1;
                    if unhealthy >= self.config.unhealthy_confirmations {
                        break;
                    }
                    info!(
                        seen = unhealthy,
                        needed = self.config.unhealthy_confirmations,
                        "target unhealthy, confirming"
                    );
                    self.clock.sleep(self.config.confirm_delay).await;
                }
            }
        }
        warn!(confirmations = unhealthy, "target unhealthy (confirmed)");

        // Admission
        if !self.config.repair_enabled {
            warn!(suppressed = true, "repair disabled, not attempting");
            return Ok(RunOutcome::Skipped {
                verdict: Verdict::Unhealthy,
                skip: SkipReason::RepairDisabled,
            });
        }
        let admission = self.cooldown.admit(self.clock.now(), force)?;
        if !admission.is_admitted() {
            warn!(suppressed = true, reason = %admission.describe(), "repair suppressed by rate limit");
            return Ok(RunOutcome::Skipped {
                verdict: Verdict::Unhealthy,
                skip: SkipReason::RateLimited { admission },
            });
        }

        // Attempt, counted before anything can fail or be cancelled
        let started_at = self.clock.now();
        let counted = self.cooldown.record_start(started_at)?;
        let mut attempt = self.evidence.begin_attempt(started_at)?;
        attempt.adopt(scratch)?;
        info!(
            attempt = %attempt.id(),
            attempts_today = counted.attempts_today,
            max_per_day = self.config.cooldown.max_per_day,
            force,
            "repair attempt started"
        );
        self.probe.capture_logs(&mut attempt).await?;

        let env = TierEnv {
            runner: &self.runner,
            probe: self.probe.as_ref(),
            clock: self.clock.as_ref(),
            workspace_dir: &self.config.workspace_dir,
            target_state_dir: &self.config.target_state_dir,
            orchestrator_state_dir: &self.config.state.root,
        };

        let mut tier_reached = None;
        let mut last_post = None;
        let mut recovered = false;

        for spec in &self.config.tiers.tiers {
            if spec.kind.is_ai() {
                let admission = self.cooldown.admit_ai(self.clock.now())?;
                if !admission.is_admitted() {
                    warn!(tier = %spec.kind, reason = %admission.describe(), "AI tier skipped");
                    attempt.note_tier(TierRecord::skipped(spec.kind, admission.describe()))?;
                    continue;
                }
                self.cooldown.record_ai_start(self.clock.now())?;
            }

            let report = tiers::attempt(spec, &env, &mut attempt).await?;
            tier_reached = Some(spec.kind);
            last_post = Some(report.post_verdict);
            attempt.note_tier(TierRecord {
                tier: spec.kind,
                skipped: None,
                post_verdict: Some(report.post_verdict),
                recovered: report.recovered,
                stopped_early: report.stopped_early.clone(),
                steps: report.steps.iter().map(|s| s.seq).collect(),
            })?;

            if report.recovered {
                recovered = true;
                break;
            }
        }

        let verdict = seal_verdict(recovered, last_post);
        let finished_at = self.clock.now();
        let summary = attempt.seal(verdict, tier_reached, finished_at)?;
        self.report(&summary, last_post);

        self.cooldown.record_finish(finished_at)?;
        if recovered {
            self.cooldown.record_ok(finished_at)?;
        }

        Ok(RunOutcome::Attempted { summary })
    }

    fn report(&self, summary: &AttemptSummary, last_post: Option<Verdict>) {
        let tier = summary.tier_reached.map(|t| t.as_str()).unwrap_or("none");
        if summary.verdict.is_alert() {
            error!(
                alert = true,
                attempt = %summary.id,
                verdict = %summary.verdict,
                tier_reached = tier,
                last_probe = ?last_post,
                dir = %summary.dir.display(),
                "repair exhausted all tiers without recovery"
            );
        } else {
            info!(
                attempt = %summary.id,
                tier_reached = tier,
                duration_s = (summary.finished_at - summary.started_at).num_seconds(),
                "target recovered"
            );
        }
    }

    /// Sleep on the orchestrator's clock
    pub async fn sleep(&self, duration: std::time::Duration) {
        self.clock.sleep(duration).await
    }

    /// Tiers enabled by configuration, in order
    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.config.tiers.kinds()
    }
}

/// Final verdict once the tier walk ends
pub fn seal_verdict(recovered: bool, last_post: Option<Verdict>) -> AttemptVerdict {
    if recovered {
        AttemptVerdict::Recovered
    } else if last_post == Some(Verdict::Indeterminate) {
        AttemptVerdict::ProbeError
    } else {
        AttemptVerdict::NotRecovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_verdict() {
        assert_eq!(seal_verdict(true, Some(Verdict::Healthy)), AttemptVerdict::Recovered);
        assert_eq!(seal_verdict(false, Some(Verdict::Unhealthy)), AttemptVerdict::NotRecovered);
        assert_eq!(seal_verdict(false, Some(Verdict::Indeterminate)), AttemptVerdict::ProbeError);
        // Every tier refused by its budget
        assert_eq!(seal_verdict(false, None), AttemptVerdict::NotRecovered);
    }
}
