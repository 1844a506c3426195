//! End-to-end orchestrator scenarios against a temporary state directory.
//!
//! Probes are scripted unless a test needs real commands; repair steps are
//! real `sh` invocations so the runner, evidence and tier paths are exercised.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fixclaw_common::{AppConfig, AttemptVerdict, TierKind, Verdict};
use fixclawd::cooldown::CooldownTracker;
use fixclawd::evidence::StepSink;
use fixclawd::lock::LockAttempt;
use fixclawd::{
    Admission, Clock, CommandProbe, EvidenceError, HealthProbe, InstanceLock, ManualClock, Orchestrator,
    ProbeReport, ProcessRunner, RunOutcome, ScriptedProbe, SkipReason,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use Verdict::{Healthy, Indeterminate, Unhealthy};

struct Harness {
    temp: TempDir,
    config: AppConfig,
    clock: ManualClock,
}

impl Harness {
    fn new(official: &[&str]) -> Self {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("workspace");
        fs::create_dir_all(&workspace).unwrap();

        let mut config = AppConfig::default();
        config.monitor.state_dir = temp.path().join("state").display().to_string();
        config.target.state_dir = temp.path().join("target").display().to_string();
        config.target.workspace_dir = workspace.display().to_string();
        config.repair.official_steps = official
            .iter()
            .map(|s| vec!["sh".to_string(), "-c".to_string(), s.to_string()])
            .collect();
        config.repair.post_step_wait_seconds = 0;
        config.repair.step_timeout_seconds = 10;

        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        Self { temp, config, clock }
    }

    /// Enable the AI tiers with a command that drops a marker in the workspace
    fn with_ai(mut self) -> Self {
        self.config.ai.enabled = true;
        self.config.ai.allow_unrestricted = true;
        self.config.ai.command = "sh".into();
        self.config.ai.args = vec!["-c".into(), "touch $workspace_dir/ai-ran".into()];
        self.config.ai.args_unrestricted = self.config.ai.args.clone();
        self.config.ai.timeout_seconds = 10;
        self
    }

    fn orchestrator(&self, probe: Arc<ScriptedProbe>) -> Orchestrator {
        Orchestrator::with_parts(
            self.config.validate().unwrap(),
            ProcessRunner::default(),
            probe,
            Arc::new(self.clock.clone()),
        )
    }

    fn workspace(&self) -> PathBuf {
        self.temp.path().join("workspace")
    }

    fn state(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    fn attempts(&self) -> PathBuf {
        self.state().join("attempts")
    }
}

fn scripted(verdicts: &[Verdict]) -> Arc<ScriptedProbe> {
    Arc::new(ScriptedProbe::new(verdicts))
}

fn attempted(outcome: RunOutcome) -> fixclaw_common::AttemptSummary {
    match outcome {
        RunOutcome::Attempted { summary } => summary,
        other => panic!("expected an attempt, got {:?}", other),
    }
}

fn attempt_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

// ============================================================================
// Probing and confirmation
// ============================================================================

#[tokio::test]
async fn test_healthy_takes_no_action() {
    let h = Harness::new(&["touch official-ran"]);
    let probe = scripted(&[Healthy]);
    let orch = h.orchestrator(probe.clone());

    let outcome = orch.run_once(false).await.unwrap();
    assert_eq!(outcome, RunOutcome::NoAction { verdict: Healthy });
    assert!(outcome.is_healthy());
    assert_eq!(probe.calls(), 1);
    assert!(!h.attempts().exists());
    assert!(!h.workspace().join("official-ran").exists());
    // Lock released
    assert!(!h.state().join("fixclaw.lock").exists());
}

#[tokio::test]
async fn test_indeterminate_never_escalates() {
    let h = Harness::new(&["touch official-ran"]);
    let orch = h.orchestrator(scripted(&[Indeterminate]));

    for _ in 0..3 {
        let outcome = orch.run_once(false).await.unwrap();
        assert_eq!(outcome, RunOutcome::NoAction { verdict: Indeterminate });
    }
    assert!(!h.attempts().exists());
    assert!(!h.workspace().join("official-ran").exists());
}

#[tokio::test]
async fn test_single_unhealthy_is_not_confirmed() {
    let h = Harness::new(&["touch official-ran"]);
    let probe = scripted(&[Unhealthy, Healthy]);
    let orch = h.orchestrator(probe.clone());

    let outcome = orch.run_once(false).await.unwrap();
    assert_eq!(outcome, RunOutcome::NoAction { verdict: Healthy });
    assert_eq!(probe.calls(), 2);
    assert!(!h.attempts().exists());
}

#[tokio::test]
async fn test_check_only_leaves_no_trace() {
    let h = Harness::new(&[]);
    let orch = h.orchestrator(scripted(&[Unhealthy]));

    let report = orch.check_only().await.unwrap();
    assert_eq!(report.verdict, Unhealthy);
    assert!(!h.attempts().exists());
    assert!(!h.state().join("cooldown.json").exists());
    assert!(!h.state().join("fixclaw.lock").exists());
}

// ============================================================================
// Escalation
// ============================================================================

#[tokio::test]
async fn test_official_recovers_without_ai() {
    let h = Harness::new(&["touch official-ran"]).with_ai();
    let probe = scripted(&[Unhealthy, Unhealthy, Healthy]);
    let orch = h.orchestrator(probe.clone());

    let summary = attempted(orch.run_once(false).await.unwrap());
    assert_eq!(summary.verdict, AttemptVerdict::Recovered);
    assert_eq!(summary.tier_reached, Some(TierKind::Official));
    assert_eq!(summary.tiers_run, vec![TierKind::Official]);

    assert!(h.workspace().join("official-ran").exists());
    assert!(!h.workspace().join("ai-ran").exists());
    assert!(summary.dir.join("verdict.json").exists());
    assert!(summary.dir.join("attempt.json").exists());
    assert_eq!(probe.calls(), 3);
}

#[tokio::test]
async fn test_official_failure_without_ai_alerts() {
    let h = Harness::new(&["echo broken >&2; exit 1"]);
    let orch = h.orchestrator(scripted(&[Unhealthy]));

    let summary = attempted(orch.run_once(false).await.unwrap());
    assert_eq!(summary.verdict, AttemptVerdict::NotRecovered);
    assert!(summary.verdict.is_alert());
    assert_eq!(summary.tier_reached, Some(TierKind::Official));

    // Step evidence is kept, stderr included
    let stderr: Vec<_> = fs::read_dir(&summary.dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with("official-1.stderr.txt"))
        .collect();
    assert_eq!(stderr.len(), 1);
    let content = fs::read_to_string(summary.dir.join(&stderr[0])).unwrap();
    assert!(content.contains("broken"));
}

#[tokio::test]
async fn test_escalates_to_ai_after_official() {
    let h = Harness::new(&["exit 1"]).with_ai();
    // Confirmations, post-official, post-restricted
    let probe = scripted(&[Unhealthy, Unhealthy, Unhealthy, Healthy]);
    let orch = h.orchestrator(probe.clone());

    let summary = attempted(orch.run_once(false).await.unwrap());
    assert_eq!(summary.verdict, AttemptVerdict::Recovered);
    assert_eq!(summary.tier_reached, Some(TierKind::AiRestricted));
    assert_eq!(summary.tiers_run, vec![TierKind::Official, TierKind::AiRestricted]);
    assert!(h.workspace().join("ai-ran").exists());
    assert!(summary.dir.join("ai-restricted/INSTRUCTIONS.md").exists());
}

#[tokio::test]
async fn test_ai_budget_skips_ai_tiers() {
    let mut h = Harness::new(&["exit 1"]).with_ai();
    h.config.ai.max_attempts_per_day = 0;
    let orch = h.orchestrator(scripted(&[Unhealthy]));

    let summary = attempted(orch.run_once(false).await.unwrap());
    assert_eq!(summary.verdict, AttemptVerdict::NotRecovered);
    assert_eq!(summary.tiers_run, vec![TierKind::Official]);
    assert!(!h.workspace().join("ai-ran").exists());
}

#[tokio::test]
async fn test_indeterminate_after_repair_is_probe_error() {
    let h = Harness::new(&["true"]);
    let orch = h.orchestrator(scripted(&[Unhealthy, Unhealthy, Indeterminate]));

    let summary = attempted(orch.run_once(false).await.unwrap());
    assert_eq!(summary.verdict, AttemptVerdict::ProbeError);
    assert!(summary.verdict.is_alert());
}

#[tokio::test]
async fn test_repair_disabled_is_skipped() {
    let mut h = Harness::new(&["touch official-ran"]);
    h.config.repair.enabled = false;
    let orch = h.orchestrator(scripted(&[Unhealthy]));

    let outcome = orch.run_once(false).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Skipped {
            verdict: Unhealthy,
            skip: SkipReason::RepairDisabled
        }
    );
    assert!(!h.workspace().join("official-ran").exists());
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn test_cooldown_interval_and_daily_ceiling() {
    let mut h = Harness::new(&["exit 1"]);
    h.config.monitor.repair_cooldown_seconds = 300;
    h.config.monitor.max_repairs_per_day = 2;
    let orch = h.orchestrator(scripted(&[Unhealthy]));

    attempted(orch.run_once(false).await.unwrap());

    // Inside the interval
    h.clock.advance(Duration::from_secs(60));
    match orch.run_once(false).await.unwrap() {
        RunOutcome::Skipped {
            skip: SkipReason::RateLimited { admission },
            ..
        } => assert!(matches!(admission, Admission::Cooldown { .. })),
        other => panic!("expected cooldown skip, got {:?}", other),
    }

    // After the interval
    h.clock.advance(Duration::from_secs(301));
    attempted(orch.run_once(false).await.unwrap());

    // Ceiling reached; force does not lift it
    h.clock.advance(Duration::from_secs(301));
    for force in [false, true] {
        match orch.run_once(force).await.unwrap() {
            RunOutcome::Skipped {
                skip: SkipReason::RateLimited { admission },
                ..
            } => assert!(matches!(admission, Admission::DailyLimit { .. })),
            other => panic!("expected daily limit, got {:?}", other),
        }
    }
    assert_eq!(attempt_count(&h.attempts()), 2);

    // Next UTC day
    h.clock.set(Utc.with_ymd_and_hms(2026, 5, 5, 0, 0, 1).unwrap());
    attempted(orch.run_once(false).await.unwrap());
    assert_eq!(attempt_count(&h.attempts()), 3);
}

#[tokio::test]
async fn test_force_bypasses_interval() {
    let h = Harness::new(&["exit 1"]);
    let orch = h.orchestrator(scripted(&[Unhealthy]));

    attempted(orch.run_once(false).await.unwrap());
    h.clock.advance(Duration::from_secs(5));
    assert!(matches!(orch.run_once(false).await.unwrap(), RunOutcome::Skipped { .. }));
    attempted(orch.run_once(true).await.unwrap());
}

#[tokio::test]
async fn test_counter_survives_crash_after_increment() {
    let h = Harness::new(&["touch official-ran"]);
    let plan = h.config.validate().unwrap();

    // A previous process counted an attempt and died before finishing
    let tracker = CooldownTracker::new(&plan.state.cooldown_file, plan.cooldown);
    tracker.record_start(h.clock.now()).unwrap();

    let orch = h.orchestrator(scripted(&[Unhealthy]));
    assert!(matches!(
        orch.run_once(false).await.unwrap(),
        RunOutcome::Skipped {
            skip: SkipReason::RateLimited { .. },
            ..
        }
    ));
    assert!(!h.workspace().join("official-ran").exists());
}

/// Reports Unhealthy; log capture never completes
struct HangingLogsProbe;

#[async_trait]
impl HealthProbe for HangingLogsProbe {
    async fn check(&self, _sink: &mut dyn StepSink) -> Result<ProbeReport, EvidenceError> {
        Ok(ProbeReport {
            verdict: Unhealthy,
            checks: Vec::new(),
            steps: Vec::new(),
        })
    }

    async fn capture_logs(&self, _sink: &mut dyn StepSink) -> Result<(), EvidenceError> {
        std::future::pending().await
    }

    fn command_lines(&self) -> (String, String, String) {
        ("health".into(), "status".into(), "logs".into())
    }
}

#[tokio::test]
async fn test_attempt_counted_before_log_capture() {
    let h = Harness::new(&["touch official-ran"]);
    let plan = h.config.validate().unwrap();
    let tracker = CooldownTracker::new(&plan.state.cooldown_file, plan.cooldown);
    let orch = Orchestrator::with_parts(
        plan,
        ProcessRunner::default(),
        Arc::new(HangingLogsProbe),
        Arc::new(h.clock.clone()),
    );

    // Interrupted while capturing logs
    let interrupted = tokio::time::timeout(Duration::from_millis(300), orch.run_once(false)).await;
    assert!(interrupted.is_err());
    assert_eq!(attempt_count(&h.attempts()), 1);
    assert_eq!(tracker.peek().unwrap().unwrap().attempts_today, 1);
    assert!(!h.workspace().join("official-ran").exists());

    // The interrupted attempt still holds off the next one
    let orch = h.orchestrator(scripted(&[Unhealthy]));
    assert!(matches!(
        orch.run_once(false).await.unwrap(),
        RunOutcome::Skipped {
            skip: SkipReason::RateLimited { .. },
            ..
        }
    ));
}

// ============================================================================
// Single instance
// ============================================================================

#[tokio::test]
async fn test_held_lock_reports_already_running() {
    let h = Harness::new(&["touch official-ran"]);
    let plan = h.config.validate().unwrap();
    let lock = InstanceLock::new(&plan.state.lock_file);
    fs::create_dir_all(h.state()).unwrap();
    let _guard = match lock.try_acquire(Utc::now()).unwrap() {
        LockAttempt::Acquired(g) => g,
        LockAttempt::Held(_) => panic!("lock should be free"),
    };

    let probe = scripted(&[Unhealthy]);
    let orch = h.orchestrator(probe.clone());
    match orch.run_once(false).await.unwrap() {
        RunOutcome::AlreadyRunning { holder } => assert_eq!(holder.pid, std::process::id()),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(probe.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_invocations_single_winner() {
    let h = Harness::new(&["sleep 1"]);
    let a = Arc::new(h.orchestrator(scripted(&[Unhealthy])));
    let b = Arc::new(h.orchestrator(scripted(&[Unhealthy])));

    let ta = tokio::spawn({
        let a = Arc::clone(&a);
        async move { a.run_once(false).await }
    });
    let tb = tokio::spawn({
        let b = Arc::clone(&b);
        async move { b.run_once(false).await }
    });
    let outcomes = [ta.await.unwrap().unwrap(), tb.await.unwrap().unwrap()];

    let busy = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::AlreadyRunning { .. }))
        .count();
    let ran = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::Attempted { .. }))
        .count();
    assert_eq!(busy, 1);
    assert_eq!(ran, 1);
    assert_eq!(attempt_count(&h.attempts()), 1);
}

// ============================================================================
// Real probe commands
// ============================================================================

#[tokio::test]
async fn test_command_probe_end_to_end() {
    let mut h = Harness::new(&[]);
    let marker = h.temp.path().join("healed");
    let check = format!(
        "test -f {} && echo '{{\"ok\": true}}' || {{ echo '{{\"ok\": false}}'; exit 1; }}",
        marker.display()
    );
    h.config.target.command = "sh".into();
    h.config.target.health_args = vec!["-c".into(), check.clone()];
    h.config.target.status_args = vec!["-c".into(), check];
    h.config.target.logs_args = vec!["-c".into(), "echo gateway log line token=abc123secret".into()];
    h.config.repair.official_steps = vec![vec![
        "sh".into(),
        "-c".into(),
        format!("touch {}", marker.display()),
    ]];

    let plan = h.config.validate().unwrap();
    let runner = ProcessRunner::default();
    let probe = Arc::new(CommandProbe::new(runner.clone(), plan.probe.clone()));
    let orch = Orchestrator::with_parts(plan, runner, probe, Arc::new(h.clock.clone()));

    assert_eq!(orch.check_only().await.unwrap().verdict, Unhealthy);

    let summary = attempted(orch.run_once(false).await.unwrap());
    assert_eq!(summary.verdict, AttemptVerdict::Recovered);
    assert_eq!(summary.tier_reached, Some(TierKind::Official));
    assert!(marker.exists());

    assert_eq!(orch.check_only().await.unwrap().verdict, Healthy);
    assert!(orch.run_once(false).await.unwrap().is_healthy());
}
