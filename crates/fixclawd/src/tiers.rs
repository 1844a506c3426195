//! Repair tiers
//!
//! A tier runs its steps strictly in order, each under its own timeout, and
//! is then judged by a follow-up probe. What the steps themselves report is
//! recorded but never decides recovery.
//!
//! Official tier: the configured commands, run in the target workspace.
//! AI tiers: a single invocation of the remediation tool inside
//! `<attempt>/<tier>/`, pre-seeded with rendered `INSTRUCTIONS.md`. The
//! restricted tier passes an explicit allow-list of writable directories.

use fixclaw_common::config::AiInvocation;
use fixclaw_common::template::{self, TemplateVars};
use fixclaw_common::{StepKind, StepResult, StepTimeoutPolicy, TierKind, TierSpec, Verdict};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::EvidenceError;
use crate::evidence::{self, AttemptWriter, StepSink};
use crate::probe::HealthProbe;
use crate::runner::{CommandSpec, ProcessRunner};

/// Instructions for the restricted AI tier
pub const REPAIR_PROMPT: &str = include_str!("../prompts/repair.md");

/// Instructions for the unrestricted AI tier
pub const REPAIR_CODE_PROMPT: &str = include_str!("../prompts/repair_code.md");

pub const INSTRUCTIONS_FILE: &str = "INSTRUCTIONS.md";

/// Environment variable listing the restricted tier's writable directories
pub const WRITABLE_DIRS_ENV: &str = "FIXCLAW_WRITABLE_DIRS";

/// What the tiers need from the orchestrator
pub struct TierEnv<'a> {
    pub runner: &'a ProcessRunner,
    pub probe: &'a dyn HealthProbe,
    pub clock: &'a dyn Clock,
    pub workspace_dir: &'a Path,
    pub target_state_dir: &'a Path,
    pub orchestrator_state_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierReport {
    pub tier: TierKind,
    pub recovered: bool,
    pub post_verdict: Verdict,
    #[serde(skip)]
    pub steps: Vec<StepResult>,
    /// Why the step sequence ended before its last step
    pub stopped_early: Option<String>,
}

/// Run one tier and judge it by a fresh probe
pub async fn attempt(
    spec: &TierSpec,
    env: &TierEnv<'_>,
    attempt: &mut AttemptWriter,
) -> Result<TierReport, EvidenceError> {
    info!(tier = %spec.kind, attempt = %attempt.id(), "tier starting");

    let (steps, stopped_early, probed) = match &spec.ai {
        Some(ai) => (vec![run_ai(spec, ai, env, attempt).await?], None, None),
        None => run_official(spec, env, attempt).await?,
    };

    let post_verdict = match probed {
        Some(verdict) => verdict,
        None => {
            env.clock.sleep(spec.settle).await;
            env.probe.check(attempt).await?.verdict
        }
    };
    let recovered = post_verdict.is_healthy();

    info!(
        tier = %spec.kind,
        steps = steps.len(),
        failed = steps.iter().filter(|s| !s.ok()).count(),
        post_verdict = %post_verdict,
        recovered,
        "tier finished"
    );

    Ok(TierReport {
        tier: spec.kind,
        recovered,
        post_verdict,
        steps,
        stopped_early,
    })
}

/// Official steps. Returns the steps, the reason for stopping early, and a
/// verdict when a probe already ran after the final step.
async fn run_official(
    spec: &TierSpec,
    env: &TierEnv<'_>,
    attempt: &mut AttemptWriter,
) -> Result<(Vec<StepResult>, Option<String>, Option<Verdict>), EvidenceError> {
    let cwd = env.workspace_dir.is_dir().then(|| env.workspace_dir.to_path_buf());
    let mut steps = Vec::with_capacity(spec.steps.len());
    let mut stopped_early = None;
    let mut probed = None;

    for (idx, plan) in spec.steps.iter().enumerate() {
        probed = None;
        let mut cmd = CommandSpec::from_plan(plan, StepKind::Repair);
        if let Some(dir) = &cwd {
            cmd = cmd.cwd(dir);
        }

        let step = env.runner.run(&cmd, attempt).await?;
        let timed_out = step.timed_out();
        let failed = !step.ok();
        steps.push(step);

        let last = idx + 1 == spec.steps.len();
        if timed_out && spec.on_step_timeout == StepTimeoutPolicy::Abort {
            if !last {
                warn!(step = %plan.label, "step timed out, skipping remaining steps");
                stopped_early = Some(format!("{} timed out", plan.label));
            }
            break;
        }
        if failed && spec.fail_fast {
            if !last {
                warn!(step = %plan.label, "step failed, skipping remaining steps (fail_fast)");
                stopped_early = Some(format!("{} failed", plan.label));
            }
            break;
        }

        if spec.stop_when_healthy {
            env.clock.sleep(spec.settle).await;
            let verdict = env.probe.check(attempt).await?.verdict;
            probed = Some(verdict);
            if verdict.is_healthy() {
                if !last {
                    info!(step = %plan.label, "healthy after step, skipping remaining steps");
                    stopped_early = Some(format!("healthy after {}", plan.label));
                }
                break;
            }
        }
    }

    Ok((steps, stopped_early, probed))
}

async fn run_ai(
    spec: &TierSpec,
    ai: &AiInvocation,
    env: &TierEnv<'_>,
    attempt: &mut AttemptWriter,
) -> Result<StepResult, EvidenceError> {
    let work_dir = attempt.tier_dir(spec.kind)?;
    let instructions_path = work_dir.join(INSTRUCTIONS_FILE);
    let vars = template_vars(env, attempt.dir(), &work_dir, &instructions_path);

    let prompt = match spec.kind {
        TierKind::AiUnrestricted => REPAIR_CODE_PROMPT,
        _ => REPAIR_PROMPT,
    };
    evidence::write(&work_dir, INSTRUCTIONS_FILE, template::render(prompt, &vars).as_bytes())?;

    let argv = build_ai_argv(ai, &vars);
    warn!(tier = %spec.kind, argv = ?argv, "AI remediation starting");

    let mut cmd = CommandSpec::new(spec.kind.as_str(), StepKind::Repair, argv, spec.step_timeout)
        .cwd(&work_dir)
        .env("FIXCLAW_ATTEMPT_DIR", attempt.dir().display().to_string())
        .env("FIXCLAW_INSTRUCTIONS", instructions_path.display().to_string());
    if !ai.writable_dirs.is_empty() {
        cmd = cmd.env(WRITABLE_DIRS_ENV, join_dirs(&ai.writable_dirs));
    }

    env.runner.run(&cmd, attempt).await
}

/// `command [-m model] <rendered args> [<flag> <dir>]...`
pub fn build_ai_argv(ai: &AiInvocation, vars: &TemplateVars) -> Vec<String> {
    let mut argv = vec![ai.command.clone()];
    if let Some(model) = &ai.model {
        argv.push("-m".to_string());
        argv.push(model.clone());
    }
    argv.extend(template::render_args(&ai.args, vars));
    for dir in &ai.writable_dirs {
        argv.push(ai.writable_dir_flag.clone());
        argv.push(dir.display().to_string());
    }
    argv
}

fn join_dirs(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

fn template_vars(env: &TierEnv<'_>, attempt_dir: &Path, work_dir: &Path, instructions: &Path) -> TemplateVars {
    let (health_cmd, status_cmd, logs_cmd) = env.probe.command_lines();
    let mut vars = TemplateVars::new();
    let mut set = |k: &str, v: String| {
        vars.insert(k.to_string(), v);
    };
    set("workspace_dir", env.workspace_dir.display().to_string());
    set("state_dir", env.target_state_dir.display().to_string());
    set("orchestrator_state_dir", env.orchestrator_state_dir.display().to_string());
    set("attempt_dir", attempt_dir.display().to_string());
    set("work_dir", work_dir.display().to_string());
    set("instructions_path", instructions.display().to_string());
    set("health_cmd", health_cmd);
    set("status_cmd", status_cmd);
    set("logs_cmd", logs_cmd);
    vars
}
