//! Health probe
//!
//! Runs the target's health and status commands (both, always) and turns
//! their results into a single verdict. Tooling failures (spawn errors,
//! timeouts, "command not found" style exit codes, unparsable output) are
//! Indeterminate: they say nothing about the target and never trigger repair.
//!
//! `HealthProbe` is the seam the orchestrator depends on. `CommandProbe` is
//! the real implementation; `ScriptedProbe` replays a fixed verdict sequence
//! for tests.

use async_trait::async_trait;
use chrono::Utc;
use fixclaw_common::{ProbePlan, StepKind, StepOutcome, StepPlan, StepResult, Verdict};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::EvidenceError;
use crate::evidence::{self, step_file_stem, StepSink};
use crate::runner::{CommandSpec, ProcessRunner};

/// Verdict of a single check, with the reason for the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckVerdict {
    pub label: String,
    pub verdict: Verdict,
    pub reason: String,
}

/// Combined result of one probe round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub verdict: Verdict,
    pub checks: Vec<CheckVerdict>,
    #[serde(skip)]
    pub steps: Vec<StepResult>,
}

/// Any Unhealthy wins; otherwise any Indeterminate; otherwise Healthy.
/// An empty set is Indeterminate.
pub fn combine<I: IntoIterator<Item = Verdict>>(verdicts: I) -> Verdict {
    let mut seen_any = false;
    let mut indeterminate = false;
    for v in verdicts {
        seen_any = true;
        match v {
            Verdict::Unhealthy => return Verdict::Unhealthy,
            Verdict::Indeterminate => indeterminate = true,
            Verdict::Healthy => {}
        }
    }
    if !seen_any || indeterminate {
        Verdict::Indeterminate
    } else {
        Verdict::Healthy
    }
}

// ============================================================================
// Interpreter
// ============================================================================

/// Classifies one finished check
pub trait ProbeInterpreter: Send + Sync {
    fn interpret(&self, step: &StepResult) -> (Verdict, String);
}

/// Exit-code and JSON based interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonInterpreter {
    pub require_json: bool,
    pub healthy_pointer: Option<String>,
    pub indeterminate_exit_codes: Vec<i32>,
}

impl JsonInterpreter {
    pub fn from_plan(plan: &ProbePlan) -> Self {
        Self {
            require_json: plan.require_json,
            healthy_pointer: plan.healthy_pointer.clone(),
            indeterminate_exit_codes: plan.indeterminate_exit_codes.clone(),
        }
    }
}

impl ProbeInterpreter for JsonInterpreter {
    fn interpret(&self, step: &StepResult) -> (Verdict, String) {
        if let Some(err) = &step.spawn_error {
            return (Verdict::Indeterminate, format!("could not run: {}", err));
        }
        if step.outcome == StepOutcome::TimedOut {
            return (Verdict::Indeterminate, format!("timed out after {}ms", step.timeout_ms));
        }

        let code = match step.exit_code {
            Some(code) => code,
            None => {
                return (
                    Verdict::Indeterminate,
                    format!("killed by signal {:?}", step.signal),
                )
            }
        };
        if self.indeterminate_exit_codes.contains(&code) {
            return (Verdict::Indeterminate, format!("tooling exit code {}", code));
        }
        if code != 0 {
            return (Verdict::Unhealthy, format!("exit code {}", code));
        }

        if !self.require_json && self.healthy_pointer.is_none() {
            return (Verdict::Healthy, "exit 0".to_string());
        }

        let value: serde_json::Value = match serde_json::from_str(step.stdout_head.trim()) {
            Ok(v) => v,
            Err(e) if self.require_json => {
                return (Verdict::Indeterminate, format!("stdout is not JSON: {}", e));
            }
            Err(_) => return (Verdict::Healthy, "exit 0 (non-JSON output)".to_string()),
        };

        match &self.healthy_pointer {
            None => (Verdict::Healthy, "exit 0, JSON output".to_string()),
            Some(pointer) => match value.pointer(pointer) {
                Some(serde_json::Value::Bool(true)) => (Verdict::Healthy, format!("{} is true", pointer)),
                Some(other) => (Verdict::Unhealthy, format!("{} is {}", pointer, other)),
                None => (Verdict::Indeterminate, format!("{} missing from output", pointer)),
            },
        }
    }
}

// ============================================================================
// Probe trait
// ============================================================================

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run health and status, record both into `sink`, combine the verdicts
    async fn check(&self, sink: &mut dyn StepSink) -> Result<ProbeReport, EvidenceError>;

    /// Capture the target's recent logs as context evidence
    async fn capture_logs(&self, sink: &mut dyn StepSink) -> Result<(), EvidenceError>;

    /// Command lines shown to the AI tool ("health", "status", "logs")
    fn command_lines(&self) -> (String, String, String);
}

/// Real probe: runs the configured commands through the process runner
pub struct CommandProbe {
    runner: ProcessRunner,
    plan: ProbePlan,
    interpreter: Box<dyn ProbeInterpreter>,
    cwd: Option<PathBuf>,
}

impl CommandProbe {
    pub fn new(runner: ProcessRunner, plan: ProbePlan) -> Self {
        let interpreter = Box::new(JsonInterpreter::from_plan(&plan));
        Self {
            runner,
            plan,
            interpreter,
            cwd: None,
        }
    }

    /// Run the probe commands in `dir`, if it exists
    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.cwd = dir.is_dir().then(|| dir.to_path_buf());
        self
    }

    fn command(&self, plan: &StepPlan, kind: StepKind) -> CommandSpec {
        let spec = CommandSpec::from_plan(plan, kind);
        match &self.cwd {
            Some(dir) => spec.cwd(dir),
            None => spec,
        }
    }

    pub fn with_interpreter(mut self, interpreter: Box<dyn ProbeInterpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self, sink: &mut dyn StepSink) -> Result<ProbeReport, EvidenceError> {
        let mut checks = Vec::with_capacity(2);
        let mut steps = Vec::with_capacity(2);

        for plan in [&self.plan.health, &self.plan.status] {
            let step = self.runner.run(&self.command(plan, StepKind::Probe), sink).await?;
            let (verdict, reason) = self.interpreter.interpret(&step);
            debug!(check = %plan.label, verdict = %verdict, reason = %reason, "probe check");
            checks.push(CheckVerdict {
                label: plan.label.clone(),
                verdict,
                reason,
            });
            steps.push(step);
        }

        let verdict = combine(checks.iter().map(|c| c.verdict));
        if verdict == Verdict::Indeterminate {
            warn!(checks = ?checks, "probe indeterminate");
        }
        Ok(ProbeReport { verdict, checks, steps })
    }

    async fn capture_logs(&self, sink: &mut dyn StepSink) -> Result<(), EvidenceError> {
        self.runner
            .run(&self.command(&self.plan.logs, StepKind::Context), sink)
            .await?;
        Ok(())
    }

    fn command_lines(&self) -> (String, String, String) {
        (
            self.plan.health.command_line(),
            self.plan.status.command_line(),
            self.plan.logs.command_line(),
        )
    }
}

// ============================================================================
// Scripted probe (testing)
// ============================================================================

/// Replays a fixed sequence of verdicts. The last verdict repeats once the
/// script runs out. Each check writes a small evidence file so attempts look
/// like real ones.
#[derive(Clone)]
pub struct ScriptedProbe {
    state: Arc<Mutex<Script>>,
}

struct Script {
    queue: VecDeque<Verdict>,
    last: Verdict,
    calls: usize,
}

impl ScriptedProbe {
    pub fn new(verdicts: &[Verdict]) -> Self {
        Self {
            state: Arc::new(Mutex::new(Script {
                queue: verdicts.iter().copied().collect(),
                last: Verdict::Indeterminate,
                calls: 0,
            })),
        }
    }

    /// Number of `check` calls so far
    pub fn calls(&self) -> usize {
        self.state.lock().map(|s| s.calls).unwrap_or(0)
    }

    fn next_verdict(&self) -> Verdict {
        let Ok(mut script) = self.state.lock() else {
            return Verdict::Indeterminate;
        };
        script.calls += 1;
        if let Some(v) = script.queue.pop_front() {
            script.last = v;
        }
        script.last
    }
}

fn scripted_step(sink: &mut dyn StepSink, label: &str, kind: StepKind, text: &str) -> Result<StepResult, EvidenceError> {
    let seq = sink.next_seq();
    let stem = step_file_stem(seq, label);
    let dir = sink.dir().to_path_buf();
    let stdout_path = evidence::write(&dir, &format!("{}.stdout.txt", stem), text.as_bytes())?;
    let stderr_path = evidence::write(&dir, &format!("{}.stderr.txt", stem), b"")?;
    let now = Utc::now();
    let step = StepResult {
        seq,
        kind,
        label: label.to_string(),
        argv: vec!["scripted".to_string(), label.to_string()],
        cwd: None,
        started_at: now,
        finished_at: now,
        duration_ms: 0,
        timeout_ms: 0,
        exit_code: Some(0),
        signal: None,
        outcome: StepOutcome::Success,
        stdout_path,
        stderr_path,
        spawn_error: None,
        stdout_head: text.to_string(),
    };
    sink.record(step.clone())?;
    Ok(step)
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, sink: &mut dyn StepSink) -> Result<ProbeReport, EvidenceError> {
        let verdict = self.next_verdict();
        let step = scripted_step(sink, "health", StepKind::Probe, verdict.as_str())?;
        Ok(ProbeReport {
            verdict,
            checks: vec![CheckVerdict {
                label: "health".to_string(),
                verdict,
                reason: "scripted".to_string(),
            }],
            steps: vec![step],
        })
    }

    async fn capture_logs(&self, sink: &mut dyn StepSink) -> Result<(), EvidenceError> {
        scripted_step(sink, "logs", StepKind::Context, "scripted logs")?;
        Ok(())
    }

    fn command_lines(&self) -> (String, String, String) {
        (
            "scripted health".to_string(),
            "scripted status".to_string(),
            "scripted logs".to_string(),
        )
    }
}
