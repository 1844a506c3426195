//! Core types shared between the orchestrator and its operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Probe verdict
// ============================================================================

/// Outcome of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Target answered and reported itself healthy
    Healthy,
    /// Target answered and is positively diagnosed as unhealthy
    Unhealthy,
    /// The probe tooling itself failed; says nothing about the target
    Indeterminate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Indeterminate => "indeterminate",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Step results
// ============================================================================

/// What a step was run for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Health or status check
    Probe,
    /// Diagnostic capture (target logs) kept as evidence only
    Context,
    /// Remediation command of a repair tier
    Repair,
}

/// Classification of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    TimedOut,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed command. Output lives in the evidence files; only a bounded
/// prefix of stdout is kept in memory for interpretation and it is never
/// persisted inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Position in the owning attempt (or scratch sink), starting at 1
    pub seq: u32,
    pub kind: StepKind,
    /// Short identifier used in evidence file names ("health", "official-1")
    pub label: String,
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub timeout_ms: u64,
    /// Exit code when the process exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal when the process was killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub outcome: StepOutcome,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Set when the command could not be started at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
    /// Bounded raw stdout prefix
    #[serde(skip)]
    pub stdout_head: String,
}

impl StepResult {
    pub fn ok(&self) -> bool {
        self.outcome == StepOutcome::Success
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == StepOutcome::TimedOut
    }

    /// Human-readable command line for logs
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

// ============================================================================
// Tiers and attempts
// ============================================================================

/// Escalation tiers, in the only order they may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    Official,
    AiRestricted,
    AiUnrestricted,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::AiRestricted => "ai-restricted",
            Self::AiUnrestricted => "ai-unrestricted",
        }
    }

    pub fn is_ai(&self) -> bool {
        !matches!(self, Self::Official)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final verdict of a sealed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptVerdict {
    /// A post-tier probe reported Healthy
    Recovered,
    /// Every configured tier ran and the target is still unhealthy
    NotRecovered,
    /// The last post-tier probe could not determine health
    ProbeError,
}

impl AttemptVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::NotRecovered => "not_recovered",
            Self::ProbeError => "probe_error",
        }
    }

    /// Whether operators must be alerted
    pub fn is_alert(&self) -> bool {
        !matches!(self, Self::Recovered)
    }
}

impl fmt::Display for AttemptVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact result of one attempt, returned to callers and stored as the
/// sealing `verdict.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub id: String,
    pub dir: PathBuf,
    pub verdict: AttemptVerdict,
    /// Last tier that executed, if any did
    pub tier_reached: Option<TierKind>,
    pub tiers_run: Vec<TierKind>,
    pub step_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
