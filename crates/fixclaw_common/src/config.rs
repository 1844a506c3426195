//! Configuration management for fixclaw.
//!
//! Loads settings from `~/.fixclaw/config.toml` (or `--config`). Every field
//! has a default, so an empty file is a valid configuration. The raw
//! `AppConfig` keeps paths exactly as written; `validate()` expands them and
//! produces the plain `OrchestratorConfig` the core consumes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::fsio;
use crate::paths::{self, StatePaths};
use crate::template::{self, TemplateVars};
use crate::types::TierKind;

/// Placeholders available to AI argument templates and instruction documents
pub const TEMPLATE_VARS: &[&str] = &[
    "workspace_dir",
    "state_dir",
    "orchestrator_state_dir",
    "attempt_dir",
    "work_dir",
    "instructions_path",
    "health_cmd",
    "status_cmd",
    "logs_cmd",
];

/// Official steps whose first word is this name run the configured target
/// command instead, so a relocated binary needs only `target.command` changed.
pub const TARGET_COMMAND_ALIAS: &str = "openclaw";

// ============================================================================
// [monitor]
// ============================================================================

/// Loop cadence, rate limits and the orchestrator's own state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitor cycles
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Timeout for each health/status/logs command
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Minimum seconds between two repair attempts
    #[serde(default = "default_repair_cooldown")]
    pub repair_cooldown_seconds: u64,

    /// Ceiling on repair attempts started per UTC day
    #[serde(default = "default_max_repairs_per_day")]
    pub max_repairs_per_day: u32,

    /// Consecutive Unhealthy verdicts required before repairing
    #[serde(default = "default_unhealthy_confirmations")]
    pub unhealthy_confirmations: u32,

    /// Pause between confirmation probes
    #[serde(default = "default_confirm_delay")]
    pub confirm_delay_seconds: u64,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Filter directive; RUST_LOG wins when set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Rotated daily log files to keep
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,
}

fn default_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_repair_cooldown() -> u64 {
    300
}

fn default_max_repairs_per_day() -> u32 {
    6
}

fn default_unhealthy_confirmations() -> u32 {
    2
}

fn default_confirm_delay() -> u64 {
    5
}

fn default_state_dir() -> String {
    paths::DEFAULT_STATE_DIR.to_string()
}

fn default_log_dir() -> String {
    "~/.fixclaw/logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_files() -> usize {
    7
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            repair_cooldown_seconds: default_repair_cooldown(),
            max_repairs_per_day: default_max_repairs_per_day(),
            unhealthy_confirmations: default_unhealthy_confirmations(),
            confirm_delay_seconds: default_confirm_delay(),
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            log_max_files: default_log_max_files(),
        }
    }
}

// ============================================================================
// [target]
// ============================================================================

/// The managed service and how to query it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_command")]
    pub command: String,

    #[serde(default = "default_target_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,

    #[serde(default = "default_health_args")]
    pub health_args: Vec<String>,

    #[serde(default = "default_status_args")]
    pub status_args: Vec<String>,

    #[serde(default = "default_logs_args")]
    pub logs_args: Vec<String>,
}

fn default_target_command() -> String {
    "openclaw".to_string()
}

fn default_target_state_dir() -> String {
    "~/.openclaw".to_string()
}

fn default_workspace_dir() -> String {
    "~/.openclaw/workspace".to_string()
}

fn default_health_args() -> Vec<String> {
    strings(&["gateway", "health", "--json"])
}

fn default_status_args() -> Vec<String> {
    strings(&["gateway", "status", "--json"])
}

fn default_logs_args() -> Vec<String> {
    strings(&["logs", "--tail", "200"])
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            command: default_target_command(),
            state_dir: default_target_state_dir(),
            workspace_dir: default_workspace_dir(),
            health_args: default_health_args(),
            status_args: default_status_args(),
            logs_args: default_logs_args(),
        }
    }
}

// ============================================================================
// [probe]
// ============================================================================

/// How probe output is interpreted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Exit 0 with non-JSON stdout counts as indeterminate
    #[serde(default = "default_true")]
    pub require_json: bool,

    /// JSON pointer (e.g. "/ok") that must resolve to `true` when set
    #[serde(default)]
    pub healthy_pointer: Option<String>,

    /// Exit codes that mean the probe tooling failed, not the target
    #[serde(default = "default_indeterminate_exit_codes")]
    pub indeterminate_exit_codes: Vec<i32>,

    /// Raw stdout bytes kept in memory for interpretation
    #[serde(default = "default_stdout_prefix_bytes")]
    pub stdout_prefix_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_indeterminate_exit_codes() -> Vec<i32> {
    vec![124, 126, 127]
}

fn default_stdout_prefix_bytes() -> usize {
    256 * 1024
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            require_json: true,
            healthy_pointer: None,
            indeterminate_exit_codes: default_indeterminate_exit_codes(),
            stdout_prefix_bytes: default_stdout_prefix_bytes(),
        }
    }
}

// ============================================================================
// [repair]
// ============================================================================

/// What a tier does when one of its steps times out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTimeoutPolicy {
    /// Record the timeout and run the remaining steps
    #[default]
    Continue,
    /// Skip the remaining steps and go straight to the post-tier probe
    Abort,
}

/// Official (vendor-provided) repair commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_official_steps")]
    pub official_steps: Vec<Vec<String>>,

    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Settle time after each step before probing
    #[serde(default = "default_post_step_wait")]
    pub post_step_wait_seconds: u64,

    /// Stop the tier at the first non-zero exit
    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub on_step_timeout: StepTimeoutPolicy,

    /// Probe after every official step and stop once healthy
    #[serde(default)]
    pub stop_when_healthy: bool,
}

fn default_official_steps() -> Vec<Vec<String>> {
    vec![
        strings(&["openclaw", "doctor", "--repair"]),
        strings(&["openclaw", "gateway", "restart"]),
    ]
}

fn default_step_timeout() -> u64 {
    600
}

fn default_post_step_wait() -> u64 {
    2
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            official_steps: default_official_steps(),
            step_timeout_seconds: default_step_timeout(),
            post_step_wait_seconds: default_post_step_wait(),
            fail_fast: false,
            on_step_timeout: StepTimeoutPolicy::Continue,
            stop_when_healthy: false,
        }
    }
}

// ============================================================================
// [ai]
// ============================================================================

/// AI-assisted remediation tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_ai_command")]
    pub command: String,

    /// Restricted-tier arguments; writable dirs are appended automatically
    #[serde(default = "default_ai_args")]
    pub args: Vec<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_ai_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_ai_max_per_day")]
    pub max_attempts_per_day: u32,

    #[serde(default = "default_ai_cooldown")]
    pub cooldown_seconds: u64,

    /// Permit the tier without a write allow-list
    #[serde(default)]
    pub allow_unrestricted: bool,

    #[serde(default = "default_ai_args_unrestricted")]
    pub args_unrestricted: Vec<String>,

    /// Flag that introduces each writable directory
    #[serde(default = "default_writable_dir_flag")]
    pub writable_dir_flag: String,
}

fn default_ai_command() -> String {
    "codex".to_string()
}

fn default_ai_args() -> Vec<String> {
    strings(&[
        "exec",
        "-s",
        "workspace-write",
        "-c",
        "approval_policy=\"never\"",
        "--skip-git-repo-check",
        "-C",
        "$workspace_dir",
        "Follow the instructions in $instructions_path",
    ])
}

fn default_ai_args_unrestricted() -> Vec<String> {
    strings(&[
        "exec",
        "-s",
        "danger-full-access",
        "-c",
        "approval_policy=\"never\"",
        "--skip-git-repo-check",
        "-C",
        "$workspace_dir",
        "Follow the instructions in $instructions_path",
    ])
}

fn default_ai_timeout() -> u64 {
    1800
}

fn default_ai_max_per_day() -> u32 {
    2
}

fn default_ai_cooldown() -> u64 {
    3600
}

fn default_writable_dir_flag() -> String {
    "--add-dir".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_ai_command(),
            args: default_ai_args(),
            model: None,
            timeout_seconds: default_ai_timeout(),
            max_attempts_per_day: default_ai_max_per_day(),
            cooldown_seconds: default_ai_cooldown(),
            allow_unrestricted: false,
            args_unrestricted: default_ai_args_unrestricted(),
            writable_dir_flag: default_writable_dir_flag(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub repair: RepairConfig,

    #[serde(default)]
    pub ai: AiConfig,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Load configuration from `path` (`~` and env vars expanded)
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let path = paths::expand_path(path);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::NotFound(path)),
        Err(e) => return Err(ConfigError::Read { path, source: e }),
    };

    let config: AppConfig =
        toml::from_str(&content).map_err(|e| ConfigError::Parse { path: path.clone(), source: e })?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Commented default configuration written by `fixclawctl init`
pub const DEFAULT_CONFIG_TOML: &str = r#"# fixclaw configuration
# Paths accept ~, $VAR and ${VAR}.

[monitor]
interval_seconds = 60
probe_timeout_seconds = 15
# Minimum time between two repair attempts
repair_cooldown_seconds = 300
# Ceiling on repair attempts per UTC day
max_repairs_per_day = 6
# Consecutive unhealthy probes required before repairing
unhealthy_confirmations = 2
confirm_delay_seconds = 5
state_dir = "~/.fixclaw"
log_dir = "~/.fixclaw/logs"
log_level = "info"
log_max_files = 7

[target]
command = "openclaw"
state_dir = "~/.openclaw"
workspace_dir = "~/.openclaw/workspace"
health_args = ["gateway", "health", "--json"]
status_args = ["gateway", "status", "--json"]
logs_args = ["logs", "--tail", "200"]

[probe]
require_json = true
# healthy_pointer = "/ok"
indeterminate_exit_codes = [124, 126, 127]
stdout_prefix_bytes = 262144

[repair]
enabled = true
official_steps = [
  ["openclaw", "doctor", "--repair"],
  ["openclaw", "gateway", "restart"],
]
step_timeout_seconds = 600
post_step_wait_seconds = 2
fail_fast = false
# "continue" or "abort"
on_step_timeout = "continue"
stop_when_healthy = false

[ai]
enabled = false
command = "codex"
args = [
  "exec",
  "-s", "workspace-write",
  "-c", "approval_policy=\"never\"",
  "--skip-git-repo-check",
  "-C", "$workspace_dir",
  "Follow the instructions in $instructions_path",
]
# model = "gpt-5"
timeout_seconds = 1800
max_attempts_per_day = 2
cooldown_seconds = 3600
allow_unrestricted = false
args_unrestricted = [
  "exec",
  "-s", "danger-full-access",
  "-c", "approval_policy=\"never\"",
  "--skip-git-repo-check",
  "-C", "$workspace_dir",
  "Follow the instructions in $instructions_path",
]
writable_dir_flag = "--add-dir"
"#;

/// Write the default config to `path`. Refuses to overwrite unless `force`.
pub fn write_default_config(path: &str, force: bool) -> Result<PathBuf, ConfigError> {
    let path = paths::expand_path(path);
    if path.exists() && !force {
        return Err(ConfigError::Invalid(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }

    fsio::atomic_write_str(&path, DEFAULT_CONFIG_TOML).map_err(|e| ConfigError::Write {
        path: path.clone(),
        source: e,
    })?;
    info!(path = %path.display(), "wrote default config");
    Ok(path)
}

// ============================================================================
// Validated plan
// ============================================================================

/// One command with its timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub label: String,
    pub argv: Vec<String>,
    pub timeout: Duration,
}

impl StepPlan {
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Probe commands and interpretation rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePlan {
    pub health: StepPlan,
    pub status: StepPlan,
    /// Context capture, not part of the verdict
    pub logs: StepPlan,
    pub require_json: bool,
    pub healthy_pointer: Option<String>,
    pub indeterminate_exit_codes: Vec<i32>,
    pub stdout_prefix_bytes: usize,
}

/// Repair rate limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub min_interval: Duration,
    pub max_per_day: u32,
    pub ai_min_interval: Duration,
    pub ai_max_per_day: u32,
}

/// How an AI tier invokes the remediation tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiInvocation {
    pub command: String,
    pub model: Option<String>,
    /// Argument templates, rendered per attempt
    pub args: Vec<String>,
    /// Write allow-list; empty for the unrestricted tier
    pub writable_dirs: Vec<PathBuf>,
    pub writable_dir_flag: String,
}

/// One escalation tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSpec {
    pub kind: TierKind,
    /// Official steps; empty for AI tiers, whose single step is built from `ai`
    pub steps: Vec<StepPlan>,
    pub ai: Option<AiInvocation>,
    pub step_timeout: Duration,
    pub fail_fast: bool,
    pub on_step_timeout: StepTimeoutPolicy,
    pub settle: Duration,
    pub stop_when_healthy: bool,
}

/// Enabled tiers, in escalation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPlan {
    pub tiers: Vec<TierSpec>,
}

impl TierPlan {
    pub fn get(&self, kind: TierKind) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.kind == kind)
    }

    pub fn kinds(&self) -> Vec<TierKind> {
        self.tiers.iter().map(|t| t.kind).collect()
    }
}

/// Everything the orchestrator needs, validated and with paths expanded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub state: StatePaths,
    pub target_state_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub interval: Duration,
    pub unhealthy_confirmations: u32,
    pub confirm_delay: Duration,
    pub repair_enabled: bool,
    pub probe: ProbePlan,
    pub cooldown: CooldownPolicy,
    pub tiers: TierPlan,
}

impl AppConfig {
    /// Check invariants and build the orchestrator's plan
    pub fn validate(&self) -> Result<OrchestratorConfig, ConfigError> {
        let m = &self.monitor;
        if m.interval_seconds == 0 {
            return Err(invalid("monitor.interval_seconds must be > 0"));
        }
        if m.probe_timeout_seconds == 0 {
            return Err(invalid("monitor.probe_timeout_seconds must be > 0"));
        }
        if m.unhealthy_confirmations == 0 {
            return Err(invalid("monitor.unhealthy_confirmations must be >= 1"));
        }
        if self.target.command.trim().is_empty() {
            return Err(invalid("target.command must not be empty"));
        }
        if self.repair.step_timeout_seconds == 0 {
            return Err(invalid("repair.step_timeout_seconds must be > 0"));
        }
        if self.probe.stdout_prefix_bytes == 0 {
            return Err(invalid("probe.stdout_prefix_bytes must be > 0"));
        }
        if let Some(pointer) = &self.probe.healthy_pointer {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(invalid("probe.healthy_pointer must be empty or start with '/'"));
            }
        }

        let state_dir = paths::expand_path(&m.state_dir);
        let target_state_dir = paths::expand_path(&self.target.state_dir);
        let workspace_dir = paths::expand_path(&self.target.workspace_dir);
        let probe_timeout = Duration::from_secs(m.probe_timeout_seconds);

        let target_step = |label: &str, args: &[String]| StepPlan {
            label: label.to_string(),
            argv: std::iter::once(self.target.command.clone())
                .chain(args.iter().cloned())
                .collect(),
            timeout: probe_timeout,
        };

        let probe = ProbePlan {
            health: target_step("health", &self.target.health_args),
            status: target_step("status", &self.target.status_args),
            logs: target_step("logs", &self.target.logs_args),
            require_json: self.probe.require_json,
            healthy_pointer: self.probe.healthy_pointer.clone().filter(|p| !p.is_empty()),
            indeterminate_exit_codes: self.probe.indeterminate_exit_codes.clone(),
            stdout_prefix_bytes: self.probe.stdout_prefix_bytes,
        };

        let cooldown = CooldownPolicy {
            min_interval: Duration::from_secs(m.repair_cooldown_seconds),
            max_per_day: m.max_repairs_per_day,
            ai_min_interval: Duration::from_secs(self.ai.cooldown_seconds),
            ai_max_per_day: self.ai.max_attempts_per_day,
        };

        let tiers = self.tier_plan(&state_dir, &target_state_dir, &workspace_dir)?;

        Ok(OrchestratorConfig {
            state: StatePaths::with_root(&state_dir),
            target_state_dir,
            workspace_dir,
            interval: Duration::from_secs(m.interval_seconds),
            unhealthy_confirmations: m.unhealthy_confirmations,
            confirm_delay: Duration::from_secs(m.confirm_delay_seconds),
            repair_enabled: self.repair.enabled,
            probe,
            cooldown,
            tiers,
        })
    }

    fn tier_plan(
        &self,
        state_dir: &Path,
        target_state_dir: &Path,
        workspace_dir: &Path,
    ) -> Result<TierPlan, ConfigError> {
        let r = &self.repair;
        let step_timeout = Duration::from_secs(r.step_timeout_seconds);
        let settle = Duration::from_secs(r.post_step_wait_seconds);

        let mut steps = Vec::with_capacity(r.official_steps.len());
        for (idx, step) in r.official_steps.iter().enumerate() {
            let Some(first) = step.first() else {
                return Err(invalid(&format!("repair.official_steps[{}] is empty", idx)));
            };
            let program = if first == TARGET_COMMAND_ALIAS {
                self.target.command.clone()
            } else {
                first.clone()
            };
            steps.push(StepPlan {
                label: format!("official-{}", idx + 1),
                argv: std::iter::once(program).chain(step[1..].iter().cloned()).collect(),
                timeout: step_timeout,
            });
        }

        let mut tiers = vec![TierSpec {
            kind: TierKind::Official,
            steps,
            ai: None,
            step_timeout,
            fail_fast: r.fail_fast,
            on_step_timeout: r.on_step_timeout,
            settle,
            stop_when_healthy: r.stop_when_healthy,
        }];

        let ai = &self.ai;
        if !ai.enabled {
            return Ok(TierPlan { tiers });
        }

        if ai.command.trim().is_empty() {
            return Err(invalid("ai.command must not be empty"));
        }
        if ai.timeout_seconds == 0 {
            return Err(invalid("ai.timeout_seconds must be > 0"));
        }
        check_placeholders("ai.args", &ai.args)?;

        let ai_timeout = Duration::from_secs(ai.timeout_seconds);
        let ai_tier = |kind: TierKind, invocation: AiInvocation| TierSpec {
            kind,
            steps: Vec::new(),
            ai: Some(invocation),
            step_timeout: ai_timeout,
            fail_fast: false,
            on_step_timeout: StepTimeoutPolicy::Continue,
            settle,
            stop_when_healthy: false,
        };

        tiers.push(ai_tier(
            TierKind::AiRestricted,
            AiInvocation {
                command: ai.command.clone(),
                model: ai.model.clone().filter(|m| !m.is_empty()),
                args: ai.args.clone(),
                writable_dirs: vec![
                    target_state_dir.to_path_buf(),
                    workspace_dir.to_path_buf(),
                    state_dir.to_path_buf(),
                ],
                writable_dir_flag: ai.writable_dir_flag.clone(),
            },
        ));

        if ai.allow_unrestricted {
            if ai.args_unrestricted.is_empty() {
                return Err(invalid(
                    "ai.args_unrestricted must not be empty when allow_unrestricted = true",
                ));
            }
            check_placeholders("ai.args_unrestricted", &ai.args_unrestricted)?;
            tiers.push(ai_tier(
                TierKind::AiUnrestricted,
                AiInvocation {
                    command: ai.command.clone(),
                    model: ai.model.clone().filter(|m| !m.is_empty()),
                    args: ai.args_unrestricted.clone(),
                    writable_dirs: Vec::new(),
                    writable_dir_flag: ai.writable_dir_flag.clone(),
                },
            ));
        }

        Ok(TierPlan { tiers })
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

fn check_placeholders(field: &str, args: &[String]) -> Result<(), ConfigError> {
    let known: TemplateVars = TEMPLATE_VARS
        .iter()
        .map(|name| (name.to_string(), String::new()))
        .collect();
    let unknown: Vec<String> = args
        .iter()
        .flat_map(|arg| template::unknown_placeholders(arg, &known))
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} uses unknown placeholders: {}",
            field,
            unknown.join(", ")
        )))
    }
}
