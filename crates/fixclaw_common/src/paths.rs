//! Path helpers for fixclaw
//!
//! Config values may use `~`, `$VAR` and `${VAR}`; they are expanded and
//! made absolute once, at load time.

use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default config location
pub const DEFAULT_CONFIG_PATH: &str = "~/.fixclaw/config.toml";

/// Default orchestrator state directory
pub const DEFAULT_STATE_DIR: &str = "~/.fixclaw";

/// File names inside the orchestrator state directory
pub const COOLDOWN_FILE: &str = "cooldown.json";
pub const LOCK_FILE: &str = "fixclaw.lock";
pub const ATTEMPTS_DIR: &str = "attempts";
pub const SCRATCH_DIR: &str = "scratch";

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").expect("static regex")
});

/// Expand `~` and environment variables. Unset variables are left as-is.
pub fn expand(value: &str) -> String {
    let with_vars = ENV_VAR
        .replace_all(value, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned();

    if with_vars == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    } else if let Some(rest) = with_vars.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }

    with_vars
}

/// Expand and make absolute (relative paths resolve against the cwd)
pub fn expand_path(value: &str) -> PathBuf {
    let expanded = PathBuf::from(expand(value));
    std::path::absolute(&expanded).unwrap_or(expanded)
}

/// Paths of the orchestrator's own durable artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
    pub cooldown_file: PathBuf,
    pub lock_file: PathBuf,
    pub attempts_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl StatePaths {
    pub fn with_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cooldown_file: root.join(COOLDOWN_FILE),
            lock_file: root.join(LOCK_FILE),
            attempts_dir: root.join(ATTEMPTS_DIR),
            scratch_dir: root.join(SCRATCH_DIR),
        }
    }
}
