//! fixclawd - self-healing watchdog for an OpenClaw installation
//!
//! Probes the target, and when it is confirmed unhealthy walks an escalating
//! set of repair tiers (official commands, then optional AI remediation),
//! keeping a durable evidence trail for every attempt.

pub mod clock;
pub mod cooldown;
pub mod error;
pub mod evidence;
pub mod lock;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod probe;
pub mod procinfo;
pub mod runner;
pub mod tiers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cooldown::{Admission, CooldownState, CooldownTracker};
pub use error::{EvidenceError, OrchestratorError};
pub use evidence::{AttemptListing, EvidenceStore};
pub use lock::{InstanceLock, LockInfo};
pub use monitor::{MonitorOptions, MonitorStats};
pub use orchestrator::{Orchestrator, RunOutcome, SkipReason, StatusReport};
pub use probe::{CommandProbe, HealthProbe, ProbeReport, ScriptedProbe};
pub use runner::{CommandSpec, ProcessRunner, RunnerOptions};

/// Version embedded in both binaries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
