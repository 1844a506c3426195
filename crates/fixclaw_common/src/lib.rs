//! fixclaw common - configuration, durable records and shared types
//!
//! Everything here is synchronous and free of process management; the
//! orchestrator core lives in `fixclawd`.

pub mod config;
pub mod durable;
pub mod error;
pub mod fsio;
pub mod paths;
pub mod redact;
pub mod template;
pub mod types;

pub use config::{
    AppConfig, CooldownPolicy, OrchestratorConfig, ProbePlan, StepPlan, StepTimeoutPolicy, TierPlan,
    TierSpec,
};
pub use durable::DurableRecord;
pub use error::{ConfigError, StoreError};
pub use paths::StatePaths;
pub use types::*;
