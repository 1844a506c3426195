//! Repair rate limiting
//!
//! `cooldown.json` holds the timestamps and per-UTC-day counters that bound
//! how often repairs (and, separately, AI tiers) may start. All updates go
//! through a load + compare-and-swap loop, so two processes can never lose an
//! increment. Day rollover is applied on read by normalizing the record; it
//! is idempotent and only persisted together with the next update.
//!
//! A corrupt record is moved aside and replaced by one that starts the
//! cooldown now. Starting from zero would let a damaged file unlock a burst
//! of repairs.

use chrono::{DateTime, NaiveDate, Utc};
use fixclaw_common::{CooldownPolicy, DurableRecord, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error};

const MAX_CAS_ROUNDS: u32 = 64;

/// Contents of `cooldown.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownState {
    #[serde(default)]
    pub last_attempt_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt_finished_at: Option<DateTime<Utc>>,
    /// Repair attempts started on `day`
    #[serde(default)]
    pub attempts_today: u32,
    /// UTC date the counter belongs to
    #[serde(default)]
    pub day: Option<NaiveDate>,
    /// Last Healthy verdict seen by the orchestrator
    #[serde(default)]
    pub last_ok_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ai_attempts_today: u32,
    #[serde(default)]
    pub ai_day: Option<NaiveDate>,
    #[serde(default)]
    pub last_ai_at: Option<DateTime<Utc>>,
}

impl CooldownState {
    /// Reset the daily counters if they belong to another UTC day
    pub fn normalized(mut self, today: NaiveDate) -> Self {
        if self.day != Some(today) {
            self.day = Some(today);
            self.attempts_today = 0;
        }
        if self.ai_day != Some(today) {
            self.ai_day = Some(today);
            self.ai_attempts_today = 0;
        }
        self
    }

    /// The later of last start and last finish
    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        match (self.last_attempt_started_at, self.last_attempt_finished_at) {
            (Some(s), Some(f)) => Some(s.max(f)),
            (s, f) => s.or(f),
        }
    }
}

/// Whether a repair (or AI tier) may start now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    Cooldown {
        remaining_seconds: u64,
        last_attempt_at: DateTime<Utc>,
    },
    DailyLimit {
        attempts_today: u32,
        max_per_day: u32,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Admitted => "admitted".to_string(),
            Self::Cooldown {
                remaining_seconds, ..
            } => format!("cooldown active, {}s remaining", remaining_seconds),
            Self::DailyLimit {
                attempts_today,
                max_per_day,
            } => format!("daily limit reached ({}/{})", attempts_today, max_per_day),
        }
    }
}

fn check(
    now: DateTime<Utc>,
    last: Option<DateTime<Utc>>,
    min_interval: Duration,
    count: u32,
    max: u32,
    force: bool,
) -> Admission {
    if count >= max {
        return Admission::DailyLimit {
            attempts_today: count,
            max_per_day: max,
        };
    }
    if force {
        return Admission::Admitted;
    }
    if let Some(last) = last {
        // A timestamp in the future counts as "just now"
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed < min_interval {
            let remaining = min_interval - elapsed;
            return Admission::Cooldown {
                remaining_seconds: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0),
                last_attempt_at: last,
            };
        }
    }
    Admission::Admitted
}

/// Durable cooldown tracker over `cooldown.json`
#[derive(Debug, Clone)]
pub struct CooldownTracker {
    record: DurableRecord<CooldownState>,
    policy: CooldownPolicy,
}

impl CooldownTracker {
    pub fn new(path: &Path, policy: CooldownPolicy) -> Self {
        Self {
            record: DurableRecord::new(path),
            policy,
        }
    }

    /// Raw record without repair of corruption, for status display
    pub fn peek(&self) -> Result<Option<CooldownState>, StoreError> {
        self.record.load()
    }

    /// Current state with day rollover applied
    pub fn state(&self, now: DateTime<Utc>) -> Result<CooldownState, StoreError> {
        Ok(self.load(now)?.unwrap_or_default().normalized(now.date_naive()))
    }

    /// May a repair attempt start? `force` skips the interval, never the
    /// daily ceiling.
    pub fn admit(&self, now: DateTime<Utc>, force: bool) -> Result<Admission, StoreError> {
        let state = self.state(now)?;
        Ok(check(
            now,
            state.last_attempt_at(),
            self.policy.min_interval,
            state.attempts_today,
            self.policy.max_per_day,
            force,
        ))
    }

    /// May an AI tier run within the current attempt?
    pub fn admit_ai(&self, now: DateTime<Utc>) -> Result<Admission, StoreError> {
        let state = self.state(now)?;
        Ok(check(
            now,
            state.last_ai_at,
            self.policy.ai_min_interval,
            state.ai_attempts_today,
            self.policy.ai_max_per_day,
            false,
        ))
    }

    pub fn record_start(&self, now: DateTime<Utc>) -> Result<CooldownState, StoreError> {
        self.update(now, |s| {
            s.attempts_today = s.attempts_today.saturating_add(1);
            s.last_attempt_started_at = Some(now);
        })
    }

    pub fn record_finish(&self, now: DateTime<Utc>) -> Result<CooldownState, StoreError> {
        self.update(now, |s| s.last_attempt_finished_at = Some(now))
    }

    pub fn record_ok(&self, now: DateTime<Utc>) -> Result<CooldownState, StoreError> {
        self.update(now, |s| s.last_ok_at = Some(now))
    }

    pub fn record_ai_start(&self, now: DateTime<Utc>) -> Result<CooldownState, StoreError> {
        self.update(now, |s| {
            s.ai_attempts_today = s.ai_attempts_today.saturating_add(1);
            s.last_ai_at = Some(now);
        })
    }

    fn update<F>(&self, now: DateTime<Utc>, apply: F) -> Result<CooldownState, StoreError>
    where
        F: Fn(&mut CooldownState),
    {
        for _ in 0..MAX_CAS_ROUNDS {
            let current = self.load(now)?;
            let mut next = current.clone().unwrap_or_default().normalized(now.date_naive());
            apply(&mut next);
            if self.record.compare_and_swap(current.as_ref(), Some(&next))? {
                return Ok(next);
            }
            debug!("cooldown record changed concurrently, retrying");
        }
        Err(StoreError::Contention {
            path: self.record.path().to_path_buf(),
            attempts: MAX_CAS_ROUNDS,
        })
    }

    /// Load, replacing a corrupt record with a conservative one
    fn load(&self, now: DateTime<Utc>) -> Result<Option<CooldownState>, StoreError> {
        match self.record.load() {
            Ok(state) => Ok(state),
            Err(e) if e.is_corrupt() => {
                error!(
                    path = %self.record.path().display(),
                    error = %e,
                    "cooldown record corrupted, quarantining and restarting cooldown"
                );
                self.record.quarantine(&now.format("%Y%m%dT%H%M%SZ").to_string())?;
                let conservative = CooldownState {
                    last_attempt_started_at: Some(now),
                    ..CooldownState::default()
                }
                .normalized(now.date_naive());
                // Someone else may have written a fresh record meanwhile
                self.record.compare_and_swap(None, Some(&conservative))?;
                self.record.load()
            }
            Err(e) => Err(e),
        }
    }
}
