//! Single-instance lock
//!
//! `fixclaw.lock` records who is currently probing or repairing. It is a
//! durable record updated only by compare-and-swap, so two processes can
//! never both take it. A holder is considered gone only when the kernel says
//! so (ESRCH) or the pid now belongs to a process with a different start
//! time; age alone never makes a lock stale.
//!
//! The guard releases the lock on drop. If the process dies without
//! unwinding, the record stays behind and the next run reclaims it after
//! verifying the holder is gone.

use chrono::{DateTime, Utc};
use fixclaw_common::{DurableRecord, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::OrchestratorError;
use crate::procinfo::{self, Liveness};

const MAX_ACQUIRE_ROUNDS: u32 = 8;

/// Contents of the lock record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    /// Kernel start time of `pid` (clock ticks since boot, Linux only)
    #[serde(default)]
    pub start_time: Option<u64>,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
    /// Distinguishes holders within one process
    pub token: String,
}

impl LockInfo {
    fn for_current_process(now: DateTime<Utc>) -> Self {
        let pid = std::process::id();
        Self {
            pid,
            start_time: i32::try_from(pid).ok().and_then(procinfo::start_time),
            acquired_at: now,
            hostname: hostname(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Is the recorded holder still running?
fn holder_alive(holder: &LockInfo, local_host: &str) -> bool {
    // Another machine sharing the state dir: we cannot check, assume alive
    if holder.hostname != local_host {
        return true;
    }
    let Ok(pid) = i32::try_from(holder.pid) else {
        return true;
    };
    match procinfo::pid_liveness(pid) {
        Liveness::Gone => false,
        Liveness::Alive => match (holder.start_time, procinfo::start_time(pid)) {
            (Some(recorded), Some(actual)) => recorded == actual,
            _ => true,
        },
    }
}

/// Outcome of `try_acquire`
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockGuard),
    Held(LockInfo),
}

#[derive(Debug, Clone)]
pub struct InstanceLock {
    record: DurableRecord<LockInfo>,
}

impl InstanceLock {
    pub fn new(path: &Path) -> Self {
        Self {
            record: DurableRecord::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.record.path()
    }

    /// Current holder, if any
    pub fn holder(&self) -> Result<Option<LockInfo>, OrchestratorError> {
        self.record.load().map_err(|e| self.classify(e))
    }

    /// Take the lock if it is free or its holder is provably gone
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Result<LockAttempt, OrchestratorError> {
        let me = LockInfo::for_current_process(now);

        for _ in 0..MAX_ACQUIRE_ROUNDS {
            let current = self.holder()?;
            let expected = match current {
                None => None,
                Some(holder) if holder_alive(&holder, &me.hostname) => {
                    debug!(pid = holder.pid, since = %holder.acquired_at, "lock held");
                    return Ok(LockAttempt::Held(holder));
                }
                Some(holder) => {
                    warn!(
                        pid = holder.pid,
                        acquired_at = %holder.acquired_at,
                        "lock holder is gone, reclaiming"
                    );
                    Some(holder)
                }
            };

            if self
                .record
                .compare_and_swap(expected.as_ref(), Some(&me))
                .map_err(|e| self.classify(e))?
            {
                info!(pid = me.pid, path = %self.path().display(), "lock acquired");
                return Ok(LockAttempt::Acquired(LockGuard {
                    record: self.record.clone(),
                    info: me,
                }));
            }
        }

        Err(StoreError::Contention {
            path: self.path().to_path_buf(),
            attempts: MAX_ACQUIRE_ROUNDS,
        }
        .into())
    }

    fn classify(&self, e: StoreError) -> OrchestratorError {
        if e.is_corrupt() {
            OrchestratorError::LockCorrupted {
                path: PathBuf::from(self.path()),
                reason: e.to_string(),
            }
        } else {
            OrchestratorError::State(e)
        }
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    record: DurableRecord<LockInfo>,
    info: LockInfo,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.record.compare_and_swap(Some(&self.info), None) {
            Ok(true) => debug!(pid = self.info.pid, "lock released"),
            Ok(false) => warn!(
                path = %self.record.path().display(),
                "lock record no longer ours at release"
            ),
            Err(e) => warn!(error = %e, "failed to release lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn acquired(attempt: LockAttempt) -> LockGuard {
        match attempt {
            LockAttempt::Acquired(g) => g,
            LockAttempt::Held(h) => panic!("expected to acquire, held by {}", h.pid),
        }
    }

    #[test]
    fn test_acquire_release_cycle() {
        let temp = TempDir::new().unwrap();
        let lock = InstanceLock::new(&temp.path().join("fixclaw.lock"));

        let guard = acquired(lock.try_acquire(Utc::now()).unwrap());
        assert_eq!(guard.info().pid, std::process::id());
        assert!(lock.path().exists());

        // A live holder blocks, even from the same process
        assert!(matches!(lock.try_acquire(Utc::now()).unwrap(), LockAttempt::Held(_)));

        drop(guard);
        assert!(!lock.path().exists());
        let _again = acquired(lock.try_acquire(Utc::now()).unwrap());
    }

    #[test]
    fn test_dead_holder_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fixclaw.lock");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let stale = LockInfo {
            pid: dead_pid,
            start_time: None,
            acquired_at: Utc::now(),
            hostname: hostname(),
            token: "stale".into(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = InstanceLock::new(&path);
        let guard = acquired(lock.try_acquire(Utc::now()).unwrap());
        assert_ne!(guard.info().token, "stale");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reused_pid_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fixclaw.lock");

        // Our own pid, but a start time that cannot be ours
        let stale = LockInfo {
            pid: std::process::id(),
            start_time: Some(1),
            acquired_at: Utc::now(),
            hostname: hostname(),
            token: "previous-boot".into(),
        };
        std::fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = InstanceLock::new(&path);
        let guard = acquired(lock.try_acquire(Utc::now()).unwrap());
        assert_ne!(guard.info().token, "previous-boot");
    }

    #[test]
    fn test_foreign_host_never_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fixclaw.lock");
        let remote = LockInfo {
            pid: 1,
            start_time: None,
            acquired_at: Utc::now(),
            hostname: "some-other-host.invalid".into(),
            token: "remote".into(),
        };
        std::fs::write(&path, serde_json::to_vec(&remote).unwrap()).unwrap();

        let lock = InstanceLock::new(&path);
        assert!(matches!(lock.try_acquire(Utc::now()).unwrap(), LockAttempt::Held(_)));
    }

    #[test]
    fn test_corrupt_lock_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fixclaw.lock");
        std::fs::write(&path, "pid=123").unwrap();

        let lock = InstanceLock::new(&path);
        let err = lock.try_acquire(Utc::now()).unwrap_err();
        assert!(matches!(err, OrchestratorError::LockCorrupted { .. }));
        // Left in place for an operator to inspect
        assert!(path.exists());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let temp = TempDir::new().unwrap();
        let path = Arc::new(temp.path().join("fixclaw.lock"));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    match InstanceLock::new(&path).try_acquire(Utc::now()).unwrap() {
                        LockAttempt::Acquired(g) => Some(g),
                        LockAttempt::Held(_) => None,
                    }
                })
            })
            .collect();

        let guards: Vec<LockGuard> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 1);
    }
}
