//! Evidence store
//!
//! Every repair attempt gets its own directory under `<state>/attempts/`,
//! named by a sortable UTC timestamp. Inside it:
//!
//! - `NN-label.stdout.txt` / `NN-label.stderr.txt` for each step, redacted
//! - `attempt.json`, rewritten atomically after every step
//! - `verdict.json`, written last; its presence marks the attempt as sealed
//!
//! Probes that run before an attempt exists write into a per-process
//! scratch directory and are adopted into the attempt when it opens.
//! Attempt directories are never deleted here.

use chrono::{DateTime, Utc};
use fixclaw_common::{fsio, AttemptSummary, AttemptVerdict, StatePaths, StepResult, TierKind, Verdict};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::EvidenceError;

const ATTEMPT_FILE: &str = "attempt.json";
const VERDICT_FILE: &str = "verdict.json";
const MAX_NAME_SUFFIX: u32 = 999;

/// Where the process runner puts step output
pub trait StepSink: Send {
    /// Directory that receives the evidence files
    fn dir(&self) -> &Path;

    /// Reserve the next sequence number
    fn next_seq(&mut self) -> u32;

    /// Append a finished step
    fn record(&mut self, step: StepResult) -> Result<(), EvidenceError>;
}

/// Write `content` to `dir/name` via temp file, fsync and rename
pub fn write(dir: &Path, name: &str, content: &[u8]) -> Result<PathBuf, EvidenceError> {
    let path = dir.join(name);
    fsio::atomic_write(&path, content).map_err(|e| EvidenceError::write(&path, e))?;
    Ok(path)
}

/// Evidence file base name for a step: `03-official-1`
pub fn step_file_stem(seq: u32, label: &str) -> String {
    let label: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{:02}-{}", seq, label)
}

// ============================================================================
// Attempt record
// ============================================================================

/// Per-tier entry in `attempt.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRecord {
    pub tier: TierKind,
    /// Set when the tier was not run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_verdict: Option<Verdict>,
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_early: Option<String>,
    /// Sequence numbers of the steps the tier ran
    #[serde(default)]
    pub steps: Vec<u32>,
}

impl TierRecord {
    pub fn skipped(tier: TierKind, reason: impl Into<String>) -> Self {
        Self {
            tier,
            skipped: Some(reason.into()),
            post_verdict: None,
            recovered: false,
            stopped_early: None,
            steps: Vec::new(),
        }
    }
}

/// Contents of `attempt.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub tiers: Vec<TierRecord>,
    #[serde(default)]
    pub verdict: Option<AttemptVerdict>,
    #[serde(default)]
    pub tier_reached: Option<TierKind>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Store
// ============================================================================

/// Handle on the attempts and scratch directories
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    attempts_dir: PathBuf,
    scratch_root: PathBuf,
}

impl EvidenceStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            attempts_dir: paths.attempts_dir.clone(),
            scratch_root: paths.scratch_dir.clone(),
        }
    }

    /// Create a fresh attempt directory. Never reuses an existing one.
    pub fn begin_attempt(&self, now: DateTime<Utc>) -> Result<AttemptWriter, EvidenceError> {
        fs::create_dir_all(&self.attempts_dir).map_err(|e| EvidenceError::Create {
            path: self.attempts_dir.clone(),
            source: e,
        })?;

        let base = now.format("%Y%m%dT%H%M%SZ").to_string();
        let mut suffix = 0;
        let (id, dir) = loop {
            let id = if suffix == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, suffix)
            };
            let dir = self.attempts_dir.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => break (id, dir),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    suffix += 1;
                    if suffix > MAX_NAME_SUFFIX {
                        return Err(EvidenceError::NamesExhausted(self.attempts_dir.join(&base)));
                    }
                }
                Err(e) => return Err(EvidenceError::Create { path: dir, source: e }),
            }
        };
        fsio::sync_dir(&self.attempts_dir).map_err(|e| EvidenceError::write(&self.attempts_dir, e))?;

        info!(attempt = %id, dir = %dir.display(), "opened attempt");

        let writer = AttemptWriter {
            dir,
            record: AttemptRecord {
                id,
                started_at: now,
                steps: Vec::new(),
                tiers: Vec::new(),
                verdict: None,
                tier_reached: None,
                finished_at: None,
            },
            next_seq: 1,
        };
        writer.flush()?;
        Ok(writer)
    }

    /// Per-invocation scratch sink for probes run before an attempt exists
    pub fn scratch(&self) -> Result<ScratchSink, EvidenceError> {
        let name = format!(
            "{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.scratch_root.join(name);
        fs::create_dir_all(&dir).map_err(|e| EvidenceError::Create {
            path: dir.clone(),
            source: e,
        })?;
        Ok(ScratchSink {
            dir,
            steps: Vec::new(),
            next_seq: 1,
        })
    }

    /// Attempts, newest first. Unsealed attempts (in progress or interrupted)
    /// are listed with `summary = None`.
    pub fn list_attempts(&self, limit: usize) -> Result<Vec<AttemptListing>, EvidenceError> {
        let entries = match fs::read_dir(&self.attempts_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EvidenceError::write(&self.attempts_dir, e)),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort_by(|a, b| attempt_sort_key(b).cmp(&attempt_sort_key(a)));
        ids.truncate(limit);

        Ok(ids
            .into_iter()
            .map(|id| {
                let dir = self.attempts_dir.join(&id);
                let summary = fs::read_to_string(dir.join(VERDICT_FILE))
                    .ok()
                    .and_then(|s| serde_json::from_str::<AttemptSummary>(&s).ok());
                AttemptListing { id, dir, summary }
            })
            .collect())
    }
}

/// Sort key that orders `-10` after `-9` within the same second
fn attempt_sort_key(id: &str) -> (String, u32) {
    match id.rsplit_once('-') {
        Some((base, n)) => match n.parse::<u32>() {
            Ok(n) => (base.to_string(), n),
            Err(_) => (id.to_string(), 0),
        },
        None => (id.to_string(), 0),
    }
}

/// One entry of `list_attempts`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptListing {
    pub id: String,
    pub dir: PathBuf,
    pub summary: Option<AttemptSummary>,
}

// ============================================================================
// Attempt writer
// ============================================================================

/// Exclusive, append-only writer for one attempt. `seal` consumes it.
#[derive(Debug)]
pub struct AttemptWriter {
    dir: PathBuf,
    record: AttemptRecord,
    next_seq: u32,
}

impl AttemptWriter {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.record.steps
    }

    /// Working directory for a tier, created on demand
    pub fn tier_dir(&self, tier: TierKind) -> Result<PathBuf, EvidenceError> {
        let dir = self.dir.join(tier.as_str());
        fs::create_dir_all(&dir).map_err(|e| EvidenceError::Create {
            path: dir.clone(),
            source: e,
        })?;
        Ok(dir)
    }

    /// Copy scratch evidence into this attempt, renumbering in order
    pub fn adopt(&mut self, scratch: ScratchSink) -> Result<(), EvidenceError> {
        for step in scratch.steps.iter() {
            let seq = self.next_seq();
            let stem = step_file_stem(seq, &step.label);
            let stdout_path = self.dir.join(format!("{}.stdout.txt", stem));
            let stderr_path = self.dir.join(format!("{}.stderr.txt", stem));
            copy_durable(&step.stdout_path, &stdout_path)?;
            copy_durable(&step.stderr_path, &stderr_path)?;

            let mut adopted = step.clone();
            adopted.seq = seq;
            adopted.stdout_path = stdout_path;
            adopted.stderr_path = stderr_path;
            self.record(adopted)?;
        }
        debug!(attempt = %self.record.id, adopted = scratch.steps.len(), "adopted probe evidence");
        Ok(())
    }

    /// Note a tier's outcome in `attempt.json`
    pub fn note_tier(&mut self, tier: TierRecord) -> Result<(), EvidenceError> {
        self.record.tiers.push(tier);
        self.flush()
    }

    /// Write the final verdict. The attempt is immutable afterwards.
    pub fn seal(
        mut self,
        verdict: AttemptVerdict,
        tier_reached: Option<TierKind>,
        finished_at: DateTime<Utc>,
    ) -> Result<AttemptSummary, EvidenceError> {
        self.record.verdict = Some(verdict);
        self.record.tier_reached = tier_reached;
        self.record.finished_at = Some(finished_at);
        self.flush()?;

        let summary = AttemptSummary {
            id: self.record.id.clone(),
            dir: self.dir.clone(),
            verdict,
            tier_reached,
            tiers_run: self
                .record
                .tiers
                .iter()
                .filter(|t| t.skipped.is_none())
                .map(|t| t.tier)
                .collect(),
            step_count: self.record.steps.len(),
            started_at: self.record.started_at,
            finished_at,
        };

        let json = serde_json::to_vec_pretty(&summary).map_err(|e| EvidenceError::Encode {
            path: self.dir.join(VERDICT_FILE),
            source: e,
        })?;
        write(&self.dir, VERDICT_FILE, &json)?;

        info!(attempt = %summary.id, verdict = %verdict, "sealed attempt");
        Ok(summary)
    }

    fn flush(&self) -> Result<(), EvidenceError> {
        let path = self.dir.join(ATTEMPT_FILE);
        let json = serde_json::to_vec_pretty(&self.record).map_err(|e| EvidenceError::Encode {
            path: path.clone(),
            source: e,
        })?;
        write(&self.dir, ATTEMPT_FILE, &json)?;
        Ok(())
    }
}

impl StepSink for AttemptWriter {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn record(&mut self, step: StepResult) -> Result<(), EvidenceError> {
        self.record.steps.push(step);
        self.flush()
    }
}

fn copy_durable(from: &Path, to: &Path) -> Result<(), EvidenceError> {
    let data = fs::read(from).map_err(|e| EvidenceError::write(from, e))?;
    fsio::atomic_write(to, &data).map_err(|e| EvidenceError::write(to, e))
}

// ============================================================================
// Scratch sink
// ============================================================================

/// Probe evidence gathered before it is known whether an attempt is needed.
/// The directory is removed when the sink is dropped.
#[derive(Debug)]
pub struct ScratchSink {
    dir: PathBuf,
    steps: Vec<StepResult>,
    next_seq: u32,
}

impl ScratchSink {
    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }
}

impl StepSink for ScratchSink {
    fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn record(&mut self, step: StepResult) -> Result<(), EvidenceError> {
        self.steps.push(step);
        Ok(())
    }
}

impl Drop for ScratchSink {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove scratch dir");
            }
        }
    }
}
