//! Durable cross-process records
//!
//! A `DurableRecord<T>` is a single JSON file that several processes may read
//! and update. It exposes a deliberately narrow interface:
//!
//! - `load()` reads the current value (or `None` when the file is absent)
//! - `compare_and_swap(expected, next)` replaces the value only if the file
//!   still holds `expected`
//!
//! The compare and the write happen while holding an exclusive `flock` on a
//! sidecar `.guard` file, and the write itself is an atomic replace, so two
//! processes racing on the same record can never both win and a crash can
//! never leave a torn file behind.

use std::fs::{self, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::fsio;

/// A JSON record on disk, updated via compare-and-swap
#[derive(Debug, Clone)]
pub struct DurableRecord<T> {
    path: PathBuf,
    guard_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DurableRecord<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let guard_name = format!(
            "{}.guard",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "record".to_string())
        );
        let guard_path = path.with_file_name(guard_name);
        Self {
            path,
            guard_path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current value. Absent file is `Ok(None)`; unparsable content
    /// is `StoreError::Corrupt`.
    pub fn load(&self) -> Result<Option<T>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        if contents.trim().is_empty() {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: "empty file".to_string(),
            });
        }

        serde_json::from_str::<T>(&contents)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Replace the record with `next` if it currently equals `expected`.
    ///
    /// `expected = None` means "the record must not exist"; `next = None`
    /// deletes the record. Returns `Ok(false)` when the record changed under
    /// us and nothing was written.
    pub fn compare_and_swap(&self, expected: Option<&T>, next: Option<&T>) -> Result<bool, StoreError> {
        let _guard = self.lock_guard()?;

        let current = self.load()?;
        if current.as_ref() != expected {
            debug!(path = %self.path.display(), "compare_and_swap lost: record changed");
            return Ok(false);
        }

        match next {
            Some(value) => {
                let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Encode {
                    path: self.path.clone(),
                    source: e,
                })?;
                fsio::atomic_write(&self.path, &json).map_err(|e| StoreError::io(&self.path, e))?;
            }
            None => {
                fsio::remove_durable(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
            }
        }

        Ok(true)
    }

    /// Move an unreadable record aside so it can be inspected later.
    /// Returns the quarantine path, or `None` if the record vanished meanwhile.
    pub fn quarantine(&self, tag: &str) -> Result<Option<PathBuf>, StoreError> {
        let _guard = self.lock_guard()?;

        if !self.path.exists() {
            return Ok(None);
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record".to_string());
        let target = self.path.with_file_name(format!("{}.corrupt-{}", file_name, tag));

        fs::rename(&self.path, &target).map_err(|e| StoreError::io(&self.path, e))?;
        if let Some(parent) = self.path.parent() {
            fsio::sync_dir(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        warn!(
            from = %self.path.display(),
            to = %target.display(),
            "quarantined corrupt record"
        );
        Ok(Some(target))
    }

    fn lock_guard(&self) -> Result<Flock<fs::File>, StoreError> {
        if let Some(parent) = self.guard_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.guard_path)
            .map_err(|e| StoreError::io(&self.guard_path, e))?;

        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| StoreError::Guard {
            path: self.guard_path.clone(),
            errno,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let record: DurableRecord<Counter> = DurableRecord::new(temp.path().join("c.json"));
        assert_eq!(record.load().unwrap(), None);
    }

    #[test]
    fn test_cas_create_update_delete() {
        let temp = TempDir::new().unwrap();
        let record = DurableRecord::new(temp.path().join("c.json"));

        let one = Counter { value: 1 };
        let two = Counter { value: 2 };

        assert!(record.compare_and_swap(None, Some(&one)).unwrap());
        assert_eq!(record.load().unwrap(), Some(one.clone()));

        // Stale expectation loses
        assert!(!record.compare_and_swap(None, Some(&two)).unwrap());
        assert!(record.compare_and_swap(Some(&one), Some(&two)).unwrap());
        assert_eq!(record.load().unwrap(), Some(two.clone()));

        assert!(record.compare_and_swap(Some(&two), None).unwrap());
        assert_eq!(record.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_detected_and_quarantined() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("c.json");
        fs::write(&path, "{not json").unwrap();

        let record: DurableRecord<Counter> = DurableRecord::new(&path);
        let err = record.load().unwrap_err();
        assert!(err.is_corrupt());

        let moved = record.quarantine("test").unwrap().unwrap();
        assert!(moved.exists());
        assert_eq!(record.load().unwrap(), None);
    }

    #[test]
    fn test_concurrent_creators_only_one_wins() {
        let temp = TempDir::new().unwrap();
        let path = Arc::new(temp.path().join("c.json"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || {
                    let record: DurableRecord<Counter> = DurableRecord::new(path.as_path());
                    record
                        .compare_and_swap(None, Some(&Counter { value: i }))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
