//! Atomic file operations
//!
//! Every durable artifact (cooldown record, lock record, attempt evidence) is
//! written with the same discipline: write a uniquely named temp file in the
//! target directory, fsync it, rename it over the destination, fsync the
//! directory. Readers see either the old file or the new one, never a torn
//! write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Temp-file path next to `path`, unique per process and call
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    let tmp_name = format!(
        ".{}.{}.{}.tmp",
        name,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    );
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Write data to a file atomically using temp file + fsync + rename
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_path_for(path);
    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;

    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Write string data atomically
pub fn atomic_write_str(path: &Path, data: &str) -> io::Result<()> {
    atomic_write(path, data.as_bytes())
}

/// Remove a file and fsync its directory. Missing files are not an error.
pub fn remove_durable(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// fsync a directory so renames and unlinks inside it are durable
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    // Opening a directory read-only and calling fsync is the portable unix way
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");

        atomic_write_str(&path, "first").unwrap();
        atomic_write_str(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/state.json");

        atomic_write_str(&path, "{}").unwrap();

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_durable_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        assert!(remove_durable(&temp.path().join("missing")).is_ok());
    }
}
