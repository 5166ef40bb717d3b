//! Atomic file operations for the backing file.
//!
//! Implements atomic writes using:
//! 1. Write to a sibling temp file with unique PID+TID suffix
//! 2. fsync to ensure data reaches disk
//! 3. Atomic rename to target path
//!
//! The temp file lives in the same directory as the target so the rename
//! never crosses file systems. It is removed if any step fails.

use crate::error::{CertdeckError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use tracing::{debug, warn};

/// Read a text file, returning `None` if it doesn't exist.
pub fn read_text_if_exists(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CertdeckError::io_with_path(e, path)),
    }
}

/// Replace `path` with `contents` atomically.
///
/// Failures are reported as [`CertdeckError::Persistence`].
pub fn atomic_write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| persistence_error(path, "create parent directory", e))?;
        }
    }

    let temp_path = temp_path_for(path);
    if let Err(e) = write_and_sync(&temp_path, contents) {
        remove_temp(&temp_path);
        return Err(persistence_error(path, "write temp file", e));
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        remove_temp(&temp_path);
        return Err(persistence_error(path, "rename temp file into place", e));
    }

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

fn write_and_sync(temp_path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    file.sync_all()
}

fn remove_temp(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {}: {}", temp_path.display(), e);
        }
    }
}

fn persistence_error(path: &Path, step: &str, err: std::io::Error) -> CertdeckError {
    CertdeckError::Persistence {
        message: format!("failed to {}: {}", step, err),
        path: path.to_path_buf(),
        source: Some(err),
    }
}

/// Hidden sibling of `path`: `.<name>.<pid>.<tid>.tmp`.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "certdeck".to_string());
    path.with_file_name(format!(".{}.{}.{}.tmp", name, process::id(), thread_id()))
}

/// Get a unique thread identifier.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("domains.txt");

        atomic_write_text(&path, "example.com\n").unwrap();
        assert_eq!(read_text_if_exists(&path).unwrap().as_deref(), Some("example.com\n"));

        atomic_write_text(&path, "other.com\n").unwrap();
        assert_eq!(read_text_if_exists(&path).unwrap().as_deref(), Some("other.com\n"));
    }

    #[test]
    fn test_atomic_write_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("domains.txt");

        atomic_write_text(&path, "").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_failed_rename_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("domains.txt");
        // A non-empty directory in the way makes the rename fail.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), "x").unwrap();

        let err = atomic_write_text(&path, "example.com\n").unwrap_err();
        assert!(matches!(err, CertdeckError::Persistence { .. }), "{err:?}");

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        assert!(read_text_if_exists(&temp_dir.path().join("nope")).unwrap().is_none());
    }
}
