//! Filesystem helpers shared by the on-disk state of the agent.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Replace the file at `path` with `data` atomically.
///
/// The data is written to a sibling temporary file, synced, and renamed over
/// the target, so readers observe either the old or the new contents. The
/// parent directory is synced afterwards so the rename survives a crash.
///
/// # Errors
///
/// Returns `CoreError::Io` if any step fails.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path);

    let mut file = File::create(&temp_path)
        .map_err(|e| CoreError::io(format!("cannot create {}", temp_path.display()), e))?;
    file.write_all(data)
        .map_err(|e| CoreError::io(format!("cannot write {}", temp_path.display()), e))?;
    file.sync_all()
        .map_err(|e| CoreError::io(format!("cannot sync {}", temp_path.display()), e))?;
    drop(file);

    fs::rename(&temp_path, path)
        .map_err(|e| CoreError::io(format!("cannot replace {}", path.display()), e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| CoreError::io(format!("cannot sync {}", parent.display()), e))?;
    }
    Ok(())
}

/// Remove the file at `path`, treating a missing file as success.
///
/// # Errors
///
/// Returns `CoreError::Io` for any failure other than the file not existing.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::io(format!("cannot remove {}", path.display()), e)),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("file"), ToOwned::to_owned);
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("op");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("current-revision");

        write_atomic(&path, b"3").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("current-revision")]);
    }

    #[test]
    fn write_atomic_reports_missing_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("op");

        let err = write_atomic(&path, b"x").unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }));
    }

    #[test]
    fn remove_if_exists_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conflicted");

        remove_if_exists(&path).unwrap();
        fs::write(&path, b"x").unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
