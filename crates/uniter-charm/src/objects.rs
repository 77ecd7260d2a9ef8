//! Content-addressed object store used to stage charm revisions.
//!
//! Every file of every revision the manager has seen, and every snapshot of
//! the working tree it has taken, is kept here keyed by its blake3 digest.
//! Manifests refer to objects by key, so a manifest plus the store is enough
//! to rebuild any tree the merge needs.

use std::fs;
use std::path::{Path, PathBuf};

use uniter_core::fs::write_atomic;

use crate::error::{CharmError, Result};

/// A directory of immutable blobs named by their blake3 hex digest.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
}

impl ObjectStore {
    /// Use `dir` as the object directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CharmError::io(format!("cannot create {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    /// Store `data` and return its key. Storing existing content is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Io` if the object cannot be written.
    pub fn put(&self, data: &[u8]) -> Result<String> {
        let key = blake3::hash(data).to_hex().to_string();
        let path = self.path(&key);
        if !path.exists() {
            write_atomic(&path, data)?;
        }
        Ok(key)
    }

    /// Read the object stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Io` if the object is missing or unreadable.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key);
        fs::read(&path).map_err(|e| CharmError::io(format!("cannot read object {key}"), e))
    }

    /// Returns true if an object is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// The object directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
