//! Tree manifests: which object lives at which path.
//!
//! A [`Manifest`] describes a charm tree (a bundle, the working copy, or a
//! committed revision) as a sorted map from `/`-separated relative paths to
//! object keys. Directories are implied by the paths of the files in them.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uniter_core::fs::write_atomic;

use crate::bundle::BundleFile;
use crate::error::{CharmError, Result};
use crate::objects::ObjectStore;
use crate::VERSION_CONTROL_DIR;

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// Key of the file's contents in the object store.
    pub object: String,
    /// Whether the file is executable.
    pub executable: bool,
}

/// The files of a tree, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    files: BTreeMap<String, FileEntry>,
}

impl Manifest {
    /// An empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the files of a bundle and return its manifest.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Io` if an object cannot be stored.
    pub fn stage(files: &[BundleFile], objects: &ObjectStore) -> Result<Self> {
        let mut manifest = Self::new();
        for file in files {
            let object = objects.put(&file.data)?;
            manifest.insert(
                file.path.clone(),
                FileEntry {
                    object,
                    executable: file.executable,
                },
            );
        }
        Ok(manifest)
    }

    /// Snapshot the working tree at `root` into the object store.
    ///
    /// The version-control directory is skipped, as are symbolic links and
    /// other special files.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::Io` if the tree cannot be read or stored.
    pub fn scan(root: &Path, objects: &ObjectStore) -> Result<Self> {
        let mut manifest = Self::new();
        if root.is_dir() {
            scan_dir(root, "", objects, &mut manifest)?;
        }
        Ok(manifest)
    }

    /// Add or replace a file.
    pub fn insert(&mut self, path: String, entry: FileEntry) {
        self.files.insert(path, entry);
    }

    /// Remove a file, returning its entry.
    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(path)
    }

    /// Look up a file.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Returns true if the manifest lists `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Iterate over paths and entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    /// Iterate over paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if there are no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn scan_dir(dir: &Path, prefix: &str, objects: &ObjectStore, out: &mut Manifest) -> Result<()> {
    let entries =
        fs::read_dir(dir).map_err(|e| CharmError::io(format!("cannot read {}", dir.display()), e))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| CharmError::io(format!("cannot read {}", dir.display()), e))?;
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            tracing::warn!(path = %entry.path().display(), "Skipping non-UTF-8 file name");
            continue;
        };
        if prefix.is_empty() && name == VERSION_CONTROL_DIR {
            continue;
        }
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| CharmError::io(format!("cannot stat {}", path.display()), e))?;
        if meta.is_dir() {
            scan_dir(&path, &rel, objects, out)?;
        } else if meta.is_file() {
            let data = fs::read(&path)
                .map_err(|e| CharmError::io(format!("cannot read {}", path.display()), e))?;
            out.insert(
                rel,
                FileEntry {
                    object: objects.put(&data)?,
                    executable: meta.permissions().mode() & 0o111 != 0,
                },
            );
        } else {
            tracing::debug!(path = %path.display(), "Ignoring special file in charm tree");
        }
    }
    Ok(())
}

/// Make the working tree at `root` match `target`.
///
/// Files missing from `target` are removed (pruning directories they leave
/// empty); files that differ are rewritten. A directory standing where
/// `target` wants a file is removed with its contents, and a file standing
/// where `target` wants a directory is removed.
///
/// # Errors
///
/// Returns `CharmError::Io` if the tree cannot be updated.
pub fn checkout(root: &Path, target: &Manifest, objects: &ObjectStore) -> Result<()> {
    fs::create_dir_all(root)
        .map_err(|e| CharmError::io(format!("cannot create {}", root.display()), e))?;
    let current = Manifest::scan(root, objects)?;

    for path in current.paths().filter(|p| !target.contains(p)) {
        let full = root.join(path);
        uniter_core::fs::remove_if_exists(&full)?;
        prune_empty_parents(root, &full);
    }

    for (path, entry) in target.iter() {
        if current.get(path) == Some(entry) {
            continue;
        }
        let full = root.join(path);
        clear_ancestors(root, path)?;
        if full.is_dir() {
            fs::remove_dir_all(&full)
                .map_err(|e| CharmError::io(format!("cannot remove {}", full.display()), e))?;
        }
        let data = objects.get(&entry.object)?;
        write_atomic(&full, &data)?;
        let mode = if entry.executable { 0o755 } else { 0o644 };
        fs::set_permissions(&full, fs::Permissions::from_mode(mode))
            .map_err(|e| CharmError::io(format!("cannot chmod {}", full.display()), e))?;
    }
    Ok(())
}

/// Ensure every ancestor directory of `path` exists, removing files in the way.
fn clear_ancestors(root: &Path, path: &str) -> Result<()> {
    let mut dir = root.to_path_buf();
    let parts: Vec<&str> = path.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        dir.push(part);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => uniter_core::fs::remove_if_exists(&dir)?,
            Err(_) => {}
        }
        fs::create_dir(&dir)
            .map_err(|e| CharmError::io(format!("cannot create {}", dir.display()), e))?;
    }
    Ok(())
}

fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut dir = removed.parent();
    while let Some(d) = dir {
        if d == root || fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

/// Read a CBOR-encoded value, returning `None` if the file does not exist.
pub(crate) fn read_cbor<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => ciborium::from_reader(data.as_slice())
            .map(Some)
            .map_err(|e| CharmError::Serialization(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CharmError::io(format!("cannot read {}", path.display()), e)),
    }
}

/// Atomically write a value as CBOR.
pub(crate) fn write_cbor<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| CharmError::Serialization(e.to_string()))?;
    write_atomic(path, &buf)?;
    Ok(())
}
