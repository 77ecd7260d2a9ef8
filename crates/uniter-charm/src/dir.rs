//! The charm directory: deploy, upgrade and the conflict handshake.
//!
//! Layout under the charm directory:
//!
//! ```text
//! charm/                      working tree, visible to hooks
//! charm/.version-control/
//!     objects/<blake3>        staged file contents
//!     base                    manifest of the last committed revision
//!     current-revision        last committed revision, written last
//!     pending                 the upgrade in progress, if any
//!     conflicted              marker: one conflicted path per line
//! ```
//!
//! Every step writes its metadata atomically, and `current-revision` is only
//! written once a revision is fully in place, so a crash at any point leaves
//! the directory either re-deployable or re-upgradeable to the same target.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uniter_core::fs::{remove_if_exists, write_atomic};

use crate::bundle::read_bundle;
use crate::error::{CharmError, Result};
use crate::manifest::{checkout, read_cbor, write_cbor, Manifest};
use crate::merge::merge;
use crate::objects::ObjectStore;
use crate::VERSION_CONTROL_DIR;

const OBJECTS: &str = "objects";
const BASE: &str = "base";
const CURRENT_REVISION: &str = "current-revision";
const PENDING: &str = "pending";
const CONFLICTED: &str = "conflicted";

/// The result of [`CharmDir::upgrade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The new revision is in place and committed.
    Clean,
    /// The merge left conflicts in these paths; the conflicted marker is set.
    Conflicted(Vec<String>),
}

/// An upgrade that has started but not been committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingUpgrade {
    revision: u64,
    forced: bool,
    base: Manifest,
    ours: Manifest,
    theirs: Manifest,
    conflicts: Vec<String>,
}

impl PendingUpgrade {
    fn is_conflicted(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// A charm working tree with its version-control metadata.
#[derive(Debug, Clone)]
pub struct CharmDir {
    path: PathBuf,
}

impl CharmDir {
    /// Manage the charm directory at `path`. Nothing is touched until an
    /// operation is called.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The working tree.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn meta(&self, name: &str) -> PathBuf {
        self.path.join(VERSION_CONTROL_DIR).join(name)
    }

    fn objects(&self) -> Result<ObjectStore> {
        ObjectStore::open(self.meta(OBJECTS))
    }

    fn pending(&self) -> Result<Option<PendingUpgrade>> {
        read_cbor(&self.meta(PENDING))
    }

    /// Fail if something other than a directory sits at the charm path.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::NotADirectory` if the path exists and is not a
    /// directory.
    pub fn check_sane(&self) -> Result<()> {
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if !meta.is_dir() => Err(CharmError::NotADirectory(self.path.clone())),
            _ => Ok(()),
        }
    }

    /// The last committed revision, or `None` if nothing is deployed.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::NotADirectory` for an insane charm path, or an
    /// error if the revision file is unreadable.
    pub fn current_revision(&self) -> Result<Option<u64>> {
        self.check_sane()?;
        let path = self.meta(CURRENT_REVISION);
        match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse().map(Some).map_err(|e| {
                CharmError::Serialization(format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CharmError::io(format!("cannot read {}", path.display()), e)),
        }
    }

    /// Finish any commit a crash interrupted and restore a lost conflict
    /// marker. Call once before using the directory after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read or written.
    pub fn recover(&self) -> Result<()> {
        let Some(pending) = self.pending()? else {
            return Ok(());
        };
        let marker = self.meta(CONFLICTED).exists();
        if !marker && self.current_revision()? == Some(pending.revision) {
            tracing::info!(revision = pending.revision, "Completing interrupted charm commit");
            return self.commit(&pending);
        }
        if pending.is_conflicted() && !marker {
            tracing::info!(revision = pending.revision, "Restoring conflicted marker");
            self.write_marker(&pending.conflicts)?;
        }
        Ok(())
    }

    /// Install `bundle` as `revision` into an empty charm directory.
    ///
    /// A partially written tree from an interrupted deploy is discarded
    /// first. The revision file is written last.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::NotADirectory` for an insane charm path,
    /// `CharmError::AlreadyDeployed` if a revision is already committed,
    /// `CharmError::InvalidBundle` for a bad bundle, or an I/O error.
    pub fn deploy(&self, bundle: &[u8], revision: u64) -> Result<()> {
        if let Some(current) = self.current_revision()? {
            return Err(CharmError::AlreadyDeployed(current));
        }
        let files = read_bundle(bundle)?;
        if self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Discarding partial charm deployment");
            fs::remove_dir_all(&self.path).map_err(|e| {
                CharmError::io(format!("cannot remove {}", self.path.display()), e)
            })?;
        }
        let objects = self.objects()?;
        let manifest = Manifest::stage(&files, &objects)?;
        checkout(&self.path, &manifest, &objects)?;
        write_cbor(&self.meta(BASE), &manifest)?;
        self.write_revision(revision)?;
        tracing::info!(revision, files = manifest.len(), "Charm deployed");
        Ok(())
    }

    /// Merge `bundle` as `revision` into the working tree.
    ///
    /// The common ancestor is the last committed revision and "ours" is the
    /// working tree. A forced upgrade abandons any earlier unfinished
    /// upgrade, restoring the tree it started from, and settles every
    /// conflict in favour of the new revision. An unforced upgrade after a
    /// conflict re-merges using the working tree as it is now.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::NotDeployed` if nothing is deployed, or an error
    /// if the bundle is invalid or the tree cannot be updated.
    pub fn upgrade(&self, bundle: &[u8], revision: u64, forced: bool) -> Result<UpgradeOutcome> {
        if self.current_revision()?.is_none() {
            return Err(CharmError::NotDeployed);
        }
        let files = read_bundle(bundle)?;
        let objects = self.objects()?;

        let (base, ours) = match self.pending()? {
            Some(p) if p.is_conflicted() && !forced => {
                (p.base, Manifest::scan(&self.path, &objects)?)
            }
            Some(p) => {
                tracing::debug!(revision = p.revision, "Abandoning unfinished upgrade");
                checkout(&self.path, &p.ours, &objects)?;
                (p.base, p.ours)
            }
            None => {
                let base = read_cbor(&self.meta(BASE))?.unwrap_or_default();
                (base, Manifest::scan(&self.path, &objects)?)
            }
        };

        remove_if_exists(&self.meta(CONFLICTED))?;
        let mut pending = PendingUpgrade {
            revision,
            forced,
            base,
            ours,
            theirs: Manifest::stage(&files, &objects)?,
            conflicts: Vec::new(),
        };
        write_cbor(&self.meta(PENDING), &pending)?;

        let result = merge(&pending.base, &pending.ours, &pending.theirs, forced, &objects)?;
        checkout(&self.path, &result.manifest, &objects)?;

        if !result.is_clean() {
            pending.conflicts.clone_from(&result.conflicts);
            write_cbor(&self.meta(PENDING), &pending)?;
            self.write_marker(&pending.conflicts)?;
            tracing::warn!(revision, conflicts = ?result.conflicts, "Charm upgrade conflicted");
            return Ok(UpgradeOutcome::Conflicted(result.conflicts));
        }

        self.write_revision(revision)?;
        self.commit(&pending)?;
        tracing::info!(revision, forced, "Charm upgraded");
        Ok(UpgradeOutcome::Clean)
    }

    /// Returns true while an upgrade's conflicts are unresolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn is_conflicted(&self) -> Result<bool> {
        if self.meta(CONFLICTED).exists() {
            return Ok(true);
        }
        Ok(match self.pending()? {
            Some(p) => p.is_conflicted() && self.current_revision()? != Some(p.revision),
            None => false,
        })
    }

    /// Paths left conflicted by the last upgrade.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn conflicts(&self) -> Result<Vec<String>> {
        Ok(self.pending()?.map(|p| p.conflicts).unwrap_or_default())
    }

    /// The revision of the upgrade in progress, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn pending_revision(&self) -> Result<Option<u64>> {
        Ok(self.pending()?.map(|p| p.revision))
    }

    /// Accept the working tree as the result of the conflicted upgrade and
    /// commit its revision, which is returned.
    ///
    /// The marker is removed before the revision is written; until the
    /// revision is written the upgrade still counts as conflicted.
    ///
    /// # Errors
    ///
    /// Returns `CharmError::NotConflicted` if there is nothing to resolve.
    pub fn resolved(&self) -> Result<u64> {
        let pending = self
            .pending()?
            .filter(PendingUpgrade::is_conflicted)
            .ok_or(CharmError::NotConflicted)?;
        remove_if_exists(&self.meta(CONFLICTED))?;
        self.write_revision(pending.revision)?;
        self.commit(&pending)?;
        tracing::info!(revision = pending.revision, "Charm conflicts resolved");
        Ok(pending.revision)
    }

    fn commit(&self, pending: &PendingUpgrade) -> Result<()> {
        write_cbor(&self.meta(BASE), &pending.theirs)?;
        remove_if_exists(&self.meta(PENDING))?;
        Ok(())
    }

    fn write_revision(&self, revision: u64) -> Result<()> {
        write_atomic(&self.meta(CURRENT_REVISION), format!("{revision}\n").as_bytes())?;
        Ok(())
    }

    fn write_marker(&self, conflicts: &[String]) -> Result<()> {
        let mut text = conflicts.join("\n");
        text.push('\n');
        write_atomic(&self.meta(CONFLICTED), text.as_bytes())?;
        Ok(())
    }
}
