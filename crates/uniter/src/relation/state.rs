//! Per-relation state: what the charm has been told, and what to tell it next.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uniter_core::{CoreError, HookInfo, HookKind, RelationId, UnitName};

use crate::error::Result;
use crate::persist;

/// What the charm knows about one relation.
///
/// `pending` is the hook handed to the mode machine and not yet completed.
/// It is saved before the hook is handed out, so a restarted agent offers
/// the same hook again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSnapshot {
    /// Peers the charm has seen join and not yet seen depart.
    pub joined: BTreeSet<UnitName>,
    /// Settings version of each peer the charm was last told about.
    pub known: BTreeMap<UnitName, u64>,
    /// Whether `broken` has run.
    pub broken: bool,
    /// The hook handed out and not yet completed.
    pub pending: Option<HookInfo>,
}

impl RelationSnapshot {
    /// The `changed` hook owed to a peer straight after its `joined` hook.
    #[must_use]
    pub fn follow_up(
        &self,
        relation: &RelationId,
        members: &BTreeMap<UnitName, u64>,
        dying: bool,
    ) -> Option<HookInfo> {
        if dying || self.broken {
            return None;
        }
        self.joined
            .iter()
            .filter(|peer| !self.known.contains_key(*peer))
            .find_map(|peer| {
                members
                    .get(peer)
                    .map(|v| HookInfo::relation_changed(relation.clone(), peer.clone(), *v))
            })
    }

    /// The next hook for this relation given the observed scope.
    ///
    /// `members` are the peers in scope with their settings versions. A
    /// dying relation is treated as having no peers, so every joined peer
    /// departs and then `broken` runs.
    ///
    /// Order: the pending hook, the follow-up `changed` after a `joined`,
    /// departures, joins, then settings changes. Peers are visited in name
    /// order.
    #[must_use]
    pub fn next_hook(
        &self,
        relation: &RelationId,
        members: &BTreeMap<UnitName, u64>,
        dying: bool,
    ) -> Option<HookInfo> {
        if let Some(pending) = &self.pending {
            return Some(pending.clone());
        }
        if self.broken {
            return None;
        }
        if let Some(hook) = self.follow_up(relation, members, dying) {
            return Some(hook);
        }
        let empty = BTreeMap::new();
        let desired = if dying { &empty } else { members };

        if let Some(peer) = self.joined.iter().find(|p| !desired.contains_key(*p)) {
            return Some(HookInfo::relation_departed(relation.clone(), peer.clone()));
        }
        if let Some(peer) = desired.keys().find(|p| !self.joined.contains(*p)) {
            return Some(HookInfo::relation_joined(relation.clone(), peer.clone()));
        }
        if let Some((peer, version)) = desired
            .iter()
            .find(|(p, v)| self.known.get(*p) != Some(*v))
        {
            return Some(HookInfo::relation_changed(
                relation.clone(),
                peer.clone(),
                *version,
            ));
        }
        if dying {
            return Some(HookInfo::relation_broken(relation.clone()));
        }
        None
    }

    /// Record that the charm has been told about `hook`.
    pub fn commit(&mut self, hook: &HookInfo) {
        if self.pending.as_ref() == Some(hook) {
            self.pending = None;
        }
        let peer = hook.remote_unit.clone();
        match (hook.kind, peer) {
            (HookKind::RelationJoined, Some(peer)) => {
                self.joined.insert(peer);
            }
            (HookKind::RelationChanged, Some(peer)) => {
                if let Some(version) = hook.change_version {
                    self.known.insert(peer, version);
                }
            }
            (HookKind::RelationDeparted, Some(peer)) => {
                self.joined.remove(&peer);
                self.known.remove(&peer);
            }
            (HookKind::RelationBroken, _) => self.broken = true,
            _ => {}
        }
    }
}

/// The directory holding one relation's snapshot.
#[derive(Debug, Clone)]
pub struct RelationDir {
    path: PathBuf,
}

impl RelationDir {
    const SNAPSHOT: &'static str = "snapshot";

    /// The directory for `relation` under `root`.
    #[must_use]
    pub fn new(root: &Path, relation: &RelationId) -> Self {
        Self {
            path: root.join(relation.to_string()),
        }
    }

    /// Relations with a directory under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` exists but cannot be listed.
    pub fn list(root: &Path) -> Result<Vec<RelationId>> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::io(format!("cannot read {}", root.display()), e).into())
            }
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| CoreError::io(format!("cannot read {}", root.display()), e))?;
            let name = entry.file_name();
            match name.to_str().map(str::parse::<RelationId>) {
                Some(Ok(id)) => ids.push(id),
                _ => tracing::warn!(path = %entry.path().display(), "Ignoring unknown relation state"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load the snapshot, or `None` if the relation has no saved state.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read.
    pub fn load(&self) -> Result<Option<RelationSnapshot>> {
        persist::read(&self.path.join(Self::SNAPSHOT))
    }

    /// Save the snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn save(&self, snapshot: &RelationSnapshot) -> Result<()> {
        persist::write(&self.path.join(Self::SNAPSHOT), snapshot)
    }

    /// Remove the relation's state.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(CoreError::io(format!("cannot remove {}", self.path.display()), e).into())
            }
        }
    }
}
