//! In-process state store backed by watch channels.
//!
//! `MemoryState` implements [`StateStore`] for a single process. Besides the
//! agent-facing trait it offers the operator-side operations (assigning
//! charms, changing config, resolving errors, managing relations) that a real
//! cluster would perform, so tests and the standalone binary can drive an
//! agent end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uniter_core::{
    AssignedCharm, Life, RelationId, ResolvedMode, ServiceName, UnitName, UnitStatus,
};

use crate::error::{Result, StateError};
use crate::types::{CharmInfo, RelationRecord, UnitRecord};
use crate::StateStore;

/// Initial contents for a [`MemoryState`], usually read from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSeed {
    /// Known charm revisions.
    #[serde(default)]
    pub charms: Vec<CharmInfo>,
    /// Units and their initial assignments.
    #[serde(default)]
    pub units: Vec<UnitSeed>,
    /// Relations and the units taking part in them.
    #[serde(default)]
    pub relations: Vec<RelationSeed>,
}

/// A unit in a [`StateSeed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSeed {
    /// The unit's name.
    pub name: UnitName,
    /// The charm revision assigned to the unit.
    pub charm: AssignedCharm,
    /// The initial configuration version.
    #[serde(default)]
    pub config_version: u64,
}

/// A relation in a [`StateSeed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSeed {
    /// The relation's identity.
    pub id: RelationId,
    /// Units taking part in the relation.
    pub units: Vec<UnitName>,
}

impl StateSeed {
    /// Read a seed from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Seed` if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| StateError::Seed(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| StateError::Seed(format!("cannot parse {}: {e}", path.display())))
    }
}

struct UnitEntry {
    record: watch::Sender<UnitRecord>,
    assigned: watch::Sender<AssignedCharm>,
    config: watch::Sender<u64>,
    relations: watch::Sender<BTreeSet<RelationId>>,
}

struct RelationEntry {
    record: watch::Sender<RelationRecord>,
    endpoints: BTreeSet<UnitName>,
}

#[derive(Default)]
struct Inner {
    units: BTreeMap<UnitName, UnitEntry>,
    relations: BTreeMap<RelationId, RelationEntry>,
    charms: BTreeMap<u64, CharmInfo>,
    pings: BTreeMap<UnitName, DateTime<Utc>>,
}

impl Inner {
    fn unit(&self, unit: &UnitName) -> Result<&UnitEntry> {
        self.units
            .get(unit)
            .ok_or_else(|| StateError::UnitNotFound(unit.clone()))
    }

    fn live_unit(&self, unit: &UnitName) -> Result<&UnitEntry> {
        let entry = self.unit(unit)?;
        if entry.record.borrow().life == Life::Dead {
            return Err(StateError::UnitDead(unit.clone()));
        }
        Ok(entry)
    }

    fn relation(&self, relation: &RelationId) -> Result<&RelationEntry> {
        self.relations
            .get(relation)
            .ok_or_else(|| StateError::RelationNotFound(relation.clone()))
    }

    /// Remove a dying relation once nobody is left in its scope.
    fn reap_relation(&mut self, relation: &RelationId) {
        let Some(entry) = self.relations.get(relation) else {
            return;
        };
        let finished = {
            let record = entry.record.borrow();
            record.life != Life::Alive && record.members.is_empty()
        };
        if !finished {
            return;
        }
        if let Some(entry) = self.relations.remove(relation) {
            entry.record.send_modify(|r| r.life = Life::Dead);
            for unit in &entry.endpoints {
                if let Some(u) = self.units.get(unit) {
                    u.relations.send_if_modified(|set| set.remove(relation));
                }
            }
            tracing::debug!(relation = %relation, "Relation removed");
        }
    }
}

/// A [`StateStore`] held entirely in memory.
#[derive(Default)]
pub struct MemoryState {
    inner: Mutex<Inner>,
}

impl MemoryState {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store populated from a seed.
    #[must_use]
    pub fn from_seed(seed: &StateSeed) -> Self {
        let state = Self::new();
        for charm in &seed.charms {
            state.add_charm(charm.clone());
        }
        for unit in &seed.units {
            state.add_unit(&unit.name, unit.charm);
            if unit.config_version > 0 {
                state.set_config_version(&unit.name, unit.config_version);
            }
        }
        for relation in &seed.relations {
            state.add_relation(&relation.id, &relation.units);
        }
        state
    }

    // =========================================================================
    // Charms
    // =========================================================================

    /// Make a charm revision available for download.
    pub fn add_charm(&self, charm: CharmInfo) {
        self.inner.lock().charms.insert(charm.revision, charm);
    }

    // =========================================================================
    // Units
    // =========================================================================

    /// Add an alive unit with the given charm assignment. Adding an existing
    /// unit again is a no-op.
    pub fn add_unit(&self, unit: &UnitName, charm: AssignedCharm) {
        let mut inner = self.inner.lock();
        inner.units.entry(unit.clone()).or_insert_with(|| UnitEntry {
            record: watch::channel(UnitRecord::new(unit.clone())).0,
            assigned: watch::channel(charm).0,
            config: watch::channel(0).0,
            relations: watch::channel(BTreeSet::new()).0,
        });
    }

    /// Remove a unit entirely, closing all its watchers.
    pub fn remove_unit(&self, unit: &UnitName) {
        self.inner.lock().units.remove(unit);
    }

    /// Assign a charm revision to the unit.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    pub fn set_assigned_charm(&self, unit: &UnitName, charm: AssignedCharm) -> Result<()> {
        let inner = self.inner.lock();
        inner.unit(unit)?.assigned.send_replace(charm);
        Ok(())
    }

    /// Set the configuration version seen by the unit.
    pub fn set_config_version(&self, unit: &UnitName, version: u64) {
        if let Some(entry) = self.inner.lock().units.get(unit) {
            entry.config.send_replace(version);
        }
    }

    /// Bump the configuration version of every unit of a service.
    pub fn change_config(&self, service: &ServiceName) {
        let inner = self.inner.lock();
        for (name, entry) in &inner.units {
            if name.service() == service {
                entry.config.send_modify(|v| *v += 1);
            }
        }
    }

    /// Set the operator's resolved mode.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    pub fn set_resolved(&self, unit: &UnitName, mode: ResolvedMode) -> Result<()> {
        let inner = self.inner.lock();
        inner.unit(unit)?.record.send_modify(|r| r.resolved = mode);
        Ok(())
    }

    /// Advance a unit's life.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist, or
    /// `StateError::Backend` if the life would move backwards.
    pub fn set_unit_life(&self, unit: &UnitName, life: Life) -> Result<()> {
        let inner = self.inner.lock();
        let entry = inner.unit(unit)?;
        let current = entry.record.borrow().life;
        let next = current
            .advance(life)
            .map_err(|e| StateError::Backend(e.to_string()))?;
        entry.record.send_if_modified(|r| {
            let changed = r.life != next;
            r.life = next;
            changed
        });
        Ok(())
    }

    /// Advance the life of a service. Its relations become dying too.
    pub fn set_service_life(&self, service: &ServiceName, life: Life) {
        let mut inner = self.inner.lock();
        for (name, entry) in &inner.units {
            if name.service() == service {
                entry.record.send_if_modified(|r| {
                    let changed = life > r.service_life;
                    if changed {
                        r.service_life = life;
                    }
                    changed
                });
            }
        }
        if life == Life::Alive {
            return;
        }
        let affected: Vec<RelationId> = inner
            .relations
            .iter()
            .filter(|(_, r)| r.endpoints.iter().any(|u| u.service() == service))
            .map(|(id, _)| id.clone())
            .collect();
        for id in affected {
            if let Some(entry) = inner.relations.get(&id) {
                entry.record.send_if_modified(|r| {
                    let changed = r.life == Life::Alive;
                    if changed {
                        r.life = Life::Dying;
                    }
                    changed
                });
            }
            inner.reap_relation(&id);
        }
    }

    /// The unit's current record, if it exists.
    #[must_use]
    pub fn unit_record(&self, unit: &UnitName) -> Option<UnitRecord> {
        self.inner
            .lock()
            .units
            .get(unit)
            .map(|e| e.record.borrow().clone())
    }

    /// When the unit's agent last pinged, if ever.
    #[must_use]
    pub fn last_ping(&self, unit: &UnitName) -> Option<DateTime<Utc>> {
        self.inner.lock().pings.get(unit).copied()
    }

    // =========================================================================
    // Relations
    // =========================================================================

    /// Create a relation between the given units. Adding an existing
    /// relation is a no-op.
    pub fn add_relation(&self, relation: &RelationId, units: &[UnitName]) {
        let mut inner = self.inner.lock();
        if inner.relations.contains_key(relation) {
            return;
        }
        let endpoints: BTreeSet<UnitName> = units.iter().cloned().collect();
        for unit in &endpoints {
            if let Some(entry) = inner.units.get(unit) {
                entry
                    .relations
                    .send_if_modified(|set| set.insert(relation.clone()));
            }
        }
        inner.relations.insert(
            relation.clone(),
            RelationEntry {
                record: watch::channel(RelationRecord::new(relation.clone())).0,
                endpoints,
            },
        );
    }

    /// Mark a relation dying. It is removed once its scope is empty.
    ///
    /// # Errors
    ///
    /// Returns `StateError::RelationNotFound` if the relation does not exist.
    pub fn set_relation_dying(&self, relation: &RelationId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.relation(relation)?.record.send_if_modified(|r| {
            let changed = r.life == Life::Alive;
            if changed {
                r.life = Life::Dying;
            }
            changed
        });
        inner.reap_relation(relation);
        Ok(())
    }

    /// Bump the settings version of a unit in a relation's scope.
    ///
    /// # Errors
    ///
    /// Returns `StateError::RelationNotFound` if the relation does not exist
    /// or the unit is not in its scope.
    pub fn change_settings(&self, relation: &RelationId, unit: &UnitName) -> Result<()> {
        let inner = self.inner.lock();
        let changed = inner.relation(relation)?.record.send_if_modified(|r| {
            r.members.get_mut(unit).map(|v| *v += 1).is_some()
        });
        if changed {
            Ok(())
        } else {
            Err(StateError::RelationNotFound(relation.clone()))
        }
    }

    /// The relation's current record, or `None` once it has been removed.
    #[must_use]
    pub fn relation(&self, relation: &RelationId) -> Option<RelationRecord> {
        self.inner
            .lock()
            .relations
            .get(relation)
            .map(|e| e.record.borrow().clone())
    }
}

#[async_trait]
impl StateStore for MemoryState {
    async fn unit(&self, unit: &UnitName) -> Result<UnitRecord> {
        let inner = self.inner.lock();
        let record = inner.unit(unit)?.record.borrow().clone();
        Ok(record)
    }

    async fn charm(&self, revision: u64) -> Result<CharmInfo> {
        self.inner
            .lock()
            .charms
            .get(&revision)
            .cloned()
            .ok_or(StateError::CharmNotFound(revision))
    }

    fn watch_unit(&self, unit: &UnitName) -> Result<watch::Receiver<UnitRecord>> {
        Ok(self.inner.lock().unit(unit)?.record.subscribe())
    }

    fn watch_assigned_charm(&self, unit: &UnitName) -> Result<watch::Receiver<AssignedCharm>> {
        Ok(self.inner.lock().unit(unit)?.assigned.subscribe())
    }

    fn watch_config(&self, unit: &UnitName) -> Result<watch::Receiver<u64>> {
        Ok(self.inner.lock().unit(unit)?.config.subscribe())
    }

    fn watch_relations(&self, unit: &UnitName) -> Result<watch::Receiver<BTreeSet<RelationId>>> {
        Ok(self.inner.lock().unit(unit)?.relations.subscribe())
    }

    fn watch_relation(&self, relation: &RelationId) -> Result<watch::Receiver<RelationRecord>> {
        Ok(self.inner.lock().relation(relation)?.record.subscribe())
    }

    async fn set_status(&self, unit: &UnitName, status: UnitStatus) -> Result<()> {
        let inner = self.inner.lock();
        inner.live_unit(unit)?.record.send_if_modified(|r| {
            if r.status == status {
                return false;
            }
            r.status = status;
            r.status_since = Some(Utc::now());
            true
        });
        Ok(())
    }

    async fn clear_resolved(&self, unit: &UnitName) -> Result<()> {
        let inner = self.inner.lock();
        inner.live_unit(unit)?.record.send_if_modified(|r| {
            let changed = r.resolved != ResolvedMode::None;
            r.resolved = ResolvedMode::None;
            changed
        });
        Ok(())
    }

    async fn set_current_revision(&self, unit: &UnitName, revision: u64) -> Result<()> {
        let inner = self.inner.lock();
        inner
            .live_unit(unit)?
            .record
            .send_modify(|r| r.charm_revision = Some(revision));
        Ok(())
    }

    async fn enter_scope(&self, relation: &RelationId, unit: &UnitName) -> Result<()> {
        let inner = self.inner.lock();
        inner.live_unit(unit)?;
        let entry = inner.relation(relation)?;
        if entry.record.borrow().life != Life::Alive {
            return Err(StateError::CannotEnterScope(relation.clone()));
        }
        entry.record.send_if_modified(|r| {
            if r.members.contains_key(unit) {
                return false;
            }
            r.members.insert(unit.clone(), 0);
            true
        });
        Ok(())
    }

    async fn leave_scope(&self, relation: &RelationId, unit: &UnitName) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.relations.get(relation) else {
            return Ok(());
        };
        entry
            .record
            .send_if_modified(|r| r.members.remove(unit).is_some());
        inner.reap_relation(relation);
        Ok(())
    }

    async fn ping(&self, unit: &UnitName) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.live_unit(unit)?;
        inner.pings.insert(unit.clone(), Utc::now());
        Ok(())
    }

    async fn ensure_dead(&self, unit: &UnitName) -> Result<()> {
        let inner = self.inner.lock();
        inner.unit(unit)?.record.send_if_modified(|r| {
            let changed = r.life != Life::Dead;
            r.life = Life::Dead;
            changed
        });
        Ok(())
    }
}
