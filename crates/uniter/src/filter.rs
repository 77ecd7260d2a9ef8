//! The filter: one ordered stream of changes to the unit's world.
//!
//! A background task watches the unit record, the assigned charm, the
//! configuration version and the unit's relation set, and forwards what
//! changed over a single bounded channel. Each event carries only the fields
//! that differ from what the consumer has already been sent, so identical
//! consecutive values never produce an event. While the channel is full the
//! task keeps folding newer values into the next event, latest value winning.
//!
//! When any source closes, the task stops and the channel closes after the
//! events already queued.

use std::collections::BTreeSet;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uniter_core::{AssignedCharm, Life, RelationId, ResolvedMode, UnitName};
use uniter_state::{StateStore, UnitRecord};

use crate::error::{Result, UniterError};

/// The consumer's view of the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// The unit's life.
    pub life: Life,
    /// The life of the unit's service.
    pub service_life: Life,
    /// Resolution requested by the operator.
    pub resolved: ResolvedMode,
    /// The charm revision the unit should run.
    pub charm: AssignedCharm,
    /// The service configuration version.
    pub config_version: u64,
    /// Relations the unit takes part in.
    pub relations: BTreeSet<RelationId>,
}

impl Snapshot {
    fn new(
        record: &UnitRecord,
        charm: AssignedCharm,
        config_version: u64,
        relations: BTreeSet<RelationId>,
    ) -> Self {
        Self {
            life: record.life,
            service_life: record.service_life,
            resolved: record.resolved,
            charm,
            config_version,
            relations,
        }
    }

    fn observe(&mut self, record: &UnitRecord) {
        self.life = record.life;
        self.service_life = record.service_life;
        self.resolved = record.resolved;
    }

    /// Returns true once the unit or its service is no longer alive.
    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.life != Life::Alive || self.service_life != Life::Alive
    }

    /// Returns true once the unit is dead.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.life == Life::Dead
    }
}

/// The fields of a [`Snapshot`] that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// New unit life.
    pub life: Option<Life>,
    /// New service life.
    pub service_life: Option<Life>,
    /// New resolved mode.
    pub resolved: Option<ResolvedMode>,
    /// New charm assignment.
    pub charm: Option<AssignedCharm>,
    /// New configuration version.
    pub config_version: Option<u64>,
    /// New relation set.
    pub relations: Option<BTreeSet<RelationId>>,
}

fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
    (old != new).then(|| new.clone())
}

impl Changes {
    fn between(old: &Snapshot, new: &Snapshot) -> Self {
        Self {
            life: changed(&old.life, &new.life),
            service_life: changed(&old.service_life, &new.service_life),
            resolved: changed(&old.resolved, &new.resolved),
            charm: changed(&old.charm, &new.charm),
            config_version: changed(&old.config_version, &new.config_version),
            relations: changed(&old.relations, &new.relations),
        }
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, snapshot: &mut Snapshot) {
        if let Some(life) = self.life {
            snapshot.life = life;
        }
        if let Some(life) = self.service_life {
            snapshot.service_life = life;
        }
        if let Some(resolved) = self.resolved {
            snapshot.resolved = resolved;
        }
        if let Some(charm) = self.charm {
            snapshot.charm = charm;
        }
        if let Some(version) = self.config_version {
            snapshot.config_version = version;
        }
        if let Some(relations) = &self.relations {
            snapshot.relations.clone_from(relations);
        }
    }
}

enum Control {
    ResolvedCleared,
}

/// Receives the unit's changes in order.
#[derive(Debug)]
pub struct Filter {
    snapshot: Snapshot,
    events: mpsc::Receiver<Changes>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl Filter {
    /// Subscribe to `unit`'s sources and start forwarding changes.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    pub fn spawn(store: &dyn StateStore, unit: &UnitName, capacity: usize) -> Result<Self> {
        let mut sources = Sources {
            unit: store.watch_unit(unit)?,
            charm: store.watch_assigned_charm(unit)?,
            config: store.watch_config(unit)?,
            relations: store.watch_relations(unit)?,
        };
        let snapshot = Snapshot::new(
            &sources.unit.borrow_and_update(),
            *sources.charm.borrow_and_update(),
            *sources.config.borrow_and_update(),
            sources.relations.borrow_and_update().clone(),
        );

        let (tx, events) = mpsc::channel(capacity.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward(
            unit.clone(),
            sources,
            snapshot.clone(),
            tx,
            control_rx,
        ));
        Ok(Self {
            snapshot,
            events,
            control,
            task,
        })
    }

    /// The latest values received.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Wait for the next change and apply it to the snapshot.
    ///
    /// Cancel-safe.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::SourceClosed` once a source has closed and all
    /// earlier changes have been received.
    pub async fn changed(&mut self) -> Result<Changes> {
        let changes = self.events.recv().await.ok_or(UniterError::SourceClosed)?;
        changes.apply(&mut self.snapshot);
        Ok(changes)
    }

    /// Note that the resolved mode was cleared in the store, so a later
    /// request for the same mode is delivered again.
    pub fn resolved_cleared(&mut self) {
        self.snapshot.resolved = ResolvedMode::None;
        let _ = self.control.send(Control::ResolvedCleared);
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Sources {
    unit: watch::Receiver<UnitRecord>,
    charm: watch::Receiver<AssignedCharm>,
    config: watch::Receiver<u64>,
    relations: watch::Receiver<BTreeSet<RelationId>>,
}

async fn forward(
    unit: UnitName,
    mut sources: Sources,
    mut current: Snapshot,
    tx: mpsc::Sender<Changes>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut delivered = current.clone();
    loop {
        let pending = Changes::between(&delivered, &current);
        tokio::select! {
            permit = tx.reserve(), if !pending.is_empty() => {
                let Ok(permit) = permit else { break };
                tracing::debug!(unit = %unit, changes = ?pending, "Unit changed");
                permit.send(pending);
                delivered = current.clone();
            }
            result = sources.unit.changed() => {
                if result.is_err() {
                    break;
                }
                current.observe(&sources.unit.borrow_and_update());
            }
            result = sources.charm.changed() => {
                if result.is_err() {
                    break;
                }
                current.charm = *sources.charm.borrow_and_update();
            }
            result = sources.config.changed() => {
                if result.is_err() {
                    break;
                }
                current.config_version = *sources.config.borrow_and_update();
            }
            result = sources.relations.changed() => {
                if result.is_err() {
                    break;
                }
                current.relations.clone_from(&sources.relations.borrow_and_update());
            }
            Some(Control::ResolvedCleared) = control.recv() => {
                // The store was cleared before this was sent, so its record
                // is newer than any resolution still held in `current`.
                delivered.resolved = ResolvedMode::None;
                current.observe(&sources.unit.borrow_and_update());
            }
        }
    }
    tracing::debug!(unit = %unit, "Filter source closed");
}
