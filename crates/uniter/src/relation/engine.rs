//! The relation engine task.
//!
//! One task owns every relation the unit takes part in. It watches each
//! relation's life and scope, and hands the mode machine one hook at a time
//! on request. All requests are serialized through a single command channel;
//! the task never runs hooks itself.
//!
//! A hook is saved as the relation's pending hook before it is handed out and
//! committed only when the mode machine reports it complete, so a hook that
//! was handed out but not completed is offered again after a restart.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamMap;
use uniter_core::{HookInfo, HookKind, Life, RelationId, UnitName};
use uniter_state::{RelationRecord, StateError, StateStore};

use super::state::{RelationDir, RelationSnapshot};
use crate::error::{Result, UniterError};

type Reply<T> = oneshot::Sender<Result<T>>;

/// A relation update; `None` once the relation has been removed.
type RecordStream = BoxStream<'static, Option<RelationRecord>>;

enum Command {
    Sync(BTreeSet<RelationId>, Reply<()>),
    Next(Reply<HookInfo>),
    Complete(HookInfo, Reply<()>),
    DepartAll(Reply<usize>),
    Abandon(Reply<()>),
}

/// Handle to the relation engine task. Dropping it stops the task.
#[derive(Debug)]
pub struct RelationEngine {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl RelationEngine {
    /// Start the engine for `unit`, keeping its state under `root`.
    ///
    /// Relations with saved state are picked up straight away. No scope is
    /// entered until the first [`sync`](Self::sync).
    ///
    /// # Errors
    ///
    /// Returns an error if saved state cannot be read.
    pub async fn spawn(
        store: Arc<dyn StateStore>,
        unit: UnitName,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut engine = Engine {
            store,
            unit,
            root: root.into(),
            tracked: BTreeMap::new(),
            watches: StreamMap::new(),
            departing: false,
            cursor: None,
            waiting: None,
        };
        for id in RelationDir::list(&engine.root)? {
            engine.track(id, false).await?;
        }

        let (commands, rx) = mpsc::channel(8);
        let task = tokio::spawn(engine.run(rx));
        Ok(Self { commands, task })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| UniterError::EngineClosed)?;
        rx.await.map_err(|_| UniterError::EngineClosed)?
    }

    /// Bring the tracked relations in line with the unit's relation set,
    /// entering the scope of relations not yet joined. Relations missing
    /// from the set are treated as dying.
    ///
    /// # Errors
    ///
    /// Returns an error if a new relation's scope cannot be entered.
    pub async fn sync(&self, relations: BTreeSet<RelationId>) -> Result<()> {
        self.request(|tx| Command::Sync(relations, tx)).await
    }

    /// Wait for the next relation hook.
    ///
    /// Cancel-safe: a hook handed out to a dropped request stays pending and
    /// is handed out again.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook cannot be saved before it is handed out.
    pub async fn next(&self) -> Result<HookInfo> {
        self.request(Command::Next).await
    }

    /// Record that `hook` has run, or has been skipped by the operator.
    ///
    /// # Errors
    ///
    /// Returns an error if the new relation state cannot be saved.
    pub async fn complete(&self, hook: &HookInfo) -> Result<()> {
        let hook = hook.clone();
        self.request(|tx| Command::Complete(hook, tx)).await
    }

    /// Depart every relation, returning how many have not yet broken.
    ///
    /// From the first call on, every relation is treated as dying and no new
    /// scope is entered.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::EngineClosed` if the task is gone.
    pub async fn depart_all(&self) -> Result<usize> {
        self.request(Command::DepartAll).await
    }

    /// Leave every relation scope without running hooks, and forget all
    /// relation state.
    ///
    /// # Errors
    ///
    /// Returns an error if a scope cannot be left or state cannot be removed.
    pub async fn abandon(&self) -> Result<()> {
        self.request(Command::Abandon).await
    }
}

impl Drop for RelationEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Engine Task
// ============================================================================

struct Tracked {
    dir: RelationDir,
    snapshot: RelationSnapshot,
    /// Peers in scope, excluding this unit.
    members: BTreeMap<UnitName, u64>,
    life: Life,
    in_set: bool,
}

struct Engine {
    store: Arc<dyn StateStore>,
    unit: UnitName,
    root: PathBuf,
    tracked: BTreeMap<RelationId, Tracked>,
    watches: StreamMap<RelationId, RecordStream>,
    departing: bool,
    /// The relation that last had a fresh hook handed out.
    cursor: Option<RelationId>,
    waiting: Option<Reply<HookInfo>>,
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some((id, update)) = self.watches.next(), if !self.watches.is_empty() => {
                    self.observe(&id, update);
                }
            }
            self.offer();
        }
        tracing::debug!(unit = %self.unit, "Relation engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Sync(relations, tx) => {
                let _ = tx.send(self.sync(&relations).await);
            }
            Command::Next(tx) => self.waiting = Some(tx),
            Command::Complete(hook, tx) => {
                let _ = tx.send(self.complete(&hook).await);
            }
            Command::DepartAll(tx) => {
                if !self.departing {
                    tracing::info!(unit = %self.unit, "Departing all relations");
                    self.departing = true;
                }
                let _ = tx.send(Ok(self.tracked.len()));
            }
            Command::Abandon(tx) => {
                let _ = tx.send(self.abandon().await);
            }
        }
    }

    async fn sync(&mut self, relations: &BTreeSet<RelationId>) -> Result<()> {
        for (id, tracked) in &mut self.tracked {
            tracked.in_set = relations.contains(id);
        }
        for id in relations {
            if !self.tracked.contains_key(id) {
                self.track(id.clone(), true).await?;
            }
        }
        Ok(())
    }

    /// Start following a relation, entering its scope if `join` is set.
    /// Relations that were never joined and can no longer be entered are
    /// ignored.
    async fn track(&mut self, id: RelationId, join: bool) -> Result<()> {
        let dir = RelationDir::new(&self.root, &id);
        let saved = dir.load()?;
        if saved.as_ref().is_some_and(|s| s.broken) {
            // Broken before a restart; only the cleanup was left to do.
            return self.forget(&id).await;
        }

        if join && !self.departing {
            match self.store.enter_scope(&id, &self.unit).await {
                Ok(()) => {
                    if saved.is_none() {
                        dir.save(&RelationSnapshot::default())?;
                    }
                }
                Err(StateError::CannotEnterScope(_) | StateError::RelationNotFound(_))
                    if saved.is_none() =>
                {
                    // A crash between entering and saving leaves us in scope.
                    self.store.leave_scope(&id, &self.unit).await?;
                    tracing::debug!(relation = %id, "Relation is not alive; not joining");
                    return Ok(());
                }
                Err(StateError::CannotEnterScope(_) | StateError::RelationNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        } else if saved.is_none() {
            return Ok(());
        }

        let (life, members) = match self.store.watch_relation(&id) {
            Ok(rx) => {
                let (life, members) = {
                    let record = rx.borrow();
                    (record.life, self.peers(&record))
                };
                let updates = WatchStream::new(rx)
                    .map(Some)
                    .chain(stream::once(async { None }))
                    .boxed();
                self.watches.insert(id.clone(), updates);
                (life, members)
            }
            Err(e) if e.is_not_found() => (Life::Dead, BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(relation = %id, peers = members.len(), "Tracking relation");
        self.tracked.insert(
            id,
            Tracked {
                dir,
                snapshot: saved.unwrap_or_default(),
                members,
                life,
                in_set: true,
            },
        );
        Ok(())
    }

    fn peers(&self, record: &RelationRecord) -> BTreeMap<UnitName, u64> {
        record
            .members
            .iter()
            .filter(|(name, _)| **name != self.unit)
            .map(|(name, version)| (name.clone(), *version))
            .collect()
    }

    fn observe(&mut self, id: &RelationId, update: Option<RelationRecord>) {
        let peers = update.as_ref().map(|record| self.peers(record));
        let Some(tracked) = self.tracked.get_mut(id) else {
            return;
        };
        match (update, peers) {
            (Some(record), Some(peers)) => {
                if record.life != tracked.life {
                    tracing::debug!(relation = %id, life = %record.life, "Relation life changed");
                }
                tracked.life = record.life;
                tracked.members = peers;
            }
            _ => {
                tracing::debug!(relation = %id, "Relation removed");
                tracked.life = Life::Dead;
                tracked.members.clear();
            }
        }
    }

    fn is_dying(&self, tracked: &Tracked) -> bool {
        self.departing || !tracked.in_set || tracked.life != Life::Alive
    }

    /// The next hook to hand out, and the relation it belongs to.
    fn choose(&self) -> Option<(RelationId, HookInfo, bool)> {
        if let Some((id, hook)) = self
            .tracked
            .iter()
            .find_map(|(id, t)| t.snapshot.pending.clone().map(|h| (id.clone(), h)))
        {
            return Some((id, hook, false));
        }
        for (id, tracked) in &self.tracked {
            if let Some(hook) =
                tracked
                    .snapshot
                    .follow_up(id, &tracked.members, self.is_dying(tracked))
            {
                return Some((id.clone(), hook, true));
            }
        }

        // Round-robin from the relation after the last one served.
        let order: Vec<(&RelationId, &Tracked)> = match &self.cursor {
            Some(cursor) => self
                .tracked
                .range::<RelationId, _>((Bound::Excluded(cursor), Bound::Unbounded))
                .chain(
                    self.tracked
                        .range::<RelationId, _>((Bound::Unbounded, Bound::Included(cursor))),
                )
                .collect(),
            None => self.tracked.iter().collect(),
        };
        order.into_iter().find_map(|(id, tracked)| {
            tracked
                .snapshot
                .next_hook(id, &tracked.members, self.is_dying(tracked))
                .map(|hook| (id.clone(), hook, true))
        })
    }

    /// Hand a hook to a waiting request, saving it as pending first.
    fn offer(&mut self) {
        if self.waiting.as_ref().map_or(true, oneshot::Sender::is_closed) {
            self.waiting = None;
            return;
        }
        let Some((id, hook, fresh)) = self.choose() else {
            return;
        };
        let Some(tracked) = self.tracked.get_mut(&id) else {
            return;
        };
        let result = if fresh {
            tracked.snapshot.pending = Some(hook.clone());
            tracked.dir.save(&tracked.snapshot).map(|()| hook)
        } else {
            Ok(hook)
        };
        if fresh {
            self.cursor = Some(id);
        }
        if let Some(tx) = self.waiting.take() {
            let _ = tx.send(result);
        }
    }

    async fn complete(&mut self, hook: &HookInfo) -> Result<()> {
        let Some(id) = hook.relation.clone() else {
            return Err(UniterError::Internal(format!(
                "{} is not a relation hook",
                hook.name()
            )));
        };
        let Some(tracked) = self.tracked.get_mut(&id) else {
            tracing::debug!(hook = %hook, "Completed hook for untracked relation");
            return Ok(());
        };
        if tracked.snapshot.pending.as_ref() != Some(hook) {
            tracing::debug!(hook = %hook, "Completed hook was not pending; ignoring");
            return Ok(());
        }
        tracked.snapshot.commit(hook);
        tracked.dir.save(&tracked.snapshot)?;

        if hook.kind == HookKind::RelationBroken {
            self.forget(&id).await?;
            tracing::info!(relation = %id, "Relation broken; scope left");
        }
        Ok(())
    }

    /// Leave a relation's scope and drop everything known about it.
    async fn forget(&mut self, id: &RelationId) -> Result<()> {
        self.store.leave_scope(id, &self.unit).await?;
        RelationDir::new(&self.root, id).remove()?;
        self.tracked.remove(id);
        self.watches.remove(id);
        Ok(())
    }

    async fn abandon(&mut self) -> Result<()> {
        let mut ids: BTreeSet<RelationId> = self.tracked.keys().cloned().collect();
        ids.extend(RelationDir::list(&self.root)?);
        for id in &ids {
            self.store.leave_scope(id, &self.unit).await?;
            RelationDir::new(&self.root, id).remove()?;
        }
        self.tracked.clear();
        self.watches.clear();
        self.departing = true;
        if !ids.is_empty() {
            tracing::info!(unit = %self.unit, relations = ids.len(), "Left all relation scopes");
        }
        Ok(())
    }
}
