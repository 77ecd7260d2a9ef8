//! The uniter: the mode machine that drives a unit through its life.
//!
//! Each mode is an async method that runs until it knows which mode comes
//! next. Every transition is checked against [`validate_transition`], and
//! every hook goes through the operation log so a restarted agent picks up
//! exactly where it stopped.

use std::sync::Arc;

use tokio::sync::watch;
use uniter_charm::{verify_sha256, BundleFetcher, CharmDir, UpgradeOutcome};
use uniter_core::{HookInfo, HookKind, Life, ResolvedMode, UnitName, UnitStatus};
use uniter_state::StateStore;

use crate::agent::stop_requested;
use crate::config::AgentConfig;
use crate::error::{Result, UniterError};
use crate::filter::Filter;
use crate::hook::{HookOutcome, HookRunner};
use crate::lifecycle::{validate_transition, ModeKind};
use crate::oplog::{HookStep, OpLog, OpState, Operation};
use crate::relation::RelationEngine;

/// Why the uniter's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The unit is dead and the agent's work is done.
    Dead,
    /// The agent was asked to stop.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Continue,
    Installing,
    Started,
    Upgrading { revision: u64, forced: bool },
    Conflicted,
    HookError(HookInfo),
    Stopping,
    Terminating,
    Dead,
}

impl Mode {
    const fn kind(&self) -> ModeKind {
        match self {
            Self::Continue => ModeKind::Continue,
            Self::Installing => ModeKind::Installing,
            Self::Started => ModeKind::Started,
            Self::Upgrading { .. } => ModeKind::Upgrading,
            Self::Conflicted => ModeKind::Conflicted,
            Self::HookError(_) => ModeKind::HookError,
            Self::Stopping => ModeKind::Stopping,
            Self::Terminating => ModeKind::Terminating,
            Self::Dead => ModeKind::Dead,
        }
    }
}

/// Drives one unit.
pub struct Uniter {
    unit: UnitName,
    config: AgentConfig,
    store: Arc<dyn StateStore>,
    fetcher: Arc<dyn BundleFetcher>,
    runner: Arc<dyn HookRunner>,
    charm: CharmDir,
    oplog: OpLog,
    op: OpState,
    fresh: bool,
    filter: Filter,
    relations: RelationEngine,
    stop: watch::Receiver<bool>,
    /// Config version the charm last saw through `config-changed`.
    config_sent: Option<u64>,
    /// Config version handed to the `config-changed` hook in flight.
    config_running: Option<u64>,
}

impl std::fmt::Debug for Uniter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uniter")
            .field("unit", &self.unit)
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

impl Uniter {
    /// Prepare the uniter for `config.unit`: check the unit exists, recover
    /// the charm directory, read the operation log and start watching.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Init` if the unit is unknown, the charm
    /// directory is unusable, or local state cannot be read.
    pub async fn new(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn BundleFetcher>,
        runner: Arc<dyn HookRunner>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let unit = config.unit.clone();
        Self::init(config, store, fetcher, runner, stop)
            .await
            .map_err(|e| UniterError::init(&unit, e))
    }

    async fn init(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn BundleFetcher>,
        runner: Arc<dyn HookRunner>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let unit = config.unit.clone();
        store.unit(&unit).await?;

        let charm = CharmDir::new(config.charm_dir());
        charm.check_sane().map_err(UniterError::Deploy)?;
        charm.recover()?;

        let oplog = OpLog::new(config.op_path());
        let (op, fresh) = match oplog.read()? {
            Some(op) => (op, false),
            None => (OpState::default(), true),
        };

        let filter = Filter::spawn(store.as_ref(), &unit, config.filter_capacity)?;
        let relations =
            RelationEngine::spawn(store.clone(), unit.clone(), config.relations_dir()).await?;

        tracing::info!(unit = %unit, op = ?op.op, fresh, "Uniter initialized");
        Ok(Self {
            unit,
            config,
            store,
            fetcher,
            runner,
            charm,
            oplog,
            op,
            fresh,
            filter,
            relations,
            stop,
            config_sent: None,
            config_running: None,
        })
    }

    /// Run until the unit is dead or the agent is stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot continue: local state is
    /// unusable, a charm cannot be deployed or upgraded, or the unit
    /// disappeared from the store.
    pub async fn run(mut self) -> Result<Exit> {
        let mut mode = Mode::Continue;
        loop {
            let from = mode.kind();
            tracing::debug!(unit = %self.unit, mode = ?from, "Entering mode");
            let result = match mode {
                Mode::Continue => self.mode_continue().await,
                Mode::Installing => self.mode_installing().await,
                Mode::Started => self.mode_started().await,
                Mode::Upgrading { revision, forced } => {
                    self.mode_upgrading(revision, forced).await
                }
                Mode::Conflicted => self.mode_conflicted().await,
                Mode::HookError(hook) => self.mode_hook_error(hook).await,
                Mode::Stopping => self.mode_stopping().await,
                Mode::Terminating => self.mode_terminating().await,
                Mode::Dead => {
                    self.relations.abandon().await?;
                    tracing::info!(unit = %self.unit, "Unit is dead");
                    return Ok(Exit::Dead);
                }
            };

            let next = match result {
                Ok(next) => next,
                Err(e) if e.is_dead() => Mode::Dead,
                Err(UniterError::Stopped) => {
                    tracing::info!(unit = %self.unit, mode = ?from, "Uniter stopped");
                    return Ok(Exit::Stopped);
                }
                Err(UniterError::SourceClosed) => self.source_closed().await?,
                Err(e) => {
                    tracing::error!(unit = %self.unit, mode = ?from, error = %e, "Uniter failed");
                    return Err(e);
                }
            };
            validate_transition(from, next.kind())?;
            mode = next;
        }
    }

    /// A watcher closed: find out whether the unit died or vanished.
    async fn source_closed(&self) -> Result<Mode> {
        let record = self.store.unit(&self.unit).await?;
        if record.life == Life::Dead {
            Ok(Mode::Dead)
        } else {
            Err(UniterError::SourceClosed)
        }
    }

    // ========================================================================
    // Modes
    // ========================================================================

    async fn mode_continue(&mut self) -> Result<Mode> {
        if self.fresh {
            return Ok(Mode::Installing);
        }
        match self.op.op.clone() {
            Operation::Continue if self.op.stopped => Ok(Mode::Terminating),
            Operation::Continue => Ok(Mode::Started),
            Operation::RunHook {
                hook,
                step: HookStep::Failed,
            } => Ok(Mode::HookError(hook)),
            // The relation engine saved the hook as pending and offers it
            // again once relations are flowing.
            Operation::RunHook {
                hook,
                step: HookStep::Pending,
            } if hook.kind.is_relation() => Ok(Mode::Started),
            Operation::RunHook {
                hook,
                step: HookStep::Pending,
            } => {
                tracing::info!(unit = %self.unit, hook = %hook, "Re-running interrupted hook");
                self.run_hook(hook).await
            }
            Operation::Upgrade { revision, forced } => {
                if self.charm.is_conflicted()? {
                    Ok(Mode::Conflicted)
                } else if self.charm.current_revision()? == Some(revision) {
                    self.finish_upgrade(revision).await
                } else {
                    Ok(Mode::Upgrading { revision, forced })
                }
            }
        }
    }

    async fn mode_installing(&mut self) -> Result<Mode> {
        self.store
            .set_status(&self.unit, UnitStatus::Installing)
            .await?;
        let revision = match self.charm.current_revision().map_err(UniterError::Deploy)? {
            Some(revision) => revision,
            None => {
                let revision = self.filter.snapshot().charm.revision;
                let bundle = self.download(revision).await?;
                self.charm
                    .deploy(&bundle, revision)
                    .map_err(UniterError::Deploy)?;
                revision
            }
        };
        self.store
            .set_current_revision(&self.unit, revision)
            .await?;
        self.run_hook(HookInfo::unit(HookKind::Install)).await
    }

    async fn mode_started(&mut self) -> Result<Mode> {
        if !self.op.started {
            let next = self.run_hook(HookInfo::unit(HookKind::Start)).await?;
            if next != Mode::Started {
                return Ok(next);
            }
        }
        self.store.set_status(&self.unit, UnitStatus::Started).await?;
        self.sync_relations().await?;

        loop {
            let snapshot = self.filter.snapshot().clone();
            if snapshot.is_dead() {
                return Ok(Mode::Dead);
            }
            if self.config_sent != Some(snapshot.config_version) {
                let next = self
                    .run_hook(HookInfo::unit(HookKind::ConfigChanged))
                    .await?;
                if next != Mode::Started {
                    return Ok(next);
                }
                continue;
            }
            if snapshot.is_dying() {
                return Ok(Mode::Stopping);
            }
            if self.charm.current_revision()? != Some(snapshot.charm.revision) {
                return Ok(Mode::Upgrading {
                    revision: snapshot.charm.revision,
                    forced: snapshot.charm.forced,
                });
            }

            tokio::select! {
                changes = self.filter.changed() => {
                    if changes?.relations.is_some() {
                        self.sync_relations().await?;
                    }
                }
                hook = self.relations.next() => {
                    let next = self.run_hook(hook?).await?;
                    if next != Mode::Started {
                        return Ok(next);
                    }
                }
                () = stop_requested(&mut self.stop) => return Err(UniterError::Stopped),
            }
        }
    }

    async fn mode_upgrading(&mut self, revision: u64, forced: bool) -> Result<Mode> {
        tracing::info!(unit = %self.unit, revision, forced, "Upgrading charm");
        self.write_op(Operation::Upgrade { revision, forced })?;

        let outcome = match self.download(revision).await {
            Ok(bundle) => self
                .charm
                .upgrade(&bundle, revision, forced)
                .map_err(UniterError::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(UpgradeOutcome::Clean) => self.finish_upgrade(revision).await,
            Ok(UpgradeOutcome::Conflicted(paths)) => {
                tracing::warn!(unit = %self.unit, revision, conflicts = ?paths, "Charm upgrade conflicted");
                Ok(Mode::Conflicted)
            }
            Err(e) if e.is_dead() || matches!(e, UniterError::Stopped) => Err(e),
            Err(e) => {
                self.store
                    .set_status(
                        &self.unit,
                        UnitStatus::Error(UnitStatus::UPGRADE_FAILED.to_string()),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn mode_conflicted(&mut self) -> Result<Mode> {
        self.store
            .set_status(
                &self.unit,
                UnitStatus::Error(UnitStatus::UPGRADE_FAILED.to_string()),
            )
            .await?;
        loop {
            let snapshot = self.filter.snapshot().clone();
            if snapshot.is_dead() {
                return Ok(Mode::Dead);
            }
            match snapshot.resolved {
                ResolvedMode::NoHooks => {
                    self.clear_resolved().await?;
                    let revision = self.charm.resolved()?;
                    tracing::info!(unit = %self.unit, revision, "Upgrade conflict resolved");
                    return self.finish_upgrade(revision).await;
                }
                ResolvedMode::RetryHooks => {
                    self.clear_resolved().await?;
                    return Ok(Mode::Upgrading {
                        revision: snapshot.charm.revision,
                        forced: false,
                    });
                }
                ResolvedMode::None => {}
            }
            if snapshot.charm.forced {
                return Ok(Mode::Upgrading {
                    revision: snapshot.charm.revision,
                    forced: true,
                });
            }
            self.wait_for_change().await?;
        }
    }

    async fn mode_hook_error(&mut self, hook: HookInfo) -> Result<Mode> {
        self.store
            .set_status(&self.unit, UnitStatus::Error(hook.name()))
            .await?;
        tracing::info!(unit = %self.unit, hook = %hook, "Waiting for hook error to be resolved");
        loop {
            let snapshot = self.filter.snapshot().clone();
            if snapshot.is_dead() {
                return Ok(Mode::Dead);
            }
            match snapshot.resolved {
                ResolvedMode::NoHooks => {
                    self.clear_resolved().await?;
                    tracing::info!(unit = %self.unit, hook = %hook, "Skipping failed hook");
                    return self.skip_hook(hook).await;
                }
                ResolvedMode::RetryHooks => {
                    self.clear_resolved().await?;
                    return self.run_hook(hook).await;
                }
                ResolvedMode::None => {}
            }
            let assigned = snapshot.charm;
            if assigned.forced && self.charm.current_revision()? != Some(assigned.revision) {
                tracing::info!(
                    unit = %self.unit,
                    hook = %hook,
                    revision = assigned.revision,
                    "Forced upgrade replaces failed hook"
                );
                let next = self.skip_hook(hook).await?;
                if next == Mode::Terminating {
                    return Ok(next);
                }
                return Ok(Mode::Upgrading {
                    revision: assigned.revision,
                    forced: true,
                });
            }
            self.wait_for_change().await?;
        }
    }

    async fn mode_stopping(&mut self) -> Result<Mode> {
        tracing::info!(unit = %self.unit, "Unit is dying");
        while self.relations.depart_all().await? > 0 {
            let hook = tokio::select! {
                hook = self.relations.next() => hook?,
                changes = self.filter.changed() => {
                    changes?;
                    if self.filter.snapshot().is_dead() {
                        return Ok(Mode::Dead);
                    }
                    continue;
                }
                () = stop_requested(&mut self.stop) => return Err(UniterError::Stopped),
            };
            let next = self.run_hook(hook).await?;
            if next != Mode::Started {
                return Ok(next);
            }
        }
        if self.op.stopped {
            return Ok(Mode::Terminating);
        }
        self.run_hook(HookInfo::unit(HookKind::Stop)).await
    }

    async fn mode_terminating(&mut self) -> Result<Mode> {
        self.store.set_status(&self.unit, UnitStatus::Stopped).await?;
        self.relations.abandon().await?;
        self.store.ensure_dead(&self.unit).await?;
        tracing::info!(unit = %self.unit, "Unit marked dead");
        Ok(Mode::Dead)
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Run a hook through the operation log. Success moves on; failure
    /// records the hook as failed and enters `HookError`.
    async fn run_hook(&mut self, hook: HookInfo) -> Result<Mode> {
        if hook.kind == HookKind::ConfigChanged {
            self.config_running = Some(self.filter.snapshot().config_version);
        }
        self.write_op(Operation::RunHook {
            hook: hook.clone(),
            step: HookStep::Pending,
        })?;

        match self.runner.run(&hook).await? {
            HookOutcome::Success | HookOutcome::Missing => self.commit_hook(hook).await,
            HookOutcome::Failure => {
                self.write_op(Operation::RunHook {
                    hook: hook.clone(),
                    step: HookStep::Failed,
                })?;
                self.store
                    .set_status(&self.unit, UnitStatus::Error(hook.name()))
                    .await?;
                Ok(Mode::HookError(hook))
            }
        }
    }

    /// Record a failed hook as done without running it. A skipped
    /// `config-changed` leaves the configuration unsent.
    async fn skip_hook(&mut self, hook: HookInfo) -> Result<Mode> {
        self.config_running = None;
        self.commit_hook(hook).await
    }

    /// Record a hook as done.
    async fn commit_hook(&mut self, hook: HookInfo) -> Result<Mode> {
        if hook.kind.is_relation() {
            self.relations.complete(&hook).await?;
        }
        match hook.kind {
            HookKind::Start => self.op.started = true,
            HookKind::ConfigChanged => self.config_sent = self.config_running.take(),
            // A new charm has not seen the current configuration.
            HookKind::UpgradeCharm => self.config_sent = None,
            HookKind::Stop => self.op.stopped = true,
            _ => {}
        }
        self.write_op(Operation::Continue)?;
        tracing::debug!(unit = %self.unit, hook = %hook, "Hook committed");

        if hook.kind == HookKind::Stop {
            Ok(Mode::Terminating)
        } else {
            Ok(Mode::Started)
        }
    }

    fn write_op(&mut self, op: Operation) -> Result<()> {
        self.op.op = op;
        self.oplog.write(&self.op)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn finish_upgrade(&mut self, revision: u64) -> Result<Mode> {
        self.store
            .set_current_revision(&self.unit, revision)
            .await?;
        tracing::info!(unit = %self.unit, revision, "Charm upgraded");
        self.run_hook(HookInfo::unit(HookKind::UpgradeCharm)).await
    }

    /// Fetch and verify a charm bundle, retrying transient failures with
    /// capped exponential backoff.
    async fn download(&mut self, revision: u64) -> Result<Vec<u8>> {
        let info = self.store.charm(revision).await?;
        let mut delay = self.config.fetch_backoff_initial();
        loop {
            let attempt = tokio::select! {
                result = self.fetcher.fetch(&info.url) => result,
                () = stop_requested(&mut self.stop) => return Err(UniterError::Stopped),
            };
            match attempt {
                Ok(bundle) => {
                    verify_sha256(&bundle, &info.sha256)?;
                    tracing::info!(url = %info.url, revision, "Downloaded charm");
                    return Ok(bundle);
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(
                        url = %info.url,
                        error = %e,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Charm download failed"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = stop_requested(&mut self.stop) => return Err(UniterError::Stopped),
                    }
                    delay = (delay * 2).min(self.config.fetch_backoff_max());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hand the unit's relation set to the engine, unless the unit is
    /// already on its way out.
    async fn sync_relations(&self) -> Result<()> {
        let snapshot = self.filter.snapshot();
        if snapshot.is_dying() {
            return Ok(());
        }
        self.relations.sync(snapshot.relations.clone()).await
    }

    async fn clear_resolved(&mut self) -> Result<()> {
        self.store.clear_resolved(&self.unit).await?;
        self.filter.resolved_cleared();
        Ok(())
    }

    async fn wait_for_change(&mut self) -> Result<()> {
        tokio::select! {
            changes = self.filter.changed() => changes.map(|_| ()),
            () = stop_requested(&mut self.stop) => Err(UniterError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use uniter_charm::{sha256_hex, BundleBuilder, MemoryFetcher};
    use uniter_core::AssignedCharm;
    use uniter_state::{CharmInfo, MemoryState};

    use crate::hook::mock::RecordingRunner;

    fn unit() -> UnitName {
        "u/0".parse().unwrap()
    }

    struct Harness {
        dir: TempDir,
        store: Arc<MemoryState>,
        fetcher: Arc<MemoryFetcher>,
        runner: Arc<RecordingRunner>,
        stop: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let harness = Self {
                dir: TempDir::new().unwrap(),
                store: Arc::new(MemoryState::new()),
                fetcher: Arc::new(MemoryFetcher::new()),
                runner: Arc::new(RecordingRunner::new()),
                stop: watch::channel(false).0,
            };
            harness.add_charm(0);
            harness.add_charm(1);
            harness.store.add_unit(&unit(), AssignedCharm::new(0));
            harness.store.set_config_version(&unit(), 1);
            harness
        }

        fn add_charm(&self, revision: u64) {
            let bundle = BundleBuilder::new()
                .file("revision", format!("{revision}\n"))
                .build();
            let url = format!("http://charms.test/{revision}");
            self.store.add_charm(CharmInfo {
                revision,
                url: url.clone(),
                sha256: sha256_hex(&bundle),
            });
            self.fetcher.insert(url, bundle);
        }

        async fn spawn(&self) -> JoinHandle<Result<Exit>> {
            let uniter = Uniter::new(
                AgentConfig::new(self.dir.path(), unit()),
                self.store.clone(),
                self.fetcher.clone(),
                self.runner.clone(),
                self.stop.subscribe(),
            )
            .await
            .unwrap();
            tokio::spawn(uniter.run())
        }

        fn status(&self) -> UnitStatus {
            self.store.unit_record(&unit()).unwrap().status
        }

        async fn settle(&self, expected: &[&str], status: &UnitStatus) {
            let reached = tokio::time::timeout(Duration::from_secs(5), async {
                while self.runner.trace() != expected || self.status() != *status {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            assert!(
                reached.is_ok(),
                "expected {expected:?} in {status:?}, got {:?} in {:?}",
                self.runner.trace(),
                self.status()
            );
        }

        async fn stop(&self, task: JoinHandle<Result<Exit>>) {
            self.stop.send_replace(true);
            assert_eq!(task.await.unwrap().unwrap(), Exit::Stopped);
        }
    }

    #[tokio::test]
    async fn forced_upgrade_overrides_hook_error() {
        let h = Harness::new();
        h.runner.fail("start", 1);
        let task = h.spawn().await;
        h.settle(&["install", "start"], &UnitStatus::Error("start".into()))
            .await;

        h.store
            .set_assigned_charm(&unit(), AssignedCharm::forced(1))
            .unwrap();
        h.settle(
            &["install", "start", "upgrade-charm", "config-changed"],
            &UnitStatus::Started,
        )
        .await;
        assert_eq!(
            h.store.unit_record(&unit()).unwrap().charm_revision,
            Some(1)
        );
        h.stop(task).await;
    }

    #[tokio::test]
    async fn unforced_upgrade_waits_for_hook_error() {
        let h = Harness::new();
        h.runner.fail("start", 1);
        let task = h.spawn().await;
        h.settle(&["install", "start"], &UnitStatus::Error("start".into()))
            .await;

        h.store
            .set_assigned_charm(&unit(), AssignedCharm::new(1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.runner.trace(), ["install", "start"]);

        h.store
            .set_resolved(&unit(), ResolvedMode::RetryHooks)
            .unwrap();
        h.settle(
            &[
                "install",
                "start",
                "start",
                "config-changed",
                "upgrade-charm",
                "config-changed",
            ],
            &UnitStatus::Started,
        )
        .await;
        h.stop(task).await;
    }

    #[tokio::test]
    async fn skipped_config_changed_runs_once_more() {
        let h = Harness::new();
        h.runner.fail("config-changed", 1);
        let task = h.spawn().await;
        h.settle(
            &["install", "start", "config-changed"],
            &UnitStatus::Error("config-changed".into()),
        )
        .await;

        h.store.set_resolved(&unit(), ResolvedMode::NoHooks).unwrap();
        h.settle(
            &["install", "start", "config-changed", "config-changed"],
            &UnitStatus::Started,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.runner.trace().len(), 4);

        h.store.set_config_version(&unit(), 2);
        h.settle(
            &[
                "install",
                "start",
                "config-changed",
                "config-changed",
                "config-changed",
            ],
            &UnitStatus::Started,
        )
        .await;
        h.stop(task).await;
    }

    #[tokio::test]
    async fn failed_stop_resolved_terminates() {
        let h = Harness::new();
        h.runner.fail("stop", 1);
        let task = h.spawn().await;
        h.settle(&["install", "start", "config-changed"], &UnitStatus::Started)
            .await;

        h.store.set_unit_life(&unit(), Life::Dying).unwrap();
        h.settle(
            &["install", "start", "config-changed", "stop"],
            &UnitStatus::Error("stop".into()),
        )
        .await;

        h.store.set_resolved(&unit(), ResolvedMode::NoHooks).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, Exit::Dead);
        let record = h.store.unit_record(&unit()).unwrap();
        assert_eq!(record.life, Life::Dead);
        assert_eq!(record.status, UnitStatus::Stopped);
        assert_eq!(h.runner.trace().len(), 4);
    }

    #[tokio::test]
    async fn upgrade_interrupted_after_commit_runs_upgrade_charm() {
        let h = Harness::new();
        let task = h.spawn().await;
        h.settle(&["install", "start", "config-changed"], &UnitStatus::Started)
            .await;
        h.stop(task).await;

        // As if the agent died between committing revision 1 and recording
        // the upgrade-charm hook.
        let charm = CharmDir::new(h.dir.path().join("charm"));
        let bundle = h.fetcher.fetch("http://charms.test/1").await.unwrap();
        assert_eq!(charm.upgrade(&bundle, 1, false).unwrap(), UpgradeOutcome::Clean);
        let oplog = OpLog::new(h.dir.path().join("state/op"));
        let mut state = oplog.read().unwrap().unwrap();
        state.op = Operation::Upgrade {
            revision: 1,
            forced: false,
        };
        oplog.write(&state).unwrap();
        h.store
            .set_assigned_charm(&unit(), AssignedCharm::new(1))
            .unwrap();

        let task = h.spawn().await;
        h.settle(
            &[
                "install",
                "start",
                "config-changed",
                "upgrade-charm",
                "config-changed",
            ],
            &UnitStatus::Started,
        )
        .await;
        assert_eq!(
            h.store.unit_record(&unit()).unwrap().charm_revision,
            Some(1)
        );
        h.stop(task).await;
    }
}
