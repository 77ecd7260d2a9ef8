//! The agent: a running uniter plus its presence pinger, and the handle used
//! to stop it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uniter_charm::BundleFetcher;
use uniter_core::UnitName;
use uniter_state::StateStore;

use crate::config::AgentConfig;
use crate::error::{Result, UniterError};
use crate::hook::{HookRunner, ProcessRunner};
use crate::machine::{Exit, Uniter};

/// Resolves once a stop has been requested. Never resolves if the trigger
/// is dropped without firing.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Asks an agent to stop; can be cloned and moved to other tasks.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// Ask the agent to stop. A running hook is terminated.
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Handle to a running unit agent.
///
/// Dropping the handle leaves the agent running; use [`Agent::stop`].
#[derive(Debug)]
pub struct Agent {
    unit: UnitName,
    stop: StopHandle,
    task: JoinHandle<Result<Exit>>,
}

impl Agent {
    /// Start an agent that runs hooks as processes in the charm directory.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Init` if the uniter cannot be initialized.
    pub async fn start(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn BundleFetcher>,
    ) -> Result<Self> {
        let (stop, stop_rx) = watch::channel(false);
        let runner = Arc::new(ProcessRunner::new(
            config.unit.clone(),
            config.charm_dir(),
            config.agent_socket(),
            config.hook_kill_grace(),
            stop_rx.clone(),
        ));
        Self::launch(config, store, fetcher, runner, stop, stop_rx).await
    }

    /// Start an agent with a custom hook runner.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Init` if the uniter cannot be initialized.
    pub async fn start_with_runner(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn BundleFetcher>,
        runner: Arc<dyn HookRunner>,
    ) -> Result<Self> {
        let (stop, stop_rx) = watch::channel(false);
        Self::launch(config, store, fetcher, runner, stop, stop_rx).await
    }

    async fn launch(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn BundleFetcher>,
        runner: Arc<dyn HookRunner>,
        stop: watch::Sender<bool>,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let unit = config.unit.clone();
        let interval = config.ping_interval();
        let uniter = Uniter::new(config, store.clone(), fetcher, runner, stop_rx).await?;

        tracing::info!(unit = %unit, "Starting unit agent");
        let pinger_unit = unit.clone();
        let task = tokio::spawn(async move {
            let pinger = tokio::spawn(ping(store, pinger_unit, interval));
            let result = uniter.run().await;
            pinger.abort();
            result
        });
        Ok(Self {
            unit,
            stop: StopHandle(Arc::new(stop)),
            task,
        })
    }

    /// The unit this agent runs.
    #[must_use]
    pub fn unit(&self) -> &UnitName {
        &self.unit
    }

    /// Ask the agent to stop. A running hook is terminated.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// A handle that can stop the agent from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Returns true once the agent has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the agent to exit.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the agent's run.
    pub async fn wait(self) -> Result<Exit> {
        self.task
            .await
            .map_err(|e| UniterError::Internal(format!("agent task failed: {e}")))?
    }

    /// Stop the agent and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the agent's run.
    pub async fn stop_and_wait(self) -> Result<Exit> {
        self.stop();
        self.wait().await
    }
}

/// Report the agent's presence until the unit is dead.
async fn ping(store: Arc<dyn StateStore>, unit: UnitName, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match store.ping(&unit).await {
            Ok(()) => tracing::trace!(unit = %unit, "Pinged"),
            Err(e) if e.is_dead() => break,
            Err(e) => tracing::warn!(unit = %unit, error = %e, "Presence ping failed"),
        }
    }
}
