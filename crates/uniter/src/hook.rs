//! Running hook scripts.
//!
//! A hook is an executable at `<charm>/hooks/<name>`. The runner starts it
//! with the agent's hook environment, streams its output into the agent log
//! and reports how it ended. It never retries and has no timeout of its own;
//! the only way to cut a hook short is the agent's stop trigger, which sends
//! SIGTERM and then SIGKILL after a grace period.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use uniter_core::{HookInfo, UnitName};

use crate::agent::stop_requested;
use crate::error::{Result, UniterError};

/// How long to keep reading a hook's output after it exits.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// How a hook run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The charm has no such hook; treated as success.
    Missing,
    /// The hook exited with status 0.
    Success,
    /// The hook exited non-zero or was killed by a signal.
    Failure,
}

// ============================================================================
// HookRunner Trait
// ============================================================================

/// Runs hooks for one unit.
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run `hook` to completion.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Stopped` if the agent was stopped while the
    /// hook ran, or `UniterError::Hook` if the process could not be managed.
    /// A hook that fails is `Ok(HookOutcome::Failure)`.
    async fn run(&self, hook: &HookInfo) -> Result<HookOutcome>;
}

// ============================================================================
// Process Runner
// ============================================================================

/// Runs hooks as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    unit: UnitName,
    charm_dir: PathBuf,
    agent_socket: PathBuf,
    kill_grace: Duration,
    stop: watch::Receiver<bool>,
}

impl ProcessRunner {
    /// Create a runner for `unit`'s hooks in `charm_dir`.
    #[must_use]
    pub fn new(
        unit: UnitName,
        charm_dir: impl Into<PathBuf>,
        agent_socket: impl Into<PathBuf>,
        kill_grace: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            unit,
            charm_dir: charm_dir.into(),
            agent_socket: agent_socket.into(),
            kill_grace,
            stop,
        }
    }

    fn command(&self, hook: &HookInfo, path: &Path) -> Command {
        let mut cmd = Command::new(path);
        cmd.current_dir(&self.charm_dir)
            .env("JUJU_UNIT_NAME", self.unit.to_string())
            .env("JUJU_CHARM_DIR", &self.charm_dir)
            .env("JUJU_AGENT_SOCKET", &self.agent_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(relation) = &hook.relation {
            let remote = hook
                .remote_unit
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            cmd.env("JUJU_RELATION", relation.name())
                .env("JUJU_RELATION_ID", relation.to_string())
                .env("JUJU_REMOTE_UNIT", remote);
        }
        cmd
    }

    async fn spawn(&self, hook: &HookInfo, path: &Path) -> Result<Child> {
        let mut attempts = 0;
        loop {
            match self.command(hook, path).spawn() {
                Ok(child) => return Ok(child),
                // A freshly written hook can still be open in a child forked
                // by another thread.
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
                    && attempts < 5 =>
                {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => {
                    return Err(UniterError::Hook {
                        hook: hook.name(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// SIGTERM the hook, then SIGKILL it if it outlives the grace period.
    async fn terminate(&self, child: &mut Child, name: &str) {
        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!(hook = %name, error = %e, "Cannot signal hook");
            }
        }
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            tracing::warn!(hook = %name, "Hook ignored SIGTERM, killing it");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    async fn wait(&self, child: &mut Child, name: &str) -> Result<ExitStatus> {
        let mut stop = self.stop.clone();
        tokio::select! {
            status = child.wait() => status.map_err(|e| UniterError::Hook {
                hook: name.to_string(),
                message: e.to_string(),
            }),
            () = stop_requested(&mut stop) => {
                tracing::info!(hook = %name, "Stopping running hook");
                self.terminate(child, name).await;
                Err(UniterError::Stopped)
            }
        }
    }
}

#[async_trait]
impl HookRunner for ProcessRunner {
    async fn run(&self, hook: &HookInfo) -> Result<HookOutcome> {
        if *self.stop.borrow() {
            return Err(UniterError::Stopped);
        }
        let name = hook.name();
        let path = self.charm_dir.join("hooks").join(&name);
        let runnable = std::fs::metadata(&path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if !runnable {
            tracing::info!(hook = %name, "Skipped missing {name:?} hook");
            return Ok(HookOutcome::Missing);
        }

        let prefix = match &hook.relation {
            Some(relation) => format!("{} {relation}", self.unit),
            None => self.unit.to_string(),
        };
        let mut child = self.spawn(hook, &path).await?;
        let mut loggers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            loggers.push(tokio::spawn(log_output(stdout, prefix.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            loggers.push(tokio::spawn(log_output(stderr, prefix)));
        }

        let status = self.wait(&mut child, &name).await;
        for logger in loggers {
            // Processes the hook left behind may keep its output open.
            if status.is_err() {
                logger.abort();
            } else if tokio::time::timeout(OUTPUT_DRAIN, logger).await.is_err() {
                tracing::debug!(hook = %name, "Hook output still open after exit");
            }
        }

        if status?.success() {
            tracing::info!(hook = %name, "ran {name:?} hook");
            Ok(HookOutcome::Success)
        } else {
            tracing::warn!(hook = %name, "hook failed");
            Ok(HookOutcome::Failure)
        }
    }
}

async fn log_output<R: AsyncRead + Unpin>(stream: R, prefix: String) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!("{prefix}: {line}");
    }
}

// ============================================================================
// Recording Runner
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! A runner that records hooks instead of running them.

    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uniter_core::HookInfo;

    use super::{HookOutcome, HookRunner};
    use crate::error::Result;

    /// Records every hook it is asked to run.
    ///
    /// Hooks succeed unless a number of failures has been queued for their
    /// name.
    #[derive(Debug, Default)]
    pub struct RecordingRunner {
        ran: Mutex<Vec<HookInfo>>,
        failures: Mutex<HashMap<String, usize>>,
    }

    impl RecordingRunner {
        /// Create a runner with no queued failures.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `times` runs of the hook called `name`.
        pub fn fail(&self, name: &str, times: usize) {
            self.failures.lock().insert(name.to_string(), times);
        }

        /// Hooks run so far, in order, as `name [remote] [relation]`.
        #[must_use]
        pub fn trace(&self) -> Vec<String> {
            self.ran.lock().iter().map(ToString::to_string).collect()
        }
    }

    #[async_trait]
    impl HookRunner for RecordingRunner {
        async fn run(&self, hook: &HookInfo) -> Result<HookOutcome> {
            self.ran.lock().push(hook.clone());
            let mut failures = self.failures.lock();
            match failures.get_mut(&hook.name()) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Ok(HookOutcome::Failure)
                }
                _ => Ok(HookOutcome::Success),
            }
        }
    }
}
