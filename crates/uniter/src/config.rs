//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use uniter_core::UnitName;

/// Configuration for one unit agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Directory holding the charm and the agent's own state.
    pub data_dir: PathBuf,

    /// The unit this agent runs.
    pub unit: UnitName,

    /// Socket path handed to hooks for the helper tools. Defaults to
    /// `<data_dir>/agent.socket`.
    #[serde(default)]
    pub agent_socket: Option<PathBuf>,

    /// How long a hook gets between SIGTERM and SIGKILL on shutdown.
    #[serde(default = "AgentConfig::default_hook_kill_grace")]
    pub hook_kill_grace_seconds: u64,

    /// First delay before retrying a failed charm download.
    #[serde(default = "AgentConfig::default_backoff_initial")]
    pub fetch_backoff_initial_ms: u64,

    /// Upper bound for the download retry delay.
    #[serde(default = "AgentConfig::default_backoff_max")]
    pub fetch_backoff_max_ms: u64,

    /// Capacity of the filter's event channel.
    #[serde(default = "AgentConfig::default_filter_capacity")]
    pub filter_capacity: usize,

    /// Interval between presence pings to the state store.
    #[serde(default = "AgentConfig::default_ping_interval")]
    pub ping_interval_seconds: u64,
}

impl AgentConfig {
    /// A configuration with default tuning.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, unit: UnitName) -> Self {
        Self {
            data_dir: data_dir.into(),
            unit,
            agent_socket: None,
            hook_kill_grace_seconds: Self::default_hook_kill_grace(),
            fetch_backoff_initial_ms: Self::default_backoff_initial(),
            fetch_backoff_max_ms: Self::default_backoff_max(),
            filter_capacity: Self::default_filter_capacity(),
            ping_interval_seconds: Self::default_ping_interval(),
        }
    }

    const fn default_hook_kill_grace() -> u64 {
        5
    }

    const fn default_backoff_initial() -> u64 {
        500
    }

    const fn default_backoff_max() -> u64 {
        30_000
    }

    const fn default_filter_capacity() -> usize {
        16
    }

    const fn default_ping_interval() -> u64 {
        30
    }

    /// The charm working tree.
    #[must_use]
    pub fn charm_dir(&self) -> PathBuf {
        self.data_dir.join("charm")
    }

    /// The agent's private state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    /// The operation log file.
    #[must_use]
    pub fn op_path(&self) -> PathBuf {
        self.state_dir().join("op")
    }

    /// The relation engine's state directory.
    #[must_use]
    pub fn relations_dir(&self) -> PathBuf {
        self.state_dir().join("relations")
    }

    /// The socket path passed to hooks.
    #[must_use]
    pub fn agent_socket(&self) -> PathBuf {
        self.agent_socket
            .clone()
            .unwrap_or_else(|| self.data_dir.join("agent.socket"))
    }

    /// Get the hook kill grace period as a `Duration`.
    #[must_use]
    pub fn hook_kill_grace(&self) -> Duration {
        Duration::from_secs(self.hook_kill_grace_seconds)
    }

    /// Get the initial download retry delay as a `Duration`.
    #[must_use]
    pub fn fetch_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_initial_ms)
    }

    /// Get the maximum download retry delay as a `Duration`.
    #[must_use]
    pub fn fetch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_max_ms)
    }

    /// Get the ping interval as a `Duration`.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }
}
