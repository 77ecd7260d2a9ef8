//! The operation log: the agent's write-ahead record.
//!
//! Before the agent runs a hook or starts an upgrade it records the
//! operation here; once the outcome is reflected in state it records
//! [`Operation::Continue`]. A restarted agent reads the record to find out
//! what it was doing when it went away.
//!
//! The file holds a single [`OpState`] and is replaced atomically on every
//! write.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uniter_core::HookInfo;

use crate::error::Result;
use crate::persist;

/// How far a recorded hook got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookStep {
    /// About to run, or running. May or may not have executed.
    Pending,
    /// Ran and failed; waiting for the operator.
    Failed,
}

/// The operation in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Operation {
    /// A hook is being run.
    RunHook {
        /// The hook.
        hook: HookInfo,
        /// How far it got.
        step: HookStep,
    },
    /// The charm is being upgraded.
    Upgrade {
        /// Target revision.
        revision: u64,
        /// Whether conflicts are settled in favour of the new revision.
        forced: bool,
    },
    /// Nothing in progress.
    Continue,
}

/// The recorded state of the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpState {
    /// The operation in progress.
    pub op: Operation,
    /// Whether `start` has completed.
    pub started: bool,
    /// Whether `stop` has completed.
    pub stopped: bool,
}

impl Default for OpState {
    fn default() -> Self {
        Self {
            op: Operation::Continue,
            started: false,
            stopped: false,
        }
    }
}

/// The operation log file.
#[derive(Debug, Clone)]
pub struct OpLog {
    path: PathBuf,
}

impl OpLog {
    /// Use the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded state, or `None` if nothing was ever recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn read(&self) -> Result<Option<OpState>> {
        persist::read(&self.path)
    }

    /// Replace the recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, state: &OpState) -> Result<()> {
        persist::write(&self.path, state)?;
        tracing::trace!(op = ?state.op, "Operation recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uniter_core::HookKind;

    #[test]
    fn missing_log_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let log = OpLog::new(dir.path().join("state/op"));
        assert!(log.read().unwrap().is_none());
    }

    #[test]
    fn state_survives_rewrite() {
        let dir = TempDir::new().unwrap();
        let log = OpLog::new(dir.path().join("state/op"));

        let mut state = OpState {
            op: Operation::RunHook {
                hook: HookInfo::unit(HookKind::Start),
                step: HookStep::Pending,
            },
            ..OpState::default()
        };
        log.write(&state).unwrap();
        assert_eq!(log.read().unwrap(), Some(state.clone()));

        state.op = Operation::Continue;
        state.started = true;
        log.write(&state).unwrap();
        assert_eq!(log.read().unwrap(), Some(state));

        let upgrade = OpState {
            op: Operation::Upgrade {
                revision: 2,
                forced: true,
            },
            started: true,
            stopped: false,
        };
        log.write(&upgrade).unwrap();
        assert_eq!(log.read().unwrap(), Some(upgrade));
    }

    #[test]
    fn corrupt_log_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("op");
        std::fs::write(&path, b"\xff\xff garbage").unwrap();
        assert!(OpLog::new(path).read().is_err());
    }
}
