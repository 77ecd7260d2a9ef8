//! Error types for the unit agent.
//!
//! A failing hook is not an error: it is reported as a unit status and the
//! agent waits for the operator. Everything here ends the agent's run,
//! except where [`UniterError::is_dead`] says the unit is simply gone.

use thiserror::Error;
use uniter_charm::CharmError;
use uniter_core::{CoreError, UnitName};
use uniter_state::StateError;

use crate::lifecycle::ModeKind;

/// A result type using `UniterError`.
pub type Result<T> = std::result::Result<T, UniterError>;

/// Errors that can end the agent's run.
#[derive(Debug, Error)]
pub enum UniterError {
    /// The agent could not start.
    #[error("failed to initialize uniter for unit \"{unit}\": {source}")]
    Init {
        /// The unit the agent was started for.
        unit: UnitName,
        /// What went wrong.
        source: Box<UniterError>,
    },

    /// The charm could not be deployed.
    #[error("charm deployment failed: {0}")]
    Deploy(#[source] CharmError),

    /// Fetching or upgrading the charm failed.
    #[error(transparent)]
    Charm(#[from] CharmError),

    /// The state store refused or failed an operation.
    #[error(transparent)]
    State(#[from] StateError),

    /// A local filesystem operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// On-disk agent state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A hook process could not be started or waited for.
    #[error("cannot run hook {hook:?}: {message}")]
    Hook {
        /// The hook's name.
        hook: String,
        /// What went wrong.
        message: String,
    },

    /// The mode machine attempted a transition it does not allow.
    #[error("invalid mode transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// The current mode.
        from: ModeKind,
        /// The requested mode.
        to: ModeKind,
    },

    /// A watched source closed while the agent was still running.
    #[error("watcher closed")]
    SourceClosed,

    /// The relation engine task is gone.
    #[error("relation engine stopped")]
    EngineClosed,

    /// The agent was asked to stop.
    #[error("agent stopped")]
    Stopped,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl UniterError {
    /// Returns true if the error means the unit is dead, in which case the
    /// agent's work is over rather than failed.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        match self {
            Self::State(e) => e.is_dead(),
            Self::Init { source, .. } => source.is_dead(),
            _ => false,
        }
    }

    pub(crate) fn init(unit: &UnitName, source: Self) -> Self {
        Self::Init {
            unit: unit.clone(),
            source: Box::new(source),
        }
    }
}
