//! Lifecycle and status values observed and written by the unit agent.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// The lifecycle of a unit, service or relation.
///
/// Life only advances: `Alive` → `Dying` → `Dead`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    /// The entity is in normal operation.
    #[default]
    Alive,
    /// The entity has been asked to go away and is cleaning up.
    Dying,
    /// The entity is gone. Terminal.
    Dead,
}

impl Life {
    /// Advance to `next`, refusing to move backwards.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LifeRegression` if `next` is earlier than `self`.
    pub fn advance(self, next: Self) -> Result<Self> {
        if next < self {
            Err(CoreError::LifeRegression {
                from: self,
                to: next,
            })
        } else {
            Ok(next)
        }
    }

    /// Returns true if the entity is no longer alive.
    #[must_use]
    pub const fn is_dying_or_dead(self) -> bool {
        !matches!(self, Self::Alive)
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Alive => "alive",
            Self::Dying => "dying",
            Self::Dead => "dead",
        })
    }
}

/// How the operator asked the agent to leave an error state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedMode {
    /// No resolution requested.
    #[default]
    None,
    /// Skip the failed hook and carry on.
    NoHooks,
    /// Run the failed hook again.
    RetryHooks,
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::NoHooks => "no-hooks",
            Self::RetryHooks => "retry-hooks",
        })
    }
}

/// The status the agent reports for its unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "info", rename_all = "lowercase")]
pub enum UnitStatus {
    /// The agent has not reported anything yet.
    #[default]
    Pending,
    /// The charm is being deployed and installed.
    Installing,
    /// The unit is running.
    Started,
    /// A hook failed or an upgrade could not be merged.
    ///
    /// Carries the failing hook's name or `"upgrade failed"`.
    Error(String),
    /// The `stop` hook has run.
    Stopped,
}

impl UnitStatus {
    /// Info string reported for an unresolved upgrade conflict.
    pub const UPGRADE_FAILED: &'static str = "upgrade failed";

    /// Returns true if this is an error status.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Installing => f.write_str("installing"),
            Self::Started => f.write_str("started"),
            Self::Error(info) => write!(f, "error: {info}"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// The charm revision a unit should be running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignedCharm {
    /// The assigned revision.
    pub revision: u64,
    /// Whether the upgrade must proceed even over conflicts and errors.
    #[serde(default)]
    pub forced: bool,
}

impl AssignedCharm {
    /// An unforced assignment.
    #[must_use]
    pub const fn new(revision: u64) -> Self {
        Self {
            revision,
            forced: false,
        }
    }

    /// A forced assignment.
    #[must_use]
    pub const fn forced(revision: u64) -> Self {
        Self {
            revision,
            forced: true,
        }
    }
}
