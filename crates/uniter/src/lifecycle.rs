//! Mode machine transitions.
//!
//! # Modes
//!
//! ```text
//!                   ┌────────────┐
//!                   │  Continue  │ (startup: replay the operation log)
//!                   └─────┬──────┘
//!                         │ (nothing recorded)
//!                         ▼
//!                   ┌────────────┐
//!                   │ Installing │
//!                   └─────┬──────┘
//!                         │ (install ok)
//!                         ▼
//!     ┌───────────────────────────────────────┐
//!     │                Started                │◄────────────┐
//!     └───────────────────────────────────────┘             │
//!          │ (revision)      │ (hook failed)   │ (dying)     │
//!          ▼                 ▼                 ▼             │
//!     ┌───────────┐    ┌───────────┐     ┌──────────┐        │
//!     │ Upgrading │    │ HookError │     │ Stopping │        │
//!     └─────┬─────┘    └─────┬─────┘     └────┬─────┘        │
//!           │ (conflict)     │ (resolved)     │ (stop ok)    │
//!           ▼                └────────────────┼─────────────►┤
//!     ┌────────────┐                          ▼              │
//!     │ Conflicted │                   ┌─────────────┐       │
//!     └─────┬──────┘                   │ Terminating │       │
//!           │ (resolved)               └─────────────┘       │
//!           └────────────────────────────────────────────────┘
//! ```
//!
//! Any hook can fail into `HookError`, and a forced upgrade takes
//! `HookError` or `Conflicted` straight to `Upgrading`. Any mode may move to
//! `Dead` when the unit is observed dead.

use crate::error::{Result, UniterError};

/// The kinds of mode the machine can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    /// Startup: decide where to resume from the operation log.
    Continue,
    /// Deploying the charm and running `install`.
    Installing,
    /// Running `start` if needed, then reacting to changes.
    Started,
    /// Fetching and merging a new charm revision.
    Upgrading,
    /// Waiting for the operator to resolve an upgrade conflict.
    Conflicted,
    /// Waiting for the operator to resolve a failed hook.
    HookError,
    /// Departing relations and running `stop`.
    Stopping,
    /// Reporting `stop` and marking the unit dead.
    Terminating,
    /// The unit is dead; leave relation scopes and exit.
    Dead,
}

/// Validates a mode transition and returns the target if valid.
///
/// # Errors
///
/// Returns `UniterError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(from: ModeKind, to: ModeKind) -> Result<ModeKind> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(UniterError::InvalidTransition { from, to })
    }
}

/// Check if a mode transition is allowed.
#[must_use]
pub const fn is_valid_transition(from: ModeKind, to: ModeKind) -> bool {
    use ModeKind::{
        Conflicted, Continue, Dead, HookError, Installing, Started, Stopping, Terminating,
        Upgrading,
    };

    matches!(
        (from, to),
        // Any live mode can observe the unit dead
        (
            Continue | Installing | Started | Upgrading | Conflicted | HookError | Stopping
                | Terminating,
            Dead
        )
            // Startup can resume anywhere the operation log points
            | (
                Continue,
                Installing | Started | Upgrading | Conflicted | HookError | Terminating
            )
            | (Installing, Started | HookError)
            | (Started, Upgrading | HookError | Stopping)
            | (Upgrading, Started | Conflicted | HookError)
            | (Conflicted, Started | Upgrading | HookError)
            | (HookError, Started | Upgrading | HookError | Terminating)
            | (Stopping, HookError | Terminating)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        assert!(is_valid_transition(ModeKind::Continue, ModeKind::Installing));
        assert!(is_valid_transition(ModeKind::Installing, ModeKind::Started));
        assert!(is_valid_transition(ModeKind::Started, ModeKind::Upgrading));
        assert!(is_valid_transition(ModeKind::Upgrading, ModeKind::Started));
        assert!(is_valid_transition(ModeKind::Started, ModeKind::Stopping));
        assert!(is_valid_transition(ModeKind::Stopping, ModeKind::Terminating));
    }

    #[test]
    fn everything_can_die() {
        for mode in [
            ModeKind::Continue,
            ModeKind::Installing,
            ModeKind::Started,
            ModeKind::Upgrading,
            ModeKind::Conflicted,
            ModeKind::HookError,
            ModeKind::Stopping,
            ModeKind::Terminating,
        ] {
            assert!(is_valid_transition(mode, ModeKind::Dead), "{mode:?}");
        }
    }

    #[test]
    fn dead_is_final() {
        assert!(is_valid_transition(ModeKind::Terminating, ModeKind::Dead));
        assert!(!is_valid_transition(ModeKind::Dead, ModeKind::Started));
        assert!(!is_valid_transition(ModeKind::Dead, ModeKind::Dead));
        assert!(!is_valid_transition(ModeKind::Terminating, ModeKind::Started));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(!is_valid_transition(ModeKind::Installing, ModeKind::Upgrading));
        assert!(!is_valid_transition(ModeKind::Conflicted, ModeKind::Installing));
        // A dying unit waits for its conflict to be resolved.
        assert!(!is_valid_transition(ModeKind::Conflicted, ModeKind::Stopping));

        let err = validate_transition(ModeKind::Installing, ModeKind::Conflicted).unwrap_err();
        assert!(matches!(err, UniterError::InvalidTransition { .. }));
    }
}
