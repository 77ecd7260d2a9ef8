//! Error types for the state store.

use thiserror::Error;
use uniter_core::{RelationId, UnitName};

/// A result type using `StateError`.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur when reading or writing shared state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The unit does not exist.
    #[error("unit \"{0}\" not found")]
    UnitNotFound(UnitName),

    /// The relation does not exist.
    #[error("relation {0} not found")]
    RelationNotFound(RelationId),

    /// No charm is known for the requested revision.
    #[error("charm revision {0} not found")]
    CharmNotFound(u64),

    /// The unit is dead; the write was refused.
    #[error("unit \"{0}\" is dead")]
    UnitDead(UnitName),

    /// The relation is no longer alive, so its scope cannot be entered.
    #[error("cannot enter scope of relation {0}: relation is not alive")]
    CannotEnterScope(RelationId),

    /// Seed data could not be read.
    #[error("invalid state seed: {0}")]
    Seed(String),

    /// The backing store failed.
    #[error("state store error: {0}")]
    Backend(String),
}

impl StateError {
    /// Returns true if the write was refused because the unit is dead.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self, Self::UnitDead(_))
    }

    /// Returns true if the error refers to a missing entity.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnitNotFound(_) | Self::RelationNotFound(_) | Self::CharmNotFound(_)
        )
    }
}
