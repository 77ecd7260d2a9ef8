//! Shared state store contract for the unit agent.
//!
//! The agent never owns the cluster state; it observes it and writes a small
//! set of outcomes back. This crate captures that contract as the
//! [`StateStore`] trait and ships [`MemoryState`], an in-process implementation
//! used by tests and by the standalone agent binary.
//!
//! # Observables
//!
//! Observables are exposed as `tokio::sync::watch` receivers. A receiver
//! always holds the latest value; when the store drops the sender (the
//! entity went away) the receiver's `changed()` returns an error, which the
//! agent treats as the end of that source.
//!
//! # Example
//!
//! ```
//! use uniter_core::{AssignedCharm, UnitName};
//! use uniter_state::{CharmInfo, MemoryState, StateStore};
//!
//! # async fn example() -> uniter_state::Result<()> {
//! let state = MemoryState::new();
//! state.add_charm(CharmInfo {
//!     revision: 0,
//!     url: "http://charms.local/dummy-0.tar.gz".into(),
//!     sha256: "00".repeat(32),
//! });
//! let unit: UnitName = "u/0".parse().unwrap();
//! state.add_unit(&unit, AssignedCharm::new(0));
//!
//! let record = state.unit(&unit).await?;
//! assert!(record.charm_revision.is_none());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod types;

pub use error::{Result, StateError};
pub use memory::{MemoryState, StateSeed};
pub use types::{CharmInfo, RelationRecord, UnitRecord};

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::watch;
use uniter_core::{AssignedCharm, RelationId, UnitName, UnitStatus};

/// The state store operations a unit agent relies on.
///
/// All writes are conditional on the unit not being dead: a store must refuse
/// them with [`StateError::UnitDead`] rather than resurrect a dead unit.
/// Leaving a relation scope is the exception, since a dying or dead unit must
/// still be able to leave.
#[async_trait]
pub trait StateStore: Send + Sync {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch the current record for a unit.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    async fn unit(&self, unit: &UnitName) -> Result<UnitRecord>;

    /// Fetch download information for a charm revision.
    ///
    /// # Errors
    ///
    /// Returns `StateError::CharmNotFound` if the revision is unknown.
    async fn charm(&self, revision: u64) -> Result<CharmInfo>;

    // =========================================================================
    // Observables
    // =========================================================================

    /// Watch the unit record (life, service life, resolved mode, status).
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    fn watch_unit(&self, unit: &UnitName) -> Result<watch::Receiver<UnitRecord>>;

    /// Watch the charm revision assigned to the unit.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    fn watch_assigned_charm(&self, unit: &UnitName) -> Result<watch::Receiver<AssignedCharm>>;

    /// Watch the version of the unit's service configuration.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    fn watch_config(&self, unit: &UnitName) -> Result<watch::Receiver<u64>>;

    /// Watch the set of relations the unit participates in.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    fn watch_relations(&self, unit: &UnitName) -> Result<watch::Receiver<BTreeSet<RelationId>>>;

    /// Watch a relation's life and scope membership.
    ///
    /// # Errors
    ///
    /// Returns `StateError::RelationNotFound` if the relation does not exist.
    fn watch_relation(&self, relation: &RelationId) -> Result<watch::Receiver<RelationRecord>>;

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Report the unit's status.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitDead` if the unit is dead.
    async fn set_status(&self, unit: &UnitName, status: UnitStatus) -> Result<()>;

    /// Clear the operator's resolved mode once it has been acted on.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitDead` if the unit is dead.
    async fn clear_resolved(&self, unit: &UnitName) -> Result<()>;

    /// Record the charm revision now installed on the unit.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitDead` if the unit is dead.
    async fn set_current_revision(&self, unit: &UnitName, revision: u64) -> Result<()>;

    /// Put the unit into a relation's scope.
    ///
    /// # Errors
    ///
    /// Returns `StateError::CannotEnterScope` if the relation is not alive.
    async fn enter_scope(&self, relation: &RelationId, unit: &UnitName) -> Result<()>;

    /// Take the unit out of a relation's scope. Leaving twice is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    async fn leave_scope(&self, relation: &RelationId, unit: &UnitName) -> Result<()>;

    /// Record that the unit's agent is alive.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitDead` if the unit is dead.
    async fn ping(&self, unit: &UnitName) -> Result<()>;

    /// Mark the unit dead once its agent has finished with it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnitNotFound` if the unit does not exist.
    async fn ensure_dead(&self, unit: &UnitName) -> Result<()>;
}
