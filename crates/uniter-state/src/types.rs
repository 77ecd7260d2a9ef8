//! Records exchanged with the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uniter_core::{Life, RelationId, ResolvedMode, UnitName, UnitStatus};

/// A unit as seen by its agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// The unit's name.
    pub name: UnitName,
    /// The unit's own life.
    pub life: Life,
    /// The life of the unit's service.
    pub service_life: Life,
    /// Resolution requested by the operator.
    pub resolved: ResolvedMode,
    /// Status last reported by the agent.
    pub status: UnitStatus,
    /// When the status was last changed.
    pub status_since: Option<DateTime<Utc>>,
    /// Charm revision the agent last reported as installed.
    pub charm_revision: Option<u64>,
}

impl UnitRecord {
    /// A fresh, alive unit with no status.
    #[must_use]
    pub fn new(name: UnitName) -> Self {
        Self {
            name,
            life: Life::Alive,
            service_life: Life::Alive,
            resolved: ResolvedMode::None,
            status: UnitStatus::Pending,
            status_since: None,
            charm_revision: None,
        }
    }
}

/// A relation and the units currently in its scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    /// The relation's identity.
    pub id: RelationId,
    /// The relation's life.
    pub life: Life,
    /// Units in scope, with the version of their relation settings.
    pub members: BTreeMap<UnitName, u64>,
}

impl RelationRecord {
    /// A new, alive relation with nobody in scope.
    #[must_use]
    pub const fn new(id: RelationId) -> Self {
        Self {
            id,
            life: Life::Alive,
            members: BTreeMap::new(),
        }
    }
}

/// Where to download a charm revision and how to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmInfo {
    /// The charm revision.
    pub revision: u64,
    /// URL of the charm bundle.
    pub url: String,
    /// Hex-encoded SHA-256 of the bundle.
    pub sha256: String,
}
