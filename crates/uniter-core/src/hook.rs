//! Hook kinds and the information needed to run one.
//!
//! Hook names are fixed: the unit lifecycle hooks (`install`, `start`,
//! `config-changed`, `upgrade-charm`, `stop`) and, for each relation, the four
//! relation hooks `<relation-name>-relation-{joined,changed,departed,broken}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{RelationId, UnitName};

/// The kind of hook to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    /// First hook run after the charm is deployed.
    Install,
    /// Runs once after `install`.
    Start,
    /// Runs whenever the service configuration may have changed.
    ConfigChanged,
    /// Runs after the charm has been upgraded.
    UpgradeCharm,
    /// Runs once before the unit goes away.
    Stop,
    /// A peer entered the relation scope.
    RelationJoined,
    /// A peer's relation settings changed.
    RelationChanged,
    /// A peer left the relation scope.
    RelationDeparted,
    /// The relation is gone.
    RelationBroken,
}

impl HookKind {
    /// Returns true for the four relation hook kinds.
    #[must_use]
    pub const fn is_relation(self) -> bool {
        matches!(
            self,
            Self::RelationJoined
                | Self::RelationChanged
                | Self::RelationDeparted
                | Self::RelationBroken
        )
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Start => "start",
            Self::ConfigChanged => "config-changed",
            Self::UpgradeCharm => "upgrade-charm",
            Self::Stop => "stop",
            Self::RelationJoined => "relation-joined",
            Self::RelationChanged => "relation-changed",
            Self::RelationDeparted => "relation-departed",
            Self::RelationBroken => "relation-broken",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Everything needed to name, run and later commit a hook.
///
/// Relation hooks carry the relation and, except for `broken`, the remote
/// unit. A `changed` hook also carries the settings version it informs the
/// charm of, so the relation state can be committed after it succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HookInfo {
    /// The hook kind.
    pub kind: HookKind,
    /// The relation, for relation hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationId>,
    /// The remote unit, for joined, changed and departed hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_unit: Option<UnitName>,
    /// The remote unit's settings version, for changed hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_version: Option<u64>,
}

impl HookInfo {
    /// A unit lifecycle hook.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `kind` is a relation hook kind.
    #[must_use]
    pub fn unit(kind: HookKind) -> Self {
        debug_assert!(!kind.is_relation(), "{kind} needs a relation");
        Self {
            kind,
            relation: None,
            remote_unit: None,
            change_version: None,
        }
    }

    /// A `<relation>-relation-joined` hook.
    #[must_use]
    pub const fn relation_joined(relation: RelationId, remote: UnitName) -> Self {
        Self {
            kind: HookKind::RelationJoined,
            relation: Some(relation),
            remote_unit: Some(remote),
            change_version: None,
        }
    }

    /// A `<relation>-relation-changed` hook for the given settings version.
    #[must_use]
    pub const fn relation_changed(relation: RelationId, remote: UnitName, version: u64) -> Self {
        Self {
            kind: HookKind::RelationChanged,
            relation: Some(relation),
            remote_unit: Some(remote),
            change_version: Some(version),
        }
    }

    /// A `<relation>-relation-departed` hook.
    #[must_use]
    pub const fn relation_departed(relation: RelationId, remote: UnitName) -> Self {
        Self {
            kind: HookKind::RelationDeparted,
            relation: Some(relation),
            remote_unit: Some(remote),
            change_version: None,
        }
    }

    /// A `<relation>-relation-broken` hook.
    #[must_use]
    pub const fn relation_broken(relation: RelationId) -> Self {
        Self {
            kind: HookKind::RelationBroken,
            relation: Some(relation),
            remote_unit: None,
            change_version: None,
        }
    }

    /// The hook's file name under `hooks/`.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.relation {
            Some(relation) if self.kind.is_relation() => {
                format!("{}-{}", relation.name(), self.kind)
            }
            _ => self.kind.to_string(),
        }
    }
}

impl fmt::Display for HookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())?;
        if let Some(remote) = &self.remote_unit {
            write!(f, " {remote}")?;
        }
        if let Some(relation) = &self.relation {
            write!(f, " {relation}")?;
        }
        Ok(())
    }
}
