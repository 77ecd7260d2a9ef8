//! Identifier types for the unit agent.
//!
//! Services, units and relations are addressed by short human-readable names
//! (`wordpress`, `wordpress/0`, `db:3`). Each name is validated on
//! construction so the rest of the agent can treat it as well-formed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// A service name is malformed.
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    /// A unit name is not of the form `service/ordinal`.
    #[error("invalid unit name {0:?}")]
    InvalidUnitName(String),

    /// A relation id is not of the form `name:number`.
    #[error("invalid relation id {0:?}")]
    InvalidRelationId(String),
}

/// The name of a service, e.g. `wordpress`.
///
/// Service names start with a lowercase letter, contain only lowercase
/// letters, digits and hyphens, and do not end with a hyphen.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Parse a service name.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidServiceName` if the name is malformed.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if is_valid_service_name(&name) {
            Ok(Self(name))
        } else {
            Err(IdError::InvalidServiceName(name))
        }
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && !name.ends_with('-')
        && !name.contains("--")
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceName({})", self.0)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

/// The name of a unit: a `(service, ordinal)` pair written `service/ordinal`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName {
    service: ServiceName,
    ordinal: u32,
}

impl UnitName {
    /// Create a unit name from its parts.
    #[must_use]
    pub const fn new(service: ServiceName, ordinal: u32) -> Self {
        Self { service, ordinal }
    }

    /// The service this unit belongs to.
    #[must_use]
    pub const fn service(&self) -> &ServiceName {
        &self.service
    }

    /// The unit's ordinal within its service.
    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// The filesystem-safe tag for this unit, e.g. `unit-wordpress-0`.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("unit-{}-{}", self.service, self.ordinal)
    }
}

impl fmt::Debug for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitName({self})")
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.ordinal)
    }
}

impl FromStr for UnitName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdError::InvalidUnitName(s.to_string());
        let (service, ordinal) = s.split_once('/').ok_or_else(invalid)?;
        if ordinal.is_empty() || (ordinal.len() > 1 && ordinal.starts_with('0')) {
            return Err(invalid());
        }
        let ordinal = ordinal.parse().map_err(|_| invalid())?;
        let service = ServiceName::new(service).map_err(|_| invalid())?;
        Ok(Self { service, ordinal })
    }
}

impl TryFrom<String> for UnitName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitName> for String {
    fn from(name: UnitName) -> Self {
        name.to_string()
    }
}

/// The identity of a relation, written `name:number` (e.g. `db:3`).
///
/// The name is the relation name the unit's charm uses for the endpoint; it
/// prefixes the relation hook names. The number is unique within the model.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelationId {
    name: String,
    number: u32,
}

impl RelationId {
    /// Create a relation id from its parts.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidRelationId` if the name is not a valid
    /// relation name.
    pub fn new(name: impl Into<String>, number: u32) -> Result<Self, IdError> {
        let name = name.into();
        if is_valid_service_name(&name) {
            Ok(Self { name, number })
        } else {
            Err(IdError::InvalidRelationId(format!("{name}:{number}")))
        }
    }

    /// The relation name, used as the hook name prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The relation number.
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Debug for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelationId({self})")
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.number)
    }
}

impl FromStr for RelationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdError::InvalidRelationId(s.to_string());
        let (name, number) = s.split_once(':').ok_or_else(invalid)?;
        let number = number.parse().map_err(|_| invalid())?;
        Self::new(name, number).map_err(|_| invalid())
    }
}

impl TryFrom<String> for RelationId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelationId> for String {
    fn from(id: RelationId) -> Self {
        id.to_string()
    }
}
