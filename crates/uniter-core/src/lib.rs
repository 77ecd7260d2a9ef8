//! Core types and utilities for the unit agent.
//!
//! This crate provides the foundational types shared by every other crate in
//! the workspace:
//!
//! - **Identifiers**: service, unit and relation names
//! - **Lifecycle values**: `Life`, `ResolvedMode`, `UnitStatus`, `AssignedCharm`
//! - **Hooks**: the fixed set of hook kinds and the information needed to run one
//! - **Filesystem helpers**: atomic file replacement
//!
//! # Example
//!
//! ```
//! use uniter_core::{HookInfo, RelationId, UnitName};
//!
//! let unit: UnitName = "wordpress/0".parse().unwrap();
//! assert_eq!(unit.service().as_str(), "wordpress");
//! assert_eq!(unit.tag(), "unit-wordpress-0");
//!
//! let relation: RelationId = "db:3".parse().unwrap();
//! let peer: UnitName = "mysql/1".parse().unwrap();
//! let hook = HookInfo::relation_joined(relation, peer);
//! assert_eq!(hook.name(), "db-relation-joined");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod fs;
pub mod hook;
pub mod ids;
pub mod types;

pub use error::{CoreError, Result};
pub use hook::{HookInfo, HookKind};
pub use ids::{IdError, RelationId, ServiceName, UnitName};
pub use types::{AssignedCharm, Life, ResolvedMode, UnitStatus};
