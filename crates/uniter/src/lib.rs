//! Unit agent: keeps one unit's charm deployed and runs its hooks.
//!
//! The agent watches the unit in the state store, deploys and upgrades the
//! charm in its data directory, and runs the charm's hooks in response to
//! lifecycle, configuration and relation changes. Every hook and upgrade is
//! recorded in an operation log first, so an agent killed at any point
//! resumes where it left off.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  changes   ┌──────────────────────────────────────┐
//! │    Filter    │──────────►│               Uniter                  │
//! │ (watchers)   │           │  Continue → Installing → Started → …  │
//! └──────────────┘           └──────────────────────────────────────┘
//!        ▲                       │            │             │
//!        │                 next/complete   run hook    deploy/upgrade
//!        │                       ▼            ▼             ▼
//! ┌──────────────┐        ┌───────────┐ ┌───────────┐ ┌───────────┐
//! │  StateStore  │◄───────│ Relation  │ │   Hook    │ │  CharmDir │
//! │              │ scopes │  Engine   │ │  Runner   │ │           │
//! └──────────────┘        └───────────┘ └───────────┘ └───────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use uniter::{Agent, AgentConfig};
//! use uniter_charm::HttpFetcher;
//! use uniter_state::{MemoryState, StateSeed};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let seed = StateSeed::from_json_file("state.json".as_ref())?;
//! let store = Arc::new(MemoryState::from_seed(&seed));
//! let config = AgentConfig::new("/var/lib/unit-agent", "wordpress/0".parse()?);
//!
//! let agent = Agent::start(config, store, Arc::new(HttpFetcher::new()?)).await?;
//! let exit = agent.wait().await?;
//! println!("agent exited: {exit:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Modes
//!
//! See the [`lifecycle`] module for the mode diagram and transition rules.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod config;
pub mod error;
pub mod filter;
pub mod hook;
pub mod lifecycle;
pub mod machine;
pub mod oplog;
pub mod relation;

mod persist;

pub use agent::{Agent, StopHandle};
pub use config::AgentConfig;
pub use error::{Result, UniterError};
pub use filter::{Changes, Filter, Snapshot};
pub use hook::{HookOutcome, HookRunner, ProcessRunner};
pub use lifecycle::ModeKind;
pub use machine::{Exit, Uniter};
pub use oplog::{HookStep, OpLog, OpState, Operation};
pub use relation::RelationEngine;

#[cfg(any(test, feature = "test-utils"))]
pub use hook::mock::RecordingRunner;

// Re-export commonly used types from dependencies for convenience
pub use uniter_core::{HookInfo, HookKind, UnitName};
