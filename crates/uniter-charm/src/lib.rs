//! Charm directory manager and bundle fetcher for the unit agent.
//!
//! A charm is delivered as a gzip-compressed tar bundle. This crate keeps the
//! unit's copy of it on disk:
//!
//! - [`CharmDir::deploy`] installs a first revision into an empty directory
//! - [`CharmDir::upgrade`] three-way merges a new revision into a working
//!   tree the hooks may have modified
//! - [`CharmDir::is_conflicted`] and [`CharmDir::resolved`] form the
//!   handshake for merges that need an operator
//!
//! Revisions are staged in a content-addressed object store under
//! [`VERSION_CONTROL_DIR`], which hooks must leave alone.
//!
//! # Example
//!
//! ```no_run
//! use uniter_charm::{verify_sha256, BundleFetcher, CharmDir, HttpFetcher};
//!
//! # async fn example() -> uniter_charm::Result<()> {
//! let fetcher = HttpFetcher::new()?;
//! let bundle = fetcher.fetch("https://charms.example.com/wordpress-3.tar.gz").await?;
//! verify_sha256(&bundle, "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")?;
//!
//! let charm = CharmDir::new("/var/lib/unit-agent/charm");
//! if charm.current_revision()?.is_none() {
//!     charm.deploy(&bundle, 3)?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bundle;
pub mod dir;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod merge;
pub mod objects;

pub use bundle::{read_bundle, sha256_hex, verify_sha256, BundleFile};
pub use dir::{CharmDir, UpgradeOutcome};
pub use error::{CharmError, Result};
pub use fetch::{BundleFetcher, HttpFetcher};
pub use manifest::Manifest;
pub use merge::MergeResult;

#[cfg(any(test, feature = "test-utils"))]
pub use bundle::BundleBuilder;
#[cfg(any(test, feature = "test-utils"))]
pub use fetch::mock::MemoryFetcher;

/// Name of the metadata directory inside the charm working tree.
pub const VERSION_CONTROL_DIR: &str = ".version-control";
