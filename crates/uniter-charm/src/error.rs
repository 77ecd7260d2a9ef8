//! Error types for the charm directory manager and bundle fetcher.

use std::path::PathBuf;

use thiserror::Error;

/// A result type using `CharmError`.
pub type Result<T> = std::result::Result<T, CharmError>;

/// Errors that can occur while fetching, deploying or upgrading a charm.
#[derive(Debug, Error)]
pub enum CharmError {
    /// The charm directory path exists but is not a directory.
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),

    /// A charm is already deployed; only upgrades are possible.
    #[error("charm already deployed at revision {0}")]
    AlreadyDeployed(u64),

    /// No charm has been deployed yet.
    #[error("charm not deployed")]
    NotDeployed,

    /// `resolved` was called but there is no conflicted upgrade.
    #[error("no conflicted upgrade to resolve")]
    NotConflicted,

    /// The bundle could not be read.
    #[error("invalid charm bundle: {0}")]
    InvalidBundle(String),

    /// The bundle's digest does not match the expected one.
    #[error("charm bundle hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// The digest published with the revision.
        expected: String,
        /// The digest of the downloaded bytes.
        actual: String,
    },

    /// The repository answered with an unsuccessful status.
    #[error("failed to download charm {url:?}: {status}")]
    Download {
        /// The bundle URL.
        url: String,
        /// The HTTP status returned.
        status: reqwest::StatusCode,
    },

    /// The repository could not be reached.
    #[error("failed to download charm {url:?}: {message}")]
    Connection {
        /// The bundle URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// Version-control metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] uniter_core::CoreError),
}

impl CharmError {
    /// Returns true if retrying the download might succeed.
    ///
    /// Server errors and connection failures are transient; client errors
    /// (including 404) and integrity failures are not.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Download { status, .. } => status.is_server_error(),
            Self::Connection { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io(uniter_core::CoreError::io(context, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_errors() {
        let url = "http://charms/x".to_string();
        let not_found = CharmError::Download {
            url: url.clone(),
            status: reqwest::StatusCode::NOT_FOUND,
        };
        assert!(!not_found.is_retriable());
        assert_eq!(
            not_found.to_string(),
            "failed to download charm \"http://charms/x\": 404 Not Found"
        );

        let unavailable = CharmError::Download {
            url: url.clone(),
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        };
        assert!(unavailable.is_retriable());

        let refused = CharmError::Connection {
            url,
            message: "connection refused".into(),
        };
        assert!(refused.is_retriable());
        assert!(!CharmError::NotDeployed.is_retriable());
    }

    #[test]
    fn not_a_directory_message() {
        let err = CharmError::NotADirectory(PathBuf::from("/var/lib/agent/charm"));
        assert_eq!(err.to_string(), "\"/var/lib/agent/charm\" is not a directory");
    }
}
