//! Common error types for the unit agent.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors shared across crates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A hook name does not match any recognized hook.
    #[error("unknown hook {0:?}")]
    UnknownHook(String),

    /// A lifecycle value would move backwards.
    #[error("cannot change life from {from} to {to}")]
    LifeRegression {
        /// The current life.
        from: crate::Life,
        /// The requested life.
        to: crate::Life,
    },

    /// A filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    /// Wrap an I/O error with a short description of the operation.
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
