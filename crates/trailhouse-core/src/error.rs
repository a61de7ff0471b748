//! Error types and result aliases for trailhouse.
//!
//! Errors are structured for programmatic handling: the retry driver in the
//! purge engine classifies attempts by inspecting the variant, never by
//! matching on message text.

use std::fmt;

/// The result type used throughout trailhouse.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in trailhouse operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid invocation configuration (missing paths, bad prefix shape).
    ///
    /// Always fatal and never retried: these are configuration errors, not
    /// transient failures.
    #[error("configuration error: {message}")]
    Config {
        /// Description of what made the configuration invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The storage service signalled rate limiting (SlowDown / 503 class).
    ///
    /// The only retryable class: callers back off exponentially and retry
    /// up to a fixed attempt ceiling.
    #[error("throttled: {message}")]
    Throttled {
        /// Description of the throttling signal.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A table create or append commit failed.
    ///
    /// Fatal for the invocation: no partial-success state is left ambiguous
    /// because row data only becomes visible when the metadata commit
    /// succeeds.
    #[error("table commit failed: {message}")]
    TableCommit {
        /// Description of the commit failure.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new throttling error.
    #[must_use]
    pub fn throttled(message: impl fmt::Display) -> Self {
        Self::Throttled {
            message: message.to_string(),
        }
    }

    /// Creates a new table commit error.
    #[must_use]
    pub fn table_commit(message: impl Into<String>) -> Self {
        Self::TableCommit {
            message: message.into(),
        }
    }

    /// Returns whether this error is transient and worth retrying.
    ///
    /// Only throttling-class errors are retryable; everything else fails
    /// the attempt immediately.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}
