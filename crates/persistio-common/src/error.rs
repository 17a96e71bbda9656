//! Error types for persistio
//!
//! Absent records are never errors: lookups return `Ok(None)` and deletes
//! return `Ok(false)`. Everything below is a real failure.

use thiserror::Error;

/// Common result type for persistio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for persistio
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Data access errors
    #[error("backend error: {0}")]
    Backend(String),

    #[error("version conflict on {id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("could not generate a unique id after {attempts} attempts")]
    IdDuplicate { attempts: u32 },

    // Programmer errors
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Transient resource errors
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("request timeout")]
    Timeout,

    // Lifecycle / capability errors
    #[error("component is closed")]
    Closed,

    #[error("not supported: {0}")]
    NotSupported(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a backend (data access) error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(feature: impl Into<String>) -> Self {
        Self::NotSupported(feature.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if retrying the same operation later may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::ResourceExhausted(_) | Self::Timeout
        )
    }

    /// Check if this is a programmer error that must never be retried
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Invariant(_) | Self::InvalidArgument(_) | Self::Configuration(_)
        )
    }

    /// Check if this is a lost optimistic write
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<crate::types::IdentityError> for Error {
    fn from(err: crate::types::IdentityError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
