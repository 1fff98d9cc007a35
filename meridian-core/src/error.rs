//! Error types for MERIDIAN operations

use std::time::Duration;
use thiserror::Error;

/// Shared store errors.
///
/// These are the "transient" failures of the underlying key-value store.
/// Mutating operations surface them; read operations degrade to a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store connection failed: {reason}")]
    Connection { reason: String },

    #[error("Store unavailable")]
    Unavailable,

    #[error("Store command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Store operation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Unexpected store reply for {command}: {reason}")]
    Protocol { command: String, reason: String },
}

/// Cache engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Refusing to clear cache without explicit confirmation")]
    ClearNotConfirmed,

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Invalid cache option {field}: {reason}")]
    InvalidOptions { field: String, reason: String },

    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all MERIDIAN errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeridianError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl MeridianError {
    /// True for failures of the shared store itself.
    pub fn is_store_error(&self) -> bool {
        matches!(self, MeridianError::Store(_))
    }
}

/// Result type alias for MERIDIAN operations.
pub type MeridianResult<T> = Result<T, MeridianError>;

// =============================================================================
// TESTS
// =============================================================================
