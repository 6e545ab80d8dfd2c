//! Error types for the cache
//!
//! Provides unified error handling using thiserror.
//!
//! The store itself never returns these: reads and writes signal their outcome
//! through plain values, and alias scheme violations panic. Errors only surface
//! from construction and from the fetch orchestration layer.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache.
///
/// `Clone` so that a single fetch outcome can be handed to every caller that
/// was waiting on the same in-flight key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Continuous evictions were requested outside of a Tokio runtime
    #[error("Continuous evictions require a running Tokio runtime")]
    RuntimeUnavailable,

    /// The record does not exist at the source of truth
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The key is cached as a known-missing record
    #[error("Record cached as missing: {0}")]
    MissingRecord(String),

    /// The fetch function failed for any other reason
    #[error("Fetch failed: {0}")]
    Fetch(String),
}

impl CacheError {
    /// Wraps an arbitrary fetch failure.
    pub fn fetch(err: impl std::fmt::Display) -> Self {
        CacheError::Fetch(err.to_string())
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Fetch(format!("{err:#}"))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CacheError::MissingRecord("user-1".into()).to_string(),
            "Record cached as missing: user-1"
        );
        assert_eq!(
            CacheError::InvalidConfig("ttl must be greater than 0".into()).to_string(),
            "Invalid configuration: ttl must be greater than 0"
        );
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("connection reset").context("loading user");
        let converted: CacheError = err.into();
        assert_eq!(
            converted,
            CacheError::Fetch("loading user: connection reset".into())
        );
    }
}
