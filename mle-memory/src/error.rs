//! Error type for the memory tiers.

use thiserror::Error;

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors raised by the fast tier, slow tier, and coordinator.
///
/// Upstream failures (SQLite, HTTP, JSON) are wrapped without translation.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Caller passed inconsistent arguments
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Metadata values cannot be ordered against each other
    #[error("Cannot compare metadata '{key}': {reason}")]
    IncomparableMetadata { key: String, reason: String },

    /// Operation exists in the interface but has no implementation
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Misconfigured component
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding provider failure
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Completion model failure
    #[error("Model error: {0}")]
    Model(String),

    /// Table lookup by a backend that requires the table to exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table creation over an existing name
    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Common(#[from] mle_common::Error),
}

impl MemoryError {
    /// Check if this error marks an unimplemented operation.
    pub const fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_implemented_is_detectable() {
        let err = MemoryError::NotImplemented("prompt_based_consolidate");
        assert!(err.is_not_implemented());
        assert_eq!(err.to_string(), "Not implemented: prompt_based_consolidate");
        assert!(!MemoryError::InvalidInput("x".into()).is_not_implemented());
    }

    #[test]
    fn common_errors_pass_through() {
        let err: MemoryError = mle_common::Error::Config("no platform".into()).into();
        assert_eq!(err.to_string(), "Configuration error: no platform");
    }
}
