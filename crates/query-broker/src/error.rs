//! Error types for the broker

use thiserror::Error;

/// Errors that can fail a broker query
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No server currently serves a segment
    #[error("No server available for segment: {0}")]
    SegmentUnavailable(String),

    /// Server not registered with the view
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Server already registered with the view
    #[error("Server already registered: {0}")]
    ServerAlreadyRegistered(String),

    /// Sub-query failed on a data server
    #[error("Server {server} failed: {message}")]
    ServerFailure { server: String, message: String },

    /// Sub-query did not finish before the query deadline
    #[error("Query to server {server} timed out after {timeout_ms}ms")]
    Timeout { server: String, timeout_ms: u64 },

    /// Server finished without returning some requested segments
    #[error("Server {server} did not return {count} segments")]
    MissingSegments { server: String, count: usize },

    /// Server returned data that cannot be merged correctly
    #[error("Malformed result from {server}: {message}")]
    MalformedResult { server: String, message: String },

    /// Merge fault
    #[error("Merge error: {0}")]
    Merge(String),

    /// No merge pool slots came free before the query deadline
    #[error("Timed out after {timeout_ms}ms waiting for the merge pool")]
    MergeTimeout { timeout_ms: u64 },

    /// Query exceeded a per-query resource budget
    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// Invalid broker configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query engine error
    #[error("Query engine error: {0}")]
    Query(#[from] query_core::QueryError),
}

impl BrokerError {
    /// Whether the error comes from talking to one data server
    ///
    /// Only these may be absorbed when partial results are allowed.
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ServerFailure { .. }
                | BrokerError::Timeout { .. }
                | BrokerError::MissingSegments { .. }
        )
    }
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
