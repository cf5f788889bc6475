//! Error types for the decode-and-persist pipeline.

use thiserror::Error;

/// Errors that can occur while talking to the decoding endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, DNS, reset, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Endpoint answered with a non-success status.
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// A 200 response whose body is not the expected JSON document.
    #[error("Malformed response body: {0}")]
    Decode(String),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and the chunk may be resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Status { .. } | Self::Timeout { .. }
        )
    }
}

/// Errors raised by a [`RecordStore`](crate::store::RecordStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not acquire a connection after exhausting the retry budget.
    #[error("Store connection failed after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    /// Statement failed; the surrounding transaction was rolled back.
    #[error("Query failed: {0}")]
    Query(String),

    /// A table or column name that cannot be used as a SQL identifier.
    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Records passed to `upsert` do not share one column layout.
    #[error("Malformed record batch: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Returns `true` if the store could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Errors that abort a whole decode run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
