//! Error types for cloudrate storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Invalid or incomplete backend configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The log-stream backend only speaks JSON.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// No backend registered under this name.
    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with an unexpected status code.
    #[error("expected {expected} status code, got {actual}: {body}. Query was {query}")]
    InvalidStatusCode {
        /// Expected status code.
        expected: u16,
        /// Status code received.
        actual: u16,
        /// Response body.
        body: String,
        /// Request body or query string.
        query: String,
    },

    /// The backend answered with a body of unexpected shape.
    #[error("unexpected response from {backend}: {message}")]
    UnexpectedResponse {
        /// Backend name.
        backend: &'static str,
        /// What was wrong.
        message: String,
    },

    /// A metrics-engine resource type could not be resolved or provisioned.
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    /// A bulk index request was accepted but some documents were rejected.
    #[error("bulk request rejected {failed} of {total} documents: {reason}")]
    BulkRejected {
        /// Rejected documents.
        failed: usize,
        /// Documents sent.
        total: usize,
        /// First rejection reason.
        reason: String,
    },

    /// A full page of log lines shares one timestamp, so paging cannot advance.
    #[error("{limit} or more lines share timestamp {timestamp}, raise the query limit")]
    QueryLimitExceeded {
        /// Lines per query.
        limit: usize,
        /// Timestamp in nanoseconds.
        timestamp: i64,
    },

    /// The backend cannot honour the operation as requested.
    #[error("{backend} does not support {operation}")]
    Unsupported {
        /// Backend name.
        backend: &'static str,
        /// What was asked.
        operation: String,
    },

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data could not be turned back into the data model.
    #[error("model error: {0}")]
    Model(#[from] cloudrate_core::ModelError),
}

impl StoreError {
    pub(crate) fn unexpected(backend: &'static str, message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            backend,
            message: message.into(),
        }
    }
}
