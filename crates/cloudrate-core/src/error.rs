//! Error types for the cloudrate data model.

use chrono::{DateTime, Utc};

/// Result type for data model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building or decoding rated usage values.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A frame period whose start is not strictly before its end.
    #[error("invalid period: start {start} must be before end {end}")]
    InvalidPeriod {
        /// Period start.
        start: DateTime<Utc>,
        /// Period end.
        end: DateTime<Utc>,
    },

    /// A serialized point or frame is missing a field or has the wrong type.
    #[error("invalid {shape} document: {message}")]
    InvalidDocument {
        /// What was being decoded (`datapoint`, `dataframe`).
        shape: &'static str,
        /// Decoder message.
        message: String,
    },
}

impl ModelError {
    pub(crate) fn document(shape: &'static str, err: impl std::fmt::Display) -> Self {
        Self::InvalidDocument {
            shape,
            message: err.to_string(),
        }
    }
}
