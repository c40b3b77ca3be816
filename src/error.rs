//! Error types for Granary.

use thiserror::Error;

/// Common error type for Granary.
#[derive(Error, Debug)]
pub enum GranaryError {
    /// Database error.
    ///
    /// Wraps errors from the storage backend. Errors from sqlx are
    /// automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Feed fetch or parse error (network failure, bad status, oversized
    /// document, rejected URL, unparseable payload).
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Validation error for caller-supplied input.
    #[error("validation error: {0}")]
    Validation(String),
}

// Conversion from sqlx errors
impl From<sqlx::Error> for GranaryError {
    fn from(e: sqlx::Error) -> Self {
        GranaryError::Database(e.to_string())
    }
}

/// Result type alias for Granary operations.
pub type Result<T> = std::result::Result<T, GranaryError>;
