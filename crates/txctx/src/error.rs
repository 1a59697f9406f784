//! Error types for sessions, contexts and drivers
//!
//! Driver failures travel through this crate untouched: a session never wraps,
//! retries or reclassifies the error a connection returned, so callers can
//! inspect it (for instance with [`Error::is_serialization_failure`]) and
//! decide for themselves.

/// Result type alias for session and driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by contexts and database drivers
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The context was canceled through its [`CancelHandle`](crate::CancelHandle)
    #[error("context canceled")]
    Canceled,

    /// The context deadline passed before the operation finished
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A single-row query produced no rows
    #[error("no rows in result set")]
    NoRows,

    /// The transaction has already been committed or rolled back
    #[error("transaction has already been committed or rolled back")]
    TxDone,

    /// Connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Error reported by the database server
    #[error("Database error: {message}")]
    Database {
        /// SQLSTATE code, when the server reported one
        code: Option<String>,
        message: String,
    },

    /// Statement could not be prepared, bound or executed
    #[error("Query error: {0}")]
    Query(String),

    /// Requested column is not part of the row
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Build a database error without an SQLSTATE code
    pub fn database(message: impl Into<String>) -> Self {
        Error::Database {
            code: None,
            message: message.into(),
        }
    }

    /// Build a database error carrying an SQLSTATE code
    pub fn database_with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Database {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// True for errors raised by a canceled or expired context
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    /// SQLSTATE code of a database error
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is a serialization failure or deadlock that a
    /// business layer may choose to retry
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Error::Database { code, message } => {
                matches!(code.as_deref(), Some("40001") | Some("40P01"))
                    || message.contains("could not serialize access")
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
