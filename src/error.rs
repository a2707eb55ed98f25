//! Error types for the data-access layer.
//!
//! Every operation returns a [`DbResult`]. Errors are surfaced to the caller
//! only after cleanup (rollback, lease release) has completed; this layer never
//! swallows an error and never decides how it is presented to end users.

use crate::models::DatabaseType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Missing or invalid connection parameters. Fatal at startup.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Pool exhausted: no {backend} connection available within {waited_ms}ms")]
    PoolExhausted { backend: DatabaseType, waited_ms: u64 },

    #[error("Statement failed: {message}")]
    Statement {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        constraint_violation: bool,
    },

    /// An error that broke an open transaction. The transaction was rolled back.
    #[error("Transaction rolled back: {source}")]
    TransactionFailure {
        #[source]
        source: Box<DbError>,
    },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Transaction aborted: {reason}")]
    Aborted { reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(backend: DatabaseType, waited_ms: u64) -> Self {
        Self::PoolExhausted { backend, waited_ms }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            constraint_violation: false,
        }
    }

    /// Create a connection lost error with a helpful suggestion.
    pub fn connection_lost(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Abort the surrounding transaction from inside a unit of work.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Mark an error raised inside an open transaction.
    ///
    /// Statement errors become [`DbError::TransactionFailure`]; connection-level
    /// errors and errors that are already wrapped pass through unchanged.
    pub fn in_transaction(self) -> Self {
        match self {
            Self::Statement { .. } | Self::Timeout { .. } | Self::Decode { .. } => {
                Self::TransactionFailure {
                    source: Box::new(self),
                }
            }
            other => other,
        }
    }

    /// The innermost error, looking through transaction wrappers.
    pub fn root(&self) -> &DbError {
        match self {
            Self::TransactionFailure { source } => source.root(),
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionLost { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Increase max_connections or acquire_timeout, or shorten transactions")
            }
            Self::TransactionFailure { source } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::ConnectionLost { .. } | Self::Timeout { .. } => {
                true
            }
            Self::TransactionFailure { source } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is a constraint violation (unique, foreign key, not null, check).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self.root(),
            Self::Statement {
                constraint_violation: true,
                ..
            }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let constraint_violation = !matches!(db_err.kind(), sqlx::error::ErrorKind::Other);
                DbError::Statement {
                    message: db_err.message().to_string(),
                    sql_state: db_err.code().map(|c| c.to_string()),
                    constraint_violation,
                }
            }
            sqlx::Error::RowNotFound => DbError::statement("No rows returned", None),
            // Callers that know the backend and wait time build a richer error.
            sqlx::Error::PoolTimedOut => DbError::internal("Connection pool acquire timed out"),
            sqlx::Error::PoolClosed => {
                DbError::connection_lost("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection_lost(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection_lost(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection_lost(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::WorkerCrashed => {
                DbError::connection_lost("Database worker crashed", "Reconnect to the database")
            }
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::decode(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::decode(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::decode(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::decode(format!("Decode error: {}", source)),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::decode(err.to_string())
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection_lost("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection lost"));

        let err = DbError::pool_exhausted(DatabaseType::PostgreSQL, 10_000);
        assert!(err.to_string().contains("PostgreSQL"));
        assert!(err.to_string().contains("10000ms"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection_lost("err", "sugg").is_retryable());
        assert!(DbError::pool_exhausted(DatabaseType::MySQL, 1).is_retryable());
        assert!(!DbError::statement("syntax error", None).is_retryable());
        assert!(!DbError::configuration("missing host").is_retryable());
    }

    #[test]
    fn test_in_transaction_wraps_statement_errors() {
        let err = DbError::statement("FOREIGN KEY constraint failed", Some("787".into()))
            .in_transaction();
        assert!(matches!(err, DbError::TransactionFailure { .. }));
        assert!(matches!(err.root(), DbError::Statement { .. }));

        // Already wrapped errors are not wrapped twice
        let twice = err.in_transaction();
        match &twice {
            DbError::TransactionFailure { source } => {
                assert!(matches!(**source, DbError::Statement { .. }))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_in_transaction_keeps_connection_errors() {
        let err = DbError::connection_lost("reset by peer", "retry").in_transaction();
        assert!(matches!(err, DbError::ConnectionLost { .. }));
        let err = DbError::aborted("user cancelled").in_transaction();
        assert!(matches!(err, DbError::Aborted { .. }));
    }

    #[test]
    fn test_transaction_failure_retryable_follows_source() {
        let err = DbError::timeout("execute", 30_000).in_transaction();
        assert!(err.is_retryable());
        let err = DbError::statement("bad", None).in_transaction();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_constraint_violation_through_wrapper() {
        let err = DbError::Statement {
            message: "UNIQUE constraint failed".into(),
            sql_state: Some("2067".into()),
            constraint_violation: true,
        }
        .in_transaction();
        assert!(err.is_constraint_violation());
        assert!(!DbError::statement("syntax", None).is_constraint_violation());
    }

    #[test]
    fn test_pool_closed_maps_to_connection_lost() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::ConnectionLost { .. }));
        assert_eq!(err.suggestion(), Some("Reconnect to the database"));
    }

    #[test]
    fn test_serde_error_maps_to_decode() {
        let err: DbError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, DbError::Decode { .. }));
    }
}
