//! Error types for sqlscope.
//!
//! Two layers are defined here using `thiserror`:
//! - [`DriverError`] is what the pooled-connection engine reports.
//! - [`DbError`] is what callers see. Driver errors are classified into it
//!   together with the name of the operation that produced them, keeping the
//!   original error reachable through [`std::error::Error::source`].

use crate::db::Context;
use thiserror::Error;

/// SQLSTATE reported by PostgreSQL when a statement is canceled by timeout.
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Errors reported across the engine boundary.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("transaction has already been committed or rolled back")]
    TxDone,

    #[error("operation canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection failed during {operation}: {source}")]
    Connection {
        operation: String,
        #[source]
        source: DriverError,
    },

    #[error("Database error during {operation}: {source}")]
    Operation {
        operation: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        #[source]
        source: DriverError,
    },

    #[error("Timeout: {operation} exceeded its deadline")]
    Timeout {
        operation: String,
        #[source]
        source: DriverError,
    },

    #[error("Canceled: {operation}")]
    Canceled { operation: String },

    #[error("Transaction already done: {operation}")]
    TxDone { operation: String },

    #[error("No rows returned")]
    NoRows,

    #[error("Failed to decode column {column}: {message}")]
    Decode { column: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Error produced by an application [`ErrorBuilder`].
    #[error("{operation}: {source}")]
    Application {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a decode error for the given column.
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap an application error raised while handling `operation`.
    pub fn application(
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Application {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Create a transaction-already-done error.
    pub fn tx_done(operation: impl Into<String>) -> Self {
        Self::TxDone {
            operation: operation.into(),
        }
    }

    /// Classify a driver error raised by `operation`.
    ///
    /// The rollback issued by guaranteed cleanup after a commit lands on
    /// [`DbError::TxDone`]; callers are expected to tolerate it.
    pub fn classify(operation: impl Into<String>, err: DriverError) -> Self {
        let operation = operation.into();
        match err {
            DriverError::TxDone => Self::TxDone { operation },
            DriverError::Canceled => Self::Canceled { operation },
            DriverError::DeadlineExceeded => Self::Timeout {
                operation,
                source: DriverError::DeadlineExceeded,
            },
            DriverError::Unsupported(message) => Self::InvalidInput { message },
            DriverError::Sqlx(sqlx_err) => Self::classify_sqlx(operation, sqlx_err),
        }
    }

    fn classify_sqlx(operation: String, err: sqlx::Error) -> Self {
        enum Kind {
            Database(Option<String>),
            Timeout,
            Connection,
            NoRows,
            Other,
        }

        let kind = match &err {
            sqlx::Error::Database(db_err) => Kind::Database(db_err.code().map(|c| c.to_string())),
            sqlx::Error::PoolTimedOut => Kind::Timeout,
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Kind::Connection,
            sqlx::Error::RowNotFound => Kind::NoRows,
            _ => Kind::Other,
        };

        let source = DriverError::Sqlx(err);
        match kind {
            Kind::Database(sql_state) if sql_state.as_deref() == Some(SQLSTATE_QUERY_CANCELED) => {
                Self::Timeout { operation, source }
            }
            Kind::Database(sql_state) => Self::Operation {
                operation,
                sql_state,
                source,
            },
            Kind::Timeout => Self::Timeout { operation, source },
            Kind::Connection => Self::Connection { operation, source },
            Kind::NoRows => Self::NoRows,
            Kind::Other => Self::Operation {
                operation,
                sql_state: None,
                source,
            },
        }
    }

    /// Name of the operation that failed, when known.
    pub fn operation(&self) -> Option<&str> {
        match self {
            Self::Connection { operation, .. }
            | Self::Operation { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Canceled { operation }
            | Self::TxDone { operation }
            | Self::Application { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// SQLSTATE code of a database-side failure.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Operation { sql_state, .. } => sql_state.as_deref(),
            Self::Timeout { .. } => Some(SQLSTATE_QUERY_CANCELED),
            _ => None,
        }
    }

    /// The driver error this error was classified from.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Connection { source, .. }
            | Self::Operation { source, .. }
            | Self::Timeout { source, .. } => Some(source),
            _ => None,
        }
    }

    fn database_error(&self) -> Option<&dyn sqlx::error::DatabaseError> {
        match self.driver_error() {
            Some(DriverError::Sqlx(sqlx::Error::Database(db_err))) => Some(db_err.as_ref()),
            _ => None,
        }
    }

    /// Table named by a database-side failure, when the server reports one.
    pub fn table(&self) -> Option<&str> {
        self.database_error().and_then(|e| e.table())
    }

    /// Constraint named by a database-side failure, when the server reports one.
    pub fn constraint(&self) -> Option<&str> {
        self.database_error().and_then(|e| e.constraint())
    }

    /// Check if this is the expected outcome of rolling back a finished transaction.
    pub fn is_tx_done(&self) -> bool {
        matches!(self, Self::TxDone { .. })
    }

    /// Check if this error was caused by a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Hook that turns classified driver errors into application errors.
///
/// Called by every primitive operation right after the driver error has
/// been classified, inside the middleware chain. [`DbError::TxDone`] never
/// reaches it: guaranteed cleanup relies on seeing that variant unchanged.
pub trait ErrorBuilder: Send + Sync {
    fn build(&self, ctx: &Context, err: DbError, operation: &str) -> DbError;
}

impl<F> ErrorBuilder for F
where
    F: Fn(&Context, DbError, &str) -> DbError + Send + Sync,
{
    fn build(&self, ctx: &Context, err: DbError, operation: &str) -> DbError {
        self(ctx, err, operation)
    }
}

/// Default [`ErrorBuilder`]: errors leave exactly as classified.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifiedErrors;

impl ErrorBuilder for ClassifiedErrors {
    fn build(&self, _ctx: &Context, err: DbError, _operation: &str) -> DbError {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = DbError::config("Host is required");
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_tx_done_classified_distinctly() {
        let err = DbError::classify("rollback", DriverError::TxDone);
        assert!(err.is_tx_done());
        assert!(!err.is_retryable());
        assert_eq!(err.operation(), Some("rollback"));
    }

    #[test]
    fn test_deadline_classified_as_timeout() {
        let err = DbError::classify("exec", DriverError::DeadlineExceeded);
        assert!(err.is_timeout());
        assert!(err.is_retryable());
        assert_eq!(err.sql_state(), Some(SQLSTATE_QUERY_CANCELED));
    }

    #[test]
    fn test_pool_timeout_classified_as_timeout() {
        let err = DbError::classify("begin", DriverError::Sqlx(sqlx::Error::PoolTimedOut));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_protocol_error_is_connection() {
        let err = DbError::classify(
            "query",
            DriverError::Sqlx(sqlx::Error::Protocol("unexpected message".into())),
        );
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_source_chain_preserved() {
        let err = DbError::classify("exec", DriverError::Sqlx(sqlx::Error::PoolClosed));
        let source = err.source().expect("source");
        assert!(source.to_string().contains("closed"));
        assert!(matches!(
            err.driver_error(),
            Some(DriverError::Sqlx(sqlx::Error::PoolClosed))
        ));
    }

    #[test]
    fn test_canceled_not_retryable() {
        let err = DbError::classify("exec", DriverError::Canceled);
        assert!(matches!(err, DbError::Canceled { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_no_rows() {
        let err = DbError::classify("query_row", DriverError::Sqlx(sqlx::Error::RowNotFound));
        assert!(matches!(err, DbError::NoRows));
    }

    #[test]
    fn test_unsupported_is_invalid_input() {
        let err = DbError::classify(
            "begin",
            DriverError::Unsupported("isolation level linearizable".into()),
        );
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_application_error_keeps_operation_and_source() {
        let err = DbError::application("exec", "account is frozen");
        assert_eq!(err.operation(), Some("exec"));
        assert_eq!(err.to_string(), "exec: account is frozen");
        assert!(err.source().is_some());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_closure_error_builder() {
        let builder = |_ctx: &Context, err: DbError, operation: &str| {
            DbError::application(operation, err.to_string())
        };
        let err = builder.build(
            &Context::new(),
            DbError::classify("exec", DriverError::Sqlx(sqlx::Error::PoolClosed)),
            "exec",
        );
        assert!(matches!(err, DbError::Application { .. }));

        let err = ClassifiedErrors.build(&Context::new(), DbError::NoRows, "query");
        assert!(matches!(err, DbError::NoRows));
    }
}
