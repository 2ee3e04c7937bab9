use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by the underlying driver or its pool.
#[derive(Debug, Error)]
pub enum DriverError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool checkout failed: {0}")]
    Pool(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("operation interrupted")]
    Interrupted,

    #[error("parameter error: {0}")]
    Parameter(String),

    #[error("driver task failed: {0}")]
    Task(String),
}

/// Category attached to an [`SqlRegistryError::OperationError`] and to its log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Plain client operation (exec, ping, prepare).
    Db,
    /// Statement issued on a transaction, or begin/commit/rollback.
    Tx,
    /// Single-row query.
    Row,
    /// Multi-row cursor.
    Rows,
    /// Prepared statement execution.
    Stmt,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Db => "db-err",
            ErrorKind::Tx => "tx-err",
            ErrorKind::Row => "row-err",
            ErrorKind::Rows => "rows-err",
            ErrorKind::Stmt => "stmt-err",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SqlRegistryError {
    /// Invalid configuration. Fatal: the process should not proceed.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The factory could not open or ping a handle. A later `get` retries.
    #[error("could not connect `{name}`: {source}")]
    ConnectError {
        name: String,
        #[source]
        source: DriverError,
    },

    #[error("database `{0}` is not registered")]
    NotRegistered(String),

    /// The statement has not compiled yet; the background loop is still retrying.
    #[error("prepared statement is not ready: {0}")]
    StatementNotReady(String),

    #[error("{kind} while running `{query}`: {source}")]
    OperationError {
        kind: ErrorKind,
        query: String,
        #[source]
        source: DriverError,
    },

    /// A single-row query matched nothing.
    #[error("no rows in result set")]
    NoRows,

    #[error("scan error: {0}")]
    Scan(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transaction has already been committed or rolled back")]
    TxDone,

    #[error("`{0}` is closed")]
    Closed(String),
}

impl SqlRegistryError {
    #[must_use]
    pub fn is_no_rows(&self) -> bool {
        matches!(self, SqlRegistryError::NoRows)
    }

    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SqlRegistryError::StatementNotReady(_))
    }

    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, SqlRegistryError::DeadlineExceeded(_))
    }

    /// Configuration problems cannot be fixed by retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SqlRegistryError::ConfigError(_))
    }
}

pub(crate) fn op_error(kind: ErrorKind, query: &str, source: DriverError) -> SqlRegistryError {
    SqlRegistryError::OperationError {
        kind,
        query: query.to_owned(),
        source,
    }
}

/// Build an [`SqlRegistryError::OperationError`] and log it with its query.
pub(crate) fn op_failed(
    kind: ErrorKind,
    db: &str,
    query: &str,
    source: DriverError,
) -> SqlRegistryError {
    tracing::error!(kind = %kind, db, query, error = %source, "database operation failed");
    op_error(kind, query, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_names_kind_and_query() {
        let err = SqlRegistryError::OperationError {
            kind: ErrorKind::Stmt,
            query: "SELECT 1".into(),
            source: DriverError::Interrupted,
        };
        assert_eq!(
            err.to_string(),
            "stmt-err while running `SELECT 1`: operation interrupted"
        );
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(SqlRegistryError::ConfigError("x".into()).is_fatal());
        assert!(!SqlRegistryError::NoRows.is_fatal());
        assert!(!SqlRegistryError::NotRegistered("x".into()).is_fatal());
    }
}
