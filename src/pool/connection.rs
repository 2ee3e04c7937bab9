use std::sync::Arc;

use bb8::PooledConnection;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "postgres")]
use crate::postgres::{self, PgManager};
#[cfg(feature = "sqlite")]
use crate::sqlite::{self, SqliteManager};

use super::RowStream;
use crate::error::DriverError;
use crate::results::ExecResult;
use crate::statement::CompiledStatement;
use crate::types::RowValues;

/// Where a transaction stands after one of its statements failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    /// Still usable; only the failed statement was undone.
    Open,
    /// The database already ended the transaction; there is nothing to roll back.
    Ended,
    /// The transaction can no longer commit, or its state is unknown; it must be rolled back.
    Aborted,
}

/// A checked-out connection, shared with any driver task still streaming from it.
///
/// The connection returns to its pool when the last clone is dropped.
#[derive(Clone)]
pub(crate) enum DbConn {
    #[cfg(feature = "sqlite")]
    Sqlite(Arc<PooledConnection<'static, SqliteManager>>),
    #[cfg(feature = "postgres")]
    Postgres(Arc<PooledConnection<'static, PgManager>>),
}

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => f.debug_tuple("Sqlite").field(&"<connection>").finish(),
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => f.debug_tuple("Postgres").field(&"<client>").finish(),
        }
    }
}

impl DbConn {
    pub(crate) async fn execute(
        &self,
        sql: &str,
        params: &[RowValues],
        token: &CancellationToken,
    ) -> Result<ExecResult, DriverError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::execute(conn, sql, params, token).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::execute(conn, sql, params, token).await,
        }
    }

    pub(crate) async fn query(
        &self,
        sql: &str,
        params: &[RowValues],
        token: &CancellationToken,
    ) -> Result<RowStream, DriverError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::query(conn, sql, params, token).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::query(conn, sql, params, token).await,
        }
    }

    pub(crate) async fn compile(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> Result<CompiledStatement, DriverError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::compile(conn, sql, token).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::compile(conn, sql, token).await,
        }
    }

    /// Run one or more statements that return nothing (BEGIN, COMMIT, ROLLBACK).
    pub(crate) async fn batch(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> Result<(), DriverError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::batch(conn, sql, token).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::batch(conn, sql, token).await,
        }
    }

    pub(crate) async fn transaction_state(&self) -> TxState {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::transaction_state(conn).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::transaction_state(conn).await,
        }
    }

    /// Keep this connection out of the pool once it is returned.
    ///
    /// `SQLite` connections need no mark: the pool evicts any that come back inside a
    /// transaction.
    pub(crate) fn poison(&self) {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => {}
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::poison(conn),
        }
    }

    pub(crate) async fn ping(&self, token: &CancellationToken) -> Result<(), DriverError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(conn) => sqlite::ping(conn, token).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(conn) => postgres::ping(conn, token).await,
        }
    }
}
