mod connection;

use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::postgres::PgManager;
#[cfg(feature = "sqlite")]
use crate::sqlite::SqliteManager;
use bb8::Pool;
use tokio::sync::mpsc;

pub(crate) use connection::{DbConn, TxState};

use crate::error::DriverError;
use crate::results::Record;
use crate::types::DatabaseType;

/// Rows buffered between a driver producer and its cursor.
pub(crate) const ROW_BUFFER: usize = 64;

/// Connection pool for one registered database.
///
/// This enum wraps the bb8 pool of each supported engine.
#[derive(Clone)]
pub(crate) enum DbPool {
    #[cfg(feature = "sqlite")]
    Sqlite(Pool<SqliteManager>),
    #[cfg(feature = "postgres")]
    Postgres(Pool<PgManager>),
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("DbPool")
            .field("driver", &self.driver())
            .field("connections", &status.connections)
            .field("idle_connections", &status.idle_connections)
            .finish()
    }
}

impl DbPool {
    pub(crate) fn driver(&self) -> DatabaseType {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => DatabaseType::Sqlite,
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => DatabaseType::Postgres,
        }
    }

    /// Check a connection out of the pool.
    ///
    /// Waits at most the pool's connection timeout.
    pub(crate) async fn checkout(&self) -> Result<DbConn, DriverError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => {
                let conn = pool
                    .get_owned()
                    .await
                    .map_err(|e| DriverError::Pool(format!("sqlite checkout error: {e}")))?;
                Ok(DbConn::Sqlite(Arc::new(conn)))
            }
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => {
                let conn = pool
                    .get_owned()
                    .await
                    .map_err(|e| DriverError::Pool(format!("postgres checkout error: {e}")))?;
                Ok(DbConn::Postgres(Arc::new(conn)))
            }
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let state = match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(pool) => pool.state(),
            #[cfg(feature = "postgres")]
            Self::Postgres(pool) => pool.state(),
        };
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

/// Snapshot of a client's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out
    pub connections: u32,
    /// Connections currently idle in the pool
    pub idle_connections: u32,
}

/// Records produced by a driver task, in order.
pub(crate) struct RowStream {
    columns: Arc<Vec<String>>,
    rx: mpsc::Receiver<Result<Record, DriverError>>,
}

impl RowStream {
    pub(crate) fn new(
        columns: Arc<Vec<String>>,
        rx: mpsc::Receiver<Result<Record, DriverError>>,
    ) -> Self {
        Self { columns, rx }
    }

    pub(crate) fn columns(&self) -> &Arc<Vec<String>> {
        &self.columns
    }

    pub(crate) async fn next(&mut self) -> Option<Result<Record, DriverError>> {
        self.rx.recv().await
    }

    /// Stop the producer; rows already buffered are discarded.
    pub(crate) fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
