use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bb8::ManageConnection;
use tokio::sync::Mutex;

use super::executor::run_blocking;
use crate::error::DriverError;

/// Shared handle to one `SQLite` connection; moved into blocking tasks.
pub(crate) type SharedSqliteConnection = Arc<Mutex<rusqlite::Connection>>;

/// bb8 manager for `SQLite` connections.
#[derive(Debug, Clone)]
pub(crate) struct SqliteManager {
    path: String,
    busy_timeout: Duration,
}

impl SqliteManager {
    /// The DSN is a file path, optionally prefixed with `sqlite://`, or a `file:` URI.
    pub(crate) fn new(dsn: &str, busy_timeout: Duration) -> Self {
        let path = dsn.strip_prefix("sqlite://").unwrap_or(dsn).to_owned();
        Self { path, busy_timeout }
    }
}

impl ManageConnection for SqliteManager {
    type Connection = SharedSqliteConnection;
    type Error = DriverError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        async move {
            let target = path.clone();
            let conn = tokio::task::spawn_blocking(move || {
                let conn = rusqlite::Connection::open(&target)?;
                conn.busy_timeout(busy_timeout)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                Ok::<_, rusqlite::Error>(conn)
            })
            .await
            .map_err(|e| DriverError::Task(format!("sqlite connect join error: {e}")))??;
            tracing::debug!(path = %path, "sqlite connection opened");
            Ok(Arc::new(Mutex::new(conn)))
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let handle = Arc::clone(conn);
        async move {
            run_blocking(handle, None, |c| c.query_row("SELECT 1", [], |_| Ok(()))).await
        }
    }

    /// A connection still inside a transaction would leak it into the next checkout.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        let in_transaction = conn.try_lock().is_ok_and(|c| !c.is_autocommit());
        if in_transaction {
            tracing::warn!(path = %self.path, "evicting sqlite connection returned with an open transaction");
        }
        in_transaction
    }
}
