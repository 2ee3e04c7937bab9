use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use bb8::ManageConnection;
use tokio_postgres::{Client, NoTls};

use crate::error::DriverError;

/// A pooled Postgres client that can be marked unfit for reuse.
pub(crate) struct PgConnection {
    client: Client,
    poisoned: AtomicBool,
}

impl PgConnection {
    /// The pool drops this connection instead of reusing it.
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

/// bb8 manager for Postgres clients.
pub(crate) struct PgManager {
    config: tokio_postgres::Config,
}

impl PgManager {
    pub(crate) fn new(config: tokio_postgres::Config) -> Self {
        Self { config }
    }
}

impl ManageConnection for PgManager {
    type Connection = PgConnection;
    type Error = DriverError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        async move {
            tracing::debug!(
                hosts = ?cfg.get_hosts(),
                db = ?cfg.get_dbname(),
                user = ?cfg.get_user(),
                "postgres connect start"
            );
            let (client, connection) = cfg.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "postgres connection closed with error");
                }
            });
            Ok(PgConnection {
                client,
                poisoned: AtomicBool::new(false),
            })
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            conn.simple_query("SELECT 1").await?;
            Ok(())
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        if conn.is_poisoned() {
            tracing::warn!("evicting postgres connection left in an unknown transaction state");
            return true;
        }
        conn.is_closed()
    }
}
