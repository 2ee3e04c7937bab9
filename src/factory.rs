//! Opens the pooled handle behind one registry name.

use bb8::{ManageConnection, Pool};
use tokio_util::sync::CancellationToken;

use crate::config::DbConfig;
use crate::error::{DriverError, SqlRegistryError};
use crate::pool::DbPool;
use crate::types::DatabaseType;

#[cfg(feature = "postgres")]
use crate::postgres::PgManager;
#[cfg(feature = "sqlite")]
use crate::sqlite::SqliteManager;

/// Build a pool for `config` and ping it once.
///
/// `config` is expected to have been through [`DbConfig::with_defaults`]. Nothing is
/// retried here: a failure is reported to the caller, and the next registry lookup
/// will try again.
///
/// # Errors
/// Returns [`SqlRegistryError::ConnectError`] if the DSN is malformed, the database
/// cannot be reached, or the first ping fails; [`SqlRegistryError::ConfigError`] if the
/// driver was not compiled in.
pub(crate) async fn connect(name: &str, config: &DbConfig) -> Result<DbPool, SqlRegistryError> {
    let connect_err = |source: DriverError| SqlRegistryError::ConnectError {
        name: name.to_owned(),
        source,
    };

    let pool = match config.driver() {
        #[cfg(feature = "sqlite")]
        DatabaseType::Sqlite => {
            let manager = SqliteManager::new(config.dsn(), config.exec_timeout());
            DbPool::Sqlite(build_pool(manager, config).await.map_err(connect_err)?)
        }
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => {
            let mut pg_config: tokio_postgres::Config =
                config.dsn().parse().map_err(|e| connect_err(DriverError::Postgres(e)))?;
            pg_config.connect_timeout(config.exec_timeout());
            DbPool::Postgres(
                build_pool(PgManager::new(pg_config), config)
                    .await
                    .map_err(connect_err)?,
            )
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(SqlRegistryError::ConfigError(format!(
                "`{name}` uses {other}, which this build does not support"
            )));
        }
    };

    let conn = tokio::time::timeout(config.exec_timeout(), pool.checkout())
        .await
        .map_err(|_| connect_err(DriverError::TimedOut(config.exec_timeout())))?
        .map_err(connect_err)?;
    let token = CancellationToken::new();
    let ping = tokio::time::timeout(config.exec_timeout(), conn.ping(&token)).await;
    token.cancel();
    match ping {
        Ok(res) => res.map_err(connect_err)?,
        Err(_) => return Err(connect_err(DriverError::TimedOut(config.exec_timeout()))),
    }
    drop(conn);

    let status = pool.status();
    tracing::info!(
        db = name,
        driver = %config.driver(),
        max_active = config.max_active(),
        connections = status.connections,
        "database handle constructed"
    );
    Ok(pool)
}

async fn build_pool<M>(manager: M, config: &DbConfig) -> Result<Pool<M>, DriverError>
where
    M: ManageConnection<Error = DriverError>,
{
    let max_size = config.max_active();
    let min_idle = config.max_idle().min(max_size);
    Pool::builder()
        .max_size(max_size)
        .min_idle(Some(min_idle))
        .max_lifetime(Some(config.idle_timeout()))
        .idle_timeout(Some(config.idle_timeout()))
        .connection_timeout(config.exec_timeout())
        .retry_connection(false)
        .build(manager)
        .await
}
