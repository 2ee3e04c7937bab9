use std::sync::{Arc, PoisonError, RwLock};

use crate::config::DbConfig;
use crate::error::{ErrorKind, SqlRegistryError};
use crate::executor::Executor;
use crate::pool::{DbPool, PoolStatus};
use crate::results::ExecResult;
use crate::rows::{Row, Rows};
use crate::scope::Scope;
use crate::statement::{CompiledStatement, Stmt};
use crate::transaction::Tx;
use crate::types::RowValues;

/// Pooled handle for one registered database.
///
/// Shared as `Arc<Client>`. Every operation is bounded by the budget for its category
/// (query, exec or transaction) layered on the caller's [`Scope`]. A timeout never
/// closes the client; only [`Client::close`] or [`Registry::close_all`] does.
///
/// [`Registry::close_all`]: crate::Registry::close_all
pub struct Client {
    name: Arc<str>,
    config: Arc<DbConfig>,
    pool: RwLock<Option<DbPool>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("driver", &self.config.driver())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    pub(crate) fn new(name: &str, config: Arc<DbConfig>, pool: DbPool) -> Self {
        Self {
            name: Arc::from(name),
            config,
            pool: RwLock::new(Some(pool)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this client was built from, defaults applied.
    #[must_use]
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<DbConfig> {
        Arc::clone(&self.config)
    }

    pub(crate) fn pool(&self) -> Result<DbPool, SqlRegistryError> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SqlRegistryError::Closed(self.name.to_string()))
    }

    /// Run a statement that returns no rows, within the exec budget.
    ///
    /// # Errors
    /// [`SqlRegistryError::OperationError`] if the driver fails,
    /// [`SqlRegistryError::DeadlineExceeded`] or [`SqlRegistryError::Cancelled`] if the
    /// call is cut short, [`SqlRegistryError::Closed`] after [`Client::close`].
    pub async fn exec(
        &self,
        scope: &Scope,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SqlRegistryError> {
        let guard = scope.operation(self.config.exec_timeout());
        Executor::pooled(self, ErrorKind::Db)
            .exec(&guard, sql, params)
            .await
    }

    /// Open a streaming cursor, within the query budget.
    ///
    /// # Errors
    /// As [`Client::exec`]; errors while reading surface from [`Rows::next`].
    pub async fn query(
        &self,
        scope: &Scope,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Rows, SqlRegistryError> {
        let guard = scope.operation(self.config.query_timeout());
        Executor::pooled(self, ErrorKind::Rows)
            .rows(guard, sql, params)
            .await
    }

    /// Fetch one row. Errors are deferred to [`Row::scan`].
    pub async fn query_row(&self, scope: &Scope, sql: &str, params: &[RowValues]) -> Row {
        let guard = scope.operation(self.config.query_timeout());
        Executor::pooled(self, ErrorKind::Row)
            .first(guard, sql, params)
            .await
    }

    /// Round-trip to the database within the exec budget.
    ///
    /// # Errors
    /// As [`Client::exec`].
    pub async fn ping(&self, scope: &Scope) -> Result<(), SqlRegistryError> {
        let guard = scope.operation(self.config.exec_timeout());
        Executor::pooled(self, ErrorKind::Db).ping(&guard).await
    }

    /// Start a transaction bounded by the transaction budget.
    ///
    /// # Errors
    /// As [`Client::exec`].
    pub async fn begin(&self, scope: &Scope) -> Result<Tx, SqlRegistryError> {
        Tx::begin(self, scope).await
    }

    /// Compile `sql` once and return it; failures are returned to the caller.
    ///
    /// # Errors
    /// [`SqlRegistryError::OperationError`] if the statement does not compile.
    pub async fn prepare(self: &Arc<Self>, sql: &str) -> Result<Stmt, SqlRegistryError> {
        let compiled = self.compile(sql, false).await?;
        Ok(Stmt::compiled_now(Arc::clone(self), compiled))
    }

    /// Compile `sql`, falling back to a background retry loop.
    ///
    /// Never fails. When the first attempt does not compile, the statement is returned
    /// absent and retried every [`RETRY_INTERVAL`](crate::statement::RETRY_INTERVAL)
    /// until it does.
    pub async fn prepared(self: &Arc<Self>, sql: &str) -> Stmt {
        match self.compile(sql, true).await {
            Ok(compiled) => Stmt::compiled_now(Arc::clone(self), compiled),
            Err(e) => {
                tracing::warn!(db = %self.name, query = sql, error = %e, "statement did not compile, retrying in background");
                Stmt::retrying(Arc::clone(self), sql)
            }
        }
    }

    pub(crate) async fn compile(
        &self,
        sql: &str,
        quiet: bool,
    ) -> Result<CompiledStatement, SqlRegistryError> {
        let guard = Scope::new().operation(self.config.exec_timeout());
        let executor = Executor::pooled(self, ErrorKind::Db);
        let executor = if quiet { executor.quiet() } else { executor };
        executor.compile(&guard, sql).await
    }

    /// Close the pool. Idle connections are dropped, checked-out ones as they return.
    pub fn close(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            tracing::info!(db = %self.name, "database handle closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Pool occupancy, or `None` once closed.
    #[must_use]
    pub fn status(&self) -> Option<PoolStatus> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(DbPool::status)
    }
}
