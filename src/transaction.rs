use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::DbConfig;
use crate::error::{ErrorKind, SqlRegistryError};
use crate::executor::Executor;
use crate::pool::{DbConn, TxState};
use crate::results::ExecResult;
use crate::rows::{Row, Rows};
use crate::scope::{OpGuard, Scope};
use crate::statement::{CompiledStatement, Stmt};
use crate::types::RowValues;

/// A transaction pinned to one pooled connection.
///
/// The transaction budget starts at `begin`. Each statement issued on it gets a fresh
/// exec or query budget, capped by what is left of the transaction's. Once the
/// transaction budget is spent, every operation returns [`SqlRegistryError::TxDone`].
///
/// A statement that fails, times out or is cancelled may take the whole transaction
/// with it (an interrupted `SQLite` write, any Postgres error). The transaction is then
/// rolled back and later operations return [`SqlRegistryError::TxDone`]; statements
/// are never silently run outside it.
///
/// Dropping an unfinished transaction rolls it back in the background.
pub struct Tx {
    db: Arc<str>,
    config: Arc<DbConfig>,
    conn: Mutex<Option<DbConn>>,
    guard: OpGuard,
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("db", &self.db)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Tx {
    pub(crate) async fn begin(client: &Client, scope: &Scope) -> Result<Self, SqlRegistryError> {
        let config = client.shared_config();
        let guard = scope.operation(config.tran_timeout());
        let conn = Executor::pooled(client, ErrorKind::Tx)
            .checkout(&guard, "BEGIN")
            .await?;
        let op = guard.scope().operation(config.exec_timeout());
        let begun = Executor::held(client.name(), &conn, ErrorKind::Tx)
            .batch(&op, "BEGIN")
            .await;
        drop(op);
        if let Err(e) = begun {
            // A BEGIN cut short may still have run.
            spawn_rollback(Arc::from(client.name()), conn, config.exec_timeout());
            return Err(e);
        }
        tracing::debug!(db = client.name(), "transaction started");
        Ok(Self {
            db: Arc::from(client.name()),
            config,
            conn: Mutex::new(Some(conn)),
            guard,
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<DbConn>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Result<DbConn, SqlRegistryError> {
        match self.slot().as_ref() {
            Some(conn) if !self.guard.is_expired() => Ok(conn.clone()),
            _ => Err(SqlRegistryError::TxDone),
        }
    }

    fn op(&self, budget: Duration) -> OpGuard {
        self.guard.scope().operation(budget)
    }

    /// After a failed statement, find out whether the transaction survived it. If it
    /// did not, detach the connection so that nothing else runs on it.
    async fn settle<T>(
        &self,
        conn: &DbConn,
        res: Result<T, SqlRegistryError>,
    ) -> Result<T, SqlRegistryError> {
        if let Err(e) = &res {
            self.check_after(conn, e).await;
        }
        res
    }

    async fn settle_row(&self, conn: &DbConn, row: Row) -> Row {
        if let Some(e) = row.err() {
            self.check_after(conn, e).await;
        }
        row
    }

    async fn check_after(&self, conn: &DbConn, err: &SqlRegistryError) {
        if !matches!(
            err,
            SqlRegistryError::OperationError { .. }
                | SqlRegistryError::DeadlineExceeded(_)
                | SqlRegistryError::Cancelled
        ) {
            return;
        }
        let state = tokio::time::timeout(self.config.exec_timeout(), conn.transaction_state())
            .await
            .unwrap_or(TxState::Aborted);
        if state == TxState::Open {
            return;
        }
        let Some(conn) = self.slot().take() else {
            return;
        };
        tracing::warn!(db = %self.db, state = ?state, error = %err, "statement failure ended the transaction");
        match state {
            TxState::Ended => drop(conn),
            _ => spawn_rollback(Arc::clone(&self.db), conn, self.config.exec_timeout()),
        }
    }

    /// `true` until commit, rollback, a statement failure that ended the transaction,
    /// or the transaction budget running out.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.live().is_ok()
    }

    /// # Errors
    /// [`SqlRegistryError::TxDone`] if the transaction is finished; otherwise as
    /// [`Client::exec`].
    pub async fn exec(
        &self,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SqlRegistryError> {
        let conn = self.live()?;
        let op = self.op(self.config.exec_timeout());
        let res = Executor::held(&self.db, &conn, ErrorKind::Tx)
            .exec(&op, sql, params)
            .await;
        drop(op);
        self.settle(&conn, res).await
    }

    /// Finish or close the returned cursor before issuing the next statement.
    ///
    /// # Errors
    /// [`SqlRegistryError::TxDone`] if the transaction is finished; otherwise as
    /// [`Client::query`].
    pub async fn query(&self, sql: &str, params: &[RowValues]) -> Result<Rows, SqlRegistryError> {
        let conn = self.live()?;
        let op = self.op(self.config.query_timeout());
        let res = Executor::held(&self.db, &conn, ErrorKind::Tx)
            .rows(op, sql, params)
            .await;
        self.settle(&conn, res).await
    }

    pub async fn query_row(&self, sql: &str, params: &[RowValues]) -> Row {
        let conn = match self.live() {
            Ok(conn) => conn,
            Err(e) => return Row::failed(e),
        };
        let op = self.op(self.config.query_timeout());
        let row = Executor::held(&self.db, &conn, ErrorKind::Tx)
            .first(op, sql, params)
            .await;
        self.settle_row(&conn, row).await
    }

    /// Compile `sql` on this transaction's connection.
    ///
    /// # Errors
    /// [`SqlRegistryError::TxDone`] or the compile failure.
    pub async fn prepare(&self, sql: &str) -> Result<TxStmt<'_>, SqlRegistryError> {
        let conn = self.live()?;
        let op = self.op(self.config.exec_timeout());
        let res = Executor::held(&self.db, &conn, ErrorKind::Tx)
            .compile(&op, sql)
            .await;
        drop(op);
        let compiled = self.settle(&conn, res).await?;
        Ok(TxStmt {
            tx: self,
            compiled: Arc::new(compiled),
        })
    }

    /// Bind an existing prepared statement to this transaction.
    ///
    /// # Errors
    /// [`SqlRegistryError::StatementNotReady`] if `stmt` has not compiled yet,
    /// [`SqlRegistryError::TxDone`] if the transaction is finished.
    pub fn stmt(&self, stmt: &Stmt) -> Result<TxStmt<'_>, SqlRegistryError> {
        self.live()?;
        let compiled = stmt.ready()?;
        Ok(TxStmt { tx: self, compiled })
    }

    /// # Errors
    /// [`SqlRegistryError::TxDone`] if already finished or out of budget, in which case
    /// the transaction is rolled back; otherwise the driver's commit failure.
    pub async fn commit(mut self) -> Result<(), SqlRegistryError> {
        self.finish("COMMIT").await
    }

    /// # Errors
    /// As [`Tx::commit`].
    pub async fn rollback(mut self) -> Result<(), SqlRegistryError> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, sql: &'static str) -> Result<(), SqlRegistryError> {
        let taken = self
            .conn
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(conn) = taken else {
            return Err(SqlRegistryError::TxDone);
        };
        if self.guard.is_expired() {
            tracing::warn!(db = %self.db, "transaction budget spent before {sql}, rolling back");
            spawn_rollback(Arc::clone(&self.db), conn, self.config.exec_timeout());
            self.guard.release();
            return Err(SqlRegistryError::TxDone);
        }

        let op = self.op(self.config.exec_timeout());
        let res = Executor::held(&self.db, &conn, ErrorKind::Tx)
            .batch(&op, sql)
            .await;
        drop(op);
        match &res {
            Ok(()) => tracing::debug!(db = %self.db, "transaction finished with {sql}"),
            Err(_) => spawn_rollback(Arc::clone(&self.db), conn, self.config.exec_timeout()),
        }
        self.guard.release();
        res
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        let taken = self
            .conn
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(conn) = taken {
            tracing::debug!(db = %self.db, "unfinished transaction dropped, rolling back");
            spawn_rollback(Arc::clone(&self.db), conn, self.config.exec_timeout());
        }
    }
}

/// Roll back on a detached task; the connection returns to its pool afterwards.
///
/// A connection whose rollback cannot be confirmed is kept out of the pool.
fn spawn_rollback(db: Arc<str>, conn: DbConn, timeout: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(db = %db, "no runtime available to roll back transaction");
        conn.poison();
        return;
    };
    handle.spawn(async move {
        let token = CancellationToken::new();
        match tokio::time::timeout(timeout, conn.batch("ROLLBACK", &token)).await {
            Ok(Ok(())) => tracing::debug!(db = %db, "transaction rolled back"),
            Ok(Err(e)) => {
                conn.poison();
                tracing::warn!(db = %db, error = %e, "rollback failed");
            }
            Err(_) => {
                token.cancel();
                conn.poison();
                tracing::warn!(db = %db, "rollback timed out after {timeout:?}");
            }
        }
    });
}

/// A compiled statement bound to a transaction.
pub struct TxStmt<'tx> {
    tx: &'tx Tx,
    compiled: Arc<CompiledStatement>,
}

impl std::fmt::Debug for TxStmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxStmt")
            .field("db", &self.tx.db)
            .field("query", &self.compiled.sql())
            .finish()
    }
}

impl TxStmt<'_> {
    #[must_use]
    pub fn compiled(&self) -> &CompiledStatement {
        &self.compiled
    }

    /// # Errors
    /// As [`Tx::exec`], plus a parameter-count mismatch.
    pub async fn exec(&self, params: &[RowValues]) -> Result<ExecResult, SqlRegistryError> {
        let conn = self.tx.live()?;
        self.compiled.check_arity(&self.tx.db, params)?;
        let op = self.tx.op(self.tx.config.exec_timeout());
        let res = Executor::held(&self.tx.db, &conn, ErrorKind::Stmt)
            .exec(&op, self.compiled.sql(), params)
            .await;
        drop(op);
        self.tx.settle(&conn, res).await
    }

    /// # Errors
    /// As [`Tx::query`], plus a parameter-count mismatch.
    pub async fn query(&self, params: &[RowValues]) -> Result<Rows, SqlRegistryError> {
        let conn = self.tx.live()?;
        self.compiled.check_arity(&self.tx.db, params)?;
        let op = self.tx.op(self.tx.config.query_timeout());
        let res = Executor::held(&self.tx.db, &conn, ErrorKind::Stmt)
            .rows(op, self.compiled.sql(), params)
            .await;
        self.tx.settle(&conn, res).await
    }

    pub async fn query_row(&self, params: &[RowValues]) -> Row {
        let conn = match self.tx.live() {
            Ok(conn) => conn,
            Err(e) => return Row::failed(e),
        };
        if let Err(e) = self.compiled.check_arity(&self.tx.db, params) {
            return Row::failed(e);
        }
        let op = self.tx.op(self.tx.config.query_timeout());
        let row = Executor::held(&self.tx.db, &conn, ErrorKind::Stmt)
            .first(op, self.compiled.sql(), params)
            .await;
        self.tx.settle_row(&conn, row).await
    }
}
