use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::client::Client;
use crate::error::{DriverError, ErrorKind, SqlRegistryError, op_failed};
use crate::executor::Executor;
use crate::results::ExecResult;
use crate::rows::{Row, Rows};
use crate::scope::Scope;
use crate::types::RowValues;

/// Delay between background compile attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Failed attempts between two warnings from the retry loop.
const RETRY_LOG_EVERY: u64 = 60;

/// What the driver reported when a statement compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    sql: String,
    columns: Vec<String>,
    param_count: usize,
}

impl CompiledStatement {
    pub(crate) fn new(sql: String, columns: Vec<String>, param_count: usize) -> Self {
        Self {
            sql,
            columns,
            param_count,
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Result columns; empty for statements that return no rows.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub(crate) fn check_arity(
        &self,
        db: &str,
        params: &[RowValues],
    ) -> Result<(), SqlRegistryError> {
        if params.len() == self.param_count {
            return Ok(());
        }
        Err(op_failed(
            ErrorKind::Stmt,
            db,
            &self.sql,
            DriverError::Parameter(format!(
                "expected {} parameters, got {}",
                self.param_count,
                params.len()
            )),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    /// Not compiled yet; a background task is retrying.
    Absent,
    /// Compiled; terminal.
    Compiled,
}

#[derive(Debug, Default)]
struct Slot {
    compiled: OnceLock<Arc<CompiledStatement>>,
    closed: AtomicBool,
}

/// A prepared statement that keeps compiling in the background until it succeeds.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use sql_registry::prelude::*;
/// # async fn demo(client: Arc<Client>) -> Result<(), SqlRegistryError> {
/// let stmt = client.prepared("UPDATE jobs SET state = ? WHERE id = ?").await;
/// let params = [RowValues::Text("done".into()), RowValues::Int(42)];
/// match stmt.exec(&Scope::new(), &params).await {
///     Err(e) if e.is_not_ready() => { /* fall back to an ad-hoc query */ }
///     other => { other?; }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Stmt {
    client: Arc<Client>,
    query: Arc<str>,
    slot: Arc<Slot>,
}

impl std::fmt::Debug for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stmt")
            .field("db", &self.client.name())
            .field("query", &self.query)
            .field("state", &self.state())
            .finish()
    }
}

impl Stmt {
    pub(crate) fn compiled_now(client: Arc<Client>, compiled: CompiledStatement) -> Self {
        let slot = Slot::default();
        let query = Arc::from(compiled.sql());
        let _ = slot.compiled.set(Arc::new(compiled));
        Self {
            client,
            query,
            slot: Arc::new(slot),
        }
    }

    /// Absent statement with a detached retry loop.
    pub(crate) fn retrying(client: Arc<Client>, query: &str) -> Self {
        let stmt = Self {
            client,
            query: Arc::from(query),
            slot: Arc::new(Slot::default()),
        };
        spawn_retry(
            Arc::clone(&stmt.client),
            Arc::clone(&stmt.query),
            Arc::clone(&stmt.slot),
        );
        stmt
    }

    #[must_use]
    pub fn query_text(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn state(&self) -> StatementState {
        if self.slot.compiled.get().is_some() {
            StatementState::Compiled
        } else {
            StatementState::Absent
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == StatementState::Compiled
    }

    #[must_use]
    pub fn compiled(&self) -> Option<Arc<CompiledStatement>> {
        self.slot.compiled.get().cloned()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ready(&self) -> Result<Arc<CompiledStatement>, SqlRegistryError> {
        if self.is_closed() {
            return Err(SqlRegistryError::Closed(self.query.to_string()));
        }
        self.compiled()
            .ok_or_else(|| SqlRegistryError::StatementNotReady(self.query.to_string()))
    }

    /// # Errors
    /// [`SqlRegistryError::StatementNotReady`] while absent; otherwise as [`Client::exec`].
    pub async fn exec(
        &self,
        scope: &Scope,
        params: &[RowValues],
    ) -> Result<ExecResult, SqlRegistryError> {
        let compiled = self.ready()?;
        compiled.check_arity(self.client.name(), params)?;
        let guard = scope.operation(self.client.config().exec_timeout());
        Executor::pooled(&self.client, ErrorKind::Stmt)
            .exec(&guard, compiled.sql(), params)
            .await
    }

    /// # Errors
    /// [`SqlRegistryError::StatementNotReady`] while absent; otherwise as [`Client::query`].
    pub async fn query(
        &self,
        scope: &Scope,
        params: &[RowValues],
    ) -> Result<Rows, SqlRegistryError> {
        let compiled = self.ready()?;
        compiled.check_arity(self.client.name(), params)?;
        let guard = scope.operation(self.client.config().query_timeout());
        Executor::pooled(&self.client, ErrorKind::Stmt)
            .rows(guard, compiled.sql(), params)
            .await
    }

    /// Like [`Client::query_row`]; an absent statement surfaces at scan time.
    pub async fn query_row(&self, scope: &Scope, params: &[RowValues]) -> Row {
        let compiled = match self
            .ready()
            .and_then(|c| c.check_arity(self.client.name(), params).map(|()| c))
        {
            Ok(compiled) => compiled,
            Err(e) => return Row::failed(e),
        };
        let guard = scope.operation(self.client.config().query_timeout());
        Executor::pooled(&self.client, ErrorKind::Stmt)
            .first(guard, compiled.sql(), params)
            .await
    }

    /// Mark the statement closed. A pending retry loop exits at its next wake-up.
    pub fn close(&self) {
        self.slot.closed.store(true, Ordering::Release);
    }
}

fn spawn_retry(client: Arc<Client>, query: Arc<str>, slot: Arc<Slot>) {
    tokio::spawn(async move {
        let mut attempts: u64 = 0;
        loop {
            tokio::time::sleep(RETRY_INTERVAL).await;
            if slot.closed.load(Ordering::Acquire) {
                tracing::debug!(db = client.name(), query = %query, "statement closed before it compiled");
                return;
            }
            if client.is_closed() {
                tracing::debug!(db = client.name(), query = %query, "client closed, statement retry stopped");
                return;
            }
            attempts += 1;
            match client.compile(&query, true).await {
                Ok(compiled) => {
                    let _ = slot.compiled.set(Arc::new(compiled));
                    tracing::info!(db = client.name(), query = %query, attempts, "prepared statement compiled");
                    return;
                }
                Err(e) => {
                    if attempts == 1 || attempts % RETRY_LOG_EVERY == 0 {
                        tracing::warn!(db = client.name(), query = %query, attempts, error = %e, "prepared statement still not compiled");
                    }
                }
            }
        }
    });
}
