use std::sync::Arc;

use bb8::PooledConnection;
use rusqlite::params_from_iter;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::{SharedSqliteConnection, SqliteManager};
use super::params::convert;
use super::query::extract_record;
use crate::error::DriverError;
use crate::pool::{ROW_BUFFER, RowStream, TxState};
use crate::results::ExecResult;
use crate::statement::CompiledStatement;
use crate::types::RowValues;

pub(crate) type SqlitePooled = Arc<PooledConnection<'static, SqliteManager>>;

/// Interrupts the connection's running statement once the token fires.
struct InterruptWatch(JoinHandle<()>);

impl InterruptWatch {
    fn arm(runtime: &Handle, conn: &rusqlite::Connection, token: CancellationToken) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self(runtime.spawn(async move {
            token.cancelled().await;
            interrupt.interrupt();
        }))
    }
}

impl Drop for InterruptWatch {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn classify(err: rusqlite::Error) -> DriverError {
    if err.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) {
        DriverError::Interrupted
    } else {
        DriverError::Sqlite(err)
    }
}

/// Run `func` with the connection locked, on the calling (blocking) thread.
fn run_locked<F, R>(
    conn: &SharedSqliteConnection,
    token: Option<&CancellationToken>,
    runtime: &Handle,
    func: F,
) -> Result<R, DriverError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, rusqlite::Error>,
{
    let cancelled = || token.is_some_and(CancellationToken::is_cancelled);
    if cancelled() {
        return Err(DriverError::Interrupted);
    }
    let mut guard = conn.blocking_lock();
    if cancelled() {
        return Err(DriverError::Interrupted);
    }
    let _watch = token.map(|token| InterruptWatch::arm(runtime, &guard, token.clone()));
    func(&mut guard).map_err(classify)
}

/// Run `func` against the connection on the blocking pool.
///
/// With a token, the statement in progress is interrupted when the token is cancelled,
/// so an abandoned call frees the connection promptly.
pub(crate) async fn run_blocking<F, R>(
    conn: SharedSqliteConnection,
    token: Option<CancellationToken>,
    func: F,
) -> Result<R, DriverError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, rusqlite::Error> + Send + 'static,
    R: Send + 'static,
{
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || run_locked(&conn, token.as_ref(), &runtime, func))
        .await
        .map_err(|e| DriverError::Task(format!("sqlite spawn_blocking join error: {e}")))?
}

fn shared(conn: &SqlitePooled) -> SharedSqliteConnection {
    Arc::clone(&***conn)
}

/// [`run_blocking`] that keeps the pooled connection checked out until `func` returns,
/// even if the caller stops waiting. The checkout ends after the lock is released.
async fn run_pooled<F, R>(
    conn: &SqlitePooled,
    token: Option<&CancellationToken>,
    func: F,
) -> Result<R, DriverError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<R, rusqlite::Error> + Send + 'static,
    R: Send + 'static,
{
    let pooled = Arc::clone(conn);
    let token = token.cloned();
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || {
        let out = run_locked(&shared(&pooled), token.as_ref(), &runtime, func);
        drop(pooled);
        out
    })
    .await
    .map_err(|e| DriverError::Task(format!("sqlite spawn_blocking join error: {e}")))?
}

/// `SQLite` ends a transaction on its own when an interrupted or failed write forces a
/// rollback; the connection is then back in autocommit mode.
pub(crate) async fn transaction_state(conn: &SqlitePooled) -> TxState {
    match run_pooled(conn, None, |c| Ok(c.is_autocommit())).await {
        Ok(false) => TxState::Open,
        Ok(true) => TxState::Ended,
        Err(_) => TxState::Aborted,
    }
}

pub(crate) async fn execute(
    conn: &SqlitePooled,
    sql: &str,
    params: &[RowValues],
    token: &CancellationToken,
) -> Result<ExecResult, DriverError> {
    let sql = sql.to_owned();
    let values = convert(params);
    run_pooled(conn, Some(token), move |c| {
        let mut stmt = c.prepare_cached(&sql)?;
        let affected = stmt.execute(params_from_iter(values.iter()))?;
        drop(stmt);
        Ok(ExecResult::new(affected as u64, Some(c.last_insert_rowid())))
    })
    .await
}

pub(crate) async fn compile(
    conn: &SqlitePooled,
    sql: &str,
    token: &CancellationToken,
) -> Result<CompiledStatement, DriverError> {
    let owned = sql.to_owned();
    run_pooled(conn, Some(token), move |c| {
        let stmt = c.prepare_cached(&owned)?;
        let columns = stmt
            .column_names()
            .iter()
            .map(ToString::to_string)
            .collect();
        let param_count = stmt.parameter_count();
        drop(stmt);
        Ok(CompiledStatement::new(owned, columns, param_count))
    })
    .await
}

pub(crate) async fn batch(
    conn: &SqlitePooled,
    sql: &str,
    token: &CancellationToken,
) -> Result<(), DriverError> {
    let sql = sql.to_owned();
    run_pooled(conn, Some(token), move |c| c.execute_batch(&sql)).await
}

pub(crate) async fn ping(conn: &SqlitePooled, token: &CancellationToken) -> Result<(), DriverError> {
    run_pooled(conn, Some(token), |c| {
        c.query_row("SELECT 1", [], |_| Ok(()))
    })
    .await
}

/// Start streaming `sql` on a blocking thread.
///
/// The producer keeps the pooled connection checked out until the cursor is exhausted,
/// the receiver goes away, or the token interrupts it.
pub(crate) async fn query(
    conn: &SqlitePooled,
    sql: &str,
    params: &[RowValues],
    token: &CancellationToken,
) -> Result<RowStream, DriverError> {
    let (meta_tx, meta_rx) = oneshot::channel();
    let (row_tx, row_rx) = mpsc::channel(ROW_BUFFER);
    let sql = sql.to_owned();
    let values = convert(params);
    let pooled = Arc::clone(conn);
    let handle = shared(conn);
    let producer_token = token.clone();

    tokio::spawn(async move {
        let outcome = run_blocking(handle, Some(producer_token), move |c| {
            let mut stmt = match c.prepare_cached(&sql) {
                Ok(stmt) => stmt,
                Err(e) => {
                    let _ = meta_tx.send(Err(classify(e)));
                    return Ok(());
                }
            };
            let columns: Arc<Vec<String>> = Arc::new(
                stmt.column_names()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            );
            let mut rows = match stmt.query(params_from_iter(values.iter())) {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = meta_tx.send(Err(classify(e)));
                    return Ok(());
                }
            };
            if meta_tx.send(Ok(Arc::clone(&columns))).is_err() {
                return Ok(());
            }
            loop {
                let item = match rows.next() {
                    Ok(Some(row)) => extract_record(row, &columns).map_err(classify),
                    Ok(None) => break,
                    Err(e) => Err(classify(e)),
                };
                let failed = item.is_err();
                if row_tx.blocking_send(item).is_err() || failed {
                    break;
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = outcome {
            tracing::debug!(error = %e, "sqlite row producer stopped early");
        }
        drop(pooled);
    });

    let columns = match meta_rx.await {
        Ok(res) => res?,
        Err(_) if token.is_cancelled() => return Err(DriverError::Interrupted),
        Err(_) => {
            return Err(DriverError::Task("sqlite row producer exited".into()));
        }
    };
    Ok(RowStream::new(columns, row_rx))
}
