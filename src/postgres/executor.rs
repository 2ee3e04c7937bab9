use std::sync::Arc;

use bb8::PooledConnection;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

use super::manager::PgManager;
use super::params::as_refs;
use super::query::extract_record;
use crate::error::DriverError;
use crate::pool::{ROW_BUFFER, RowStream, TxState};
use crate::results::ExecResult;
use crate::statement::CompiledStatement;
use crate::types::RowValues;

pub(crate) type PgPooled = Arc<PooledConnection<'static, PgManager>>;

/// Sends a server-side cancel for the client's running query once the token fires.
///
/// Dropping the watch before the token fires disarms it. Once the token has fired the
/// cancel request runs to completion, and the connection stays checked out until it
/// has been sent.
struct CancelWatch {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CancelWatch {
    fn arm(conn: &PgPooled, token: &CancellationToken) -> Self {
        let cancel = conn.cancel_token();
        let keep = Arc::clone(conn);
        let watched = token.clone();
        let task = tokio::spawn(async move {
            watched.cancelled().await;
            if let Err(e) = cancel.cancel_query(NoTls).await {
                tracing::debug!(error = %e, "postgres cancel request failed");
            }
            drop(keep);
        });
        Self {
            token: token.clone(),
            task,
        }
    }
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            self.task.abort();
        }
    }
}

fn classify(err: tokio_postgres::Error) -> DriverError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        DriverError::Interrupted
    } else {
        DriverError::Postgres(err)
    }
}

pub(crate) async fn execute(
    conn: &PgPooled,
    sql: &str,
    params: &[RowValues],
    token: &CancellationToken,
) -> Result<ExecResult, DriverError> {
    let _watch = CancelWatch::arm(conn, token);
    let stmt = conn.prepare(sql).await.map_err(classify)?;
    let affected = conn
        .execute(&stmt, &as_refs(params))
        .await
        .map_err(classify)?;
    Ok(ExecResult::new(affected, None))
}

pub(crate) async fn compile(
    conn: &PgPooled,
    sql: &str,
    token: &CancellationToken,
) -> Result<CompiledStatement, DriverError> {
    let _watch = CancelWatch::arm(conn, token);
    let stmt = conn.prepare(sql).await.map_err(classify)?;
    let columns = stmt
        .columns()
        .iter()
        .map(|col| col.name().to_owned())
        .collect();
    Ok(CompiledStatement::new(
        sql.to_owned(),
        columns,
        stmt.params().len(),
    ))
}

pub(crate) async fn batch(
    conn: &PgPooled,
    sql: &str,
    token: &CancellationToken,
) -> Result<(), DriverError> {
    let _watch = CancelWatch::arm(conn, token);
    conn.batch_execute(sql).await.map_err(classify)
}

/// Check the session after a failed statement: a healthy transaction answers, an
/// aborted one rejects every command until it is rolled back.
pub(crate) async fn transaction_state(conn: &PgPooled) -> TxState {
    match conn.simple_query("SELECT 1").await {
        Ok(_) => TxState::Open,
        Err(_) => TxState::Aborted,
    }
}

pub(crate) fn poison(conn: &PgPooled) {
    conn.poison();
}

pub(crate) async fn ping(conn: &PgPooled, token: &CancellationToken) -> Result<(), DriverError> {
    let _watch = CancelWatch::arm(conn, token);
    conn.simple_query("SELECT 1").await.map_err(classify)?;
    Ok(())
}

/// Start streaming `sql` from a spawned task that owns a clone of the connection.
pub(crate) async fn query(
    conn: &PgPooled,
    sql: &str,
    params: &[RowValues],
    token: &CancellationToken,
) -> Result<RowStream, DriverError> {
    let (meta_tx, meta_rx) = oneshot::channel();
    let (row_tx, row_rx) = mpsc::channel(ROW_BUFFER);
    let pooled = Arc::clone(conn);
    let sql = sql.to_owned();
    let params = params.to_vec();
    let producer_token = token.clone();

    tokio::spawn(async move {
        let _watch = CancelWatch::arm(&pooled, &producer_token);
        let stmt = match pooled.prepare(&sql).await {
            Ok(stmt) => stmt,
            Err(e) => {
                let _ = meta_tx.send(Err(classify(e)));
                return;
            }
        };
        let columns: Arc<Vec<String>> = Arc::new(
            stmt.columns()
                .iter()
                .map(|col| col.name().to_owned())
                .collect(),
        );
        let stream = match pooled.query_raw(&stmt, params.iter()).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = meta_tx.send(Err(classify(e)));
                return;
            }
        };
        if meta_tx.send(Ok(Arc::clone(&columns))).is_err() {
            return;
        }
        let mut stream = std::pin::pin!(stream);
        while let Some(item) = stream.next().await {
            let item = item
                .and_then(|row| extract_record(&row, &columns))
                .map_err(classify);
            let failed = item.is_err();
            if row_tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    let columns = match meta_rx.await {
        Ok(res) => res?,
        Err(_) if token.is_cancelled() => return Err(DriverError::Interrupted),
        Err(_) => return Err(DriverError::Task("postgres row producer exited".into())),
    };
    Ok(RowStream::new(columns, row_rx))
}
