use crate::client::Client;
use crate::error::{DriverError, ErrorKind, SqlRegistryError, op_error, op_failed};
use crate::pool::DbConn;
use crate::results::ExecResult;
use crate::rows::{Row, Rows};
use crate::scope::OpGuard;
use crate::statement::CompiledStatement;
use crate::types::RowValues;

/// Where an operation gets its connection.
pub(crate) enum ConnTarget<'a> {
    /// A fresh checkout from the client's pool for every operation.
    Pool(&'a Client),
    /// The connection pinned by a transaction.
    Held(&'a DbConn),
}

/// Runs single operations under an [`OpGuard`], mapping driver failures to
/// [`SqlRegistryError::OperationError`] of one [`ErrorKind`].
pub(crate) struct Executor<'a> {
    db: &'a str,
    target: ConnTarget<'a>,
    kind: ErrorKind,
    quiet: bool,
}

impl<'a> Executor<'a> {
    pub(crate) fn pooled(client: &'a Client, kind: ErrorKind) -> Self {
        Self {
            db: client.name(),
            target: ConnTarget::Pool(client),
            kind,
            quiet: false,
        }
    }

    pub(crate) fn held(db: &'a str, conn: &'a DbConn, kind: ErrorKind) -> Self {
        Self {
            db,
            target: ConnTarget::Held(conn),
            kind,
            quiet: false,
        }
    }

    /// Failures are returned but not logged.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn fail(&self, query: &str, source: DriverError) -> SqlRegistryError {
        if self.quiet {
            op_error(self.kind, query, source)
        } else {
            op_failed(self.kind, self.db, query, source)
        }
    }

    fn observe<T>(
        &self,
        query: &str,
        res: Result<T, SqlRegistryError>,
    ) -> Result<T, SqlRegistryError> {
        if let Err(e @ (SqlRegistryError::DeadlineExceeded(_) | SqlRegistryError::Cancelled)) = &res
        {
            if !self.quiet {
                tracing::warn!(kind = %self.kind, db = self.db, query, error = %e, "operation abandoned");
            }
        }
        res
    }

    async fn conn(&self, query: &str) -> Result<DbConn, SqlRegistryError> {
        match self.target {
            ConnTarget::Pool(client) => client
                .pool()?
                .checkout()
                .await
                .map_err(|e| self.fail(query, e)),
            ConnTarget::Held(conn) => Ok(conn.clone()),
        }
    }

    /// Check a connection out within the guard's deadline.
    pub(crate) async fn checkout(
        &self,
        guard: &OpGuard,
        query: &str,
    ) -> Result<DbConn, SqlRegistryError> {
        let res = guard.bound(self.conn(query)).await;
        self.observe(query, res)
    }

    pub(crate) async fn exec(
        &self,
        guard: &OpGuard,
        sql: &str,
        params: &[RowValues],
    ) -> Result<ExecResult, SqlRegistryError> {
        let res = guard
            .bound(async {
                let conn = self.conn(sql).await?;
                conn.execute(sql, params, guard.token())
                    .await
                    .map_err(|e| self.fail(sql, e))
            })
            .await;
        self.observe(sql, res)
    }

    /// Open a cursor; the guard moves into the returned [`Rows`].
    pub(crate) async fn rows(
        &self,
        guard: OpGuard,
        sql: &str,
        params: &[RowValues],
    ) -> Result<Rows, SqlRegistryError> {
        let res = guard
            .bound(async {
                let conn = self.conn(sql).await?;
                conn.query(sql, params, guard.token())
                    .await
                    .map_err(|e| self.fail(sql, e))
            })
            .await;
        let stream = self.observe(sql, res)?;
        Ok(Rows::new(self.db, sql, self.kind, stream, guard))
    }

    /// Fetch at most one record. Failures are carried by the returned [`Row`].
    pub(crate) async fn first(&self, guard: OpGuard, sql: &str, params: &[RowValues]) -> Row {
        let stream_token = guard.token().child_token();
        let res = guard
            .bound(async {
                let conn = self.conn(sql).await?;
                let mut stream = conn
                    .query(sql, params, &stream_token)
                    .await
                    .map_err(|e| self.fail(sql, e))?;
                let first = stream
                    .next()
                    .await
                    .transpose()
                    .map_err(|e| self.fail(sql, e));
                stream.close();
                first
            })
            .await;
        stream_token.cancel();
        Row::new(self.observe(sql, res), guard)
    }

    pub(crate) async fn compile(
        &self,
        guard: &OpGuard,
        sql: &str,
    ) -> Result<CompiledStatement, SqlRegistryError> {
        let res = guard
            .bound(async {
                let conn = self.conn(sql).await?;
                conn.compile(sql, guard.token())
                    .await
                    .map_err(|e| self.fail(sql, e))
            })
            .await;
        self.observe(sql, res)
    }

    pub(crate) async fn batch(&self, guard: &OpGuard, sql: &str) -> Result<(), SqlRegistryError> {
        let res = guard
            .bound(async {
                let conn = self.conn(sql).await?;
                conn.batch(sql, guard.token())
                    .await
                    .map_err(|e| self.fail(sql, e))
            })
            .await;
        self.observe(sql, res)
    }

    pub(crate) async fn ping(&self, guard: &OpGuard) -> Result<(), SqlRegistryError> {
        const PING: &str = "SELECT 1";
        let res = guard
            .bound(async {
                let conn = self.conn(PING).await?;
                conn.ping(guard.token())
                    .await
                    .map_err(|e| self.fail(PING, e))
            })
            .await;
        self.observe(PING, res)
    }
}
