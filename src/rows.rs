use std::sync::Arc;

use crate::error::{ErrorKind, SqlRegistryError, op_failed};
use crate::pool::RowStream;
use crate::results::Record;
use crate::scope::OpGuard;
use crate::types::FromValue;

/// Streaming cursor over a query result.
///
/// The operation deadline covers the whole iteration. It is released once, when the
/// cursor is exhausted, fails, is closed, or is dropped.
pub struct Rows {
    db: String,
    query: String,
    kind: ErrorKind,
    columns: Arc<Vec<String>>,
    stream: Option<RowStream>,
    guard: Option<OpGuard>,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("db", &self.db)
            .field("query", &self.query)
            .field("columns", &self.columns)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl Rows {
    pub(crate) fn new(
        db: &str,
        query: &str,
        kind: ErrorKind,
        stream: RowStream,
        guard: OpGuard,
    ) -> Self {
        Self {
            db: db.to_owned(),
            query: query.to_owned(),
            kind,
            columns: Arc::clone(stream.columns()),
            stream: Some(stream),
            guard: Some(guard),
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// `false` once the cursor has been exhausted, failed or closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Fetch the next record, or `None` when the cursor is finished.
    ///
    /// After an error the cursor is closed and further calls return `None`.
    pub async fn next(&mut self) -> Option<Result<Record, SqlRegistryError>> {
        let (Some(stream), Some(guard)) = (self.stream.as_mut(), self.guard.as_ref()) else {
            return None;
        };
        let item = guard.bound(async { Ok(stream.next().await) }).await;
        match item {
            Ok(Some(Ok(record))) => Some(Ok(record)),
            Ok(None) => {
                self.close();
                None
            }
            Ok(Some(Err(e))) => {
                let err = op_failed(self.kind, &self.db, &self.query, e);
                self.close();
                Some(Err(err))
            }
            Err(e) => {
                tracing::warn!(kind = %self.kind, db = %self.db, query = %self.query, error = %e, "cursor abandoned");
                self.close();
                Some(Err(e))
            }
        }
    }

    /// Drain the remaining records.
    ///
    /// # Errors
    /// Returns the first error the cursor reports.
    pub async fn collect(mut self) -> Result<Vec<Record>, SqlRegistryError> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }

    /// Stop reading. The producer is cancelled and the deadline released.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        if let Some(mut guard) = self.guard.take() {
            guard.release();
        }
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of a single-row query.
///
/// Never fails at call time: driver errors and the absence of a row surface only when
/// the caller extracts values.
#[derive(Debug)]
pub struct Row {
    outcome: Result<Option<Record>, SqlRegistryError>,
    guard: Option<OpGuard>,
}

impl Row {
    pub(crate) fn new(outcome: Result<Option<Record>, SqlRegistryError>, guard: OpGuard) -> Self {
        Self {
            outcome,
            guard: Some(guard),
        }
    }

    pub(crate) fn failed(err: SqlRegistryError) -> Self {
        Self {
            outcome: Err(err),
            guard: None,
        }
    }

    /// The deferred driver error, if the query failed. `None` for success or no rows.
    #[must_use]
    pub fn err(&self) -> Option<&SqlRegistryError> {
        self.outcome.as_ref().err()
    }

    /// Take the record.
    ///
    /// # Errors
    /// [`SqlRegistryError::NoRows`] if the query matched nothing, otherwise the deferred
    /// query error.
    pub fn scan(mut self) -> Result<Record, SqlRegistryError> {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
        }
        match self.outcome {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(SqlRegistryError::NoRows),
            Err(e) => Err(e),
        }
    }

    /// Read the first column.
    ///
    /// # Errors
    /// As [`Row::scan`], plus [`SqlRegistryError::Scan`] on a type mismatch.
    pub fn scan_one<T: FromValue>(self) -> Result<T, SqlRegistryError> {
        self.scan()?.try_get_index(0)
    }

    /// Read the first two columns.
    ///
    /// # Errors
    /// As [`Row::scan_one`].
    pub fn scan_two<A: FromValue, B: FromValue>(self) -> Result<(A, B), SqlRegistryError> {
        let record = self.scan()?;
        Ok((record.try_get_index(0)?, record.try_get_index(1)?))
    }
}
