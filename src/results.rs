mod record;

pub use record::Record;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The number of rows inserted, updated or deleted
    pub rows_affected: u64,
    /// Row id of the last insert, where the driver reports one (`SQLite` only)
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    #[must_use]
    pub fn new(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows_affected,
            last_insert_id,
        }
    }
}
