use std::sync::Arc;

use rusqlite::types::Value;

use crate::results::Record;
use crate::types::RowValues;

/// Extract a `RowValues` from a `SQLite` row.
pub(crate) fn extract_value(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<RowValues> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

pub(crate) fn extract_record(
    row: &rusqlite::Row<'_>,
    columns: &Arc<Vec<String>>,
) -> rusqlite::Result<Record> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        values.push(extract_value(row, idx)?);
    }
    Ok(Record::new(Arc::clone(columns), values))
}
