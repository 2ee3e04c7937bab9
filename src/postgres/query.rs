use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::results::Record;
use crate::types::RowValues;

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
pub(crate) fn extract_value(
    row: &tokio_postgres::Row,
    idx: usize,
) -> Result<RowValues, tokio_postgres::Error> {
    let type_info = row.columns()[idx].type_();

    Ok(match type_info.name() {
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(RowValues::Null, RowValues::Int),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Float(f64::from(v))),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(RowValues::Null, RowValues::Float),
        "bool" => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(RowValues::Null, RowValues::Bool),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map_or(RowValues::Null, RowValues::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Timestamp(v.naive_utc())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(RowValues::Null, RowValues::Timestamp),
        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)?
            .map_or(RowValues::Null, RowValues::JSON),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(RowValues::Null, RowValues::Blob),
        // text, varchar, bpchar, name and anything else readable as a string
        _ => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(RowValues::Null, RowValues::Text),
    })
}

pub(crate) fn extract_record(
    row: &tokio_postgres::Row,
    columns: &Arc<Vec<String>>,
) -> Result<Record, tokio_postgres::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        values.push(extract_value(row, idx)?);
    }
    Ok(Record::new(Arc::clone(columns), values))
}
