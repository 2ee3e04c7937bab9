use rusqlite::types::Value;

use crate::types::RowValues;

/// Convert a single `RowValues` to a rusqlite `Value`.
///
/// Booleans are stored as 0/1, timestamps and JSON as text.
pub(crate) fn to_sqlite_value(value: &RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(jval) => Value::Text(jval.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

pub(crate) fn convert(params: &[RowValues]) -> Vec<Value> {
    params.iter().map(to_sqlite_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn timestamps_are_text() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(8, 0, 1))
            .unwrap();
        assert_eq!(
            to_sqlite_value(&RowValues::Timestamp(dt)),
            Value::Text("2024-01-01 08:00:01".into())
        );
        assert_eq!(to_sqlite_value(&RowValues::Bool(true)), Value::Integer(1));
    }
}
