use std::fmt;

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::SqlRegistryError;

/// Values that can be stored in a database row or used as query parameters.
///
/// The same enum is used by every backend:
/// ```rust
/// use sql_registry::prelude::*;
///
/// let params = vec![
///     RowValues::Int(7),
///     RowValues::Text("alice".into()),
///     RowValues::Null,
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let RowValues::Int(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    /// Booleans, plus the integers 0 and 1 as stored by `SQLite`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RowValues::Bool(value) => Some(*value),
            RowValues::Int(1) => Some(true),
            RowValues::Int(0) => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            RowValues::Timestamp(value) => Some(*value),
            RowValues::Text(s) => ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            RowValues::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            RowValues::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            RowValues::Int(_) => "int",
            RowValues::Float(_) => "float",
            RowValues::Text(_) => "text",
            RowValues::Bool(_) => "bool",
            RowValues::Timestamp(_) => "timestamp",
            RowValues::Null => "null",
            RowValues::JSON(_) => "json",
            RowValues::Blob(_) => "blob",
        }
    }
}

impl From<i64> for RowValues {
    fn from(value: i64) -> Self {
        RowValues::Int(value)
    }
}

impl From<i32> for RowValues {
    fn from(value: i32) -> Self {
        RowValues::Int(i64::from(value))
    }
}

impl From<f64> for RowValues {
    fn from(value: f64) -> Self {
        RowValues::Float(value)
    }
}

impl From<bool> for RowValues {
    fn from(value: bool) -> Self {
        RowValues::Bool(value)
    }
}

impl From<&str> for RowValues {
    fn from(value: &str) -> Self {
        RowValues::Text(value.to_owned())
    }
}

impl From<String> for RowValues {
    fn from(value: String) -> Self {
        RowValues::Text(value)
    }
}

impl From<Vec<u8>> for RowValues {
    fn from(value: Vec<u8>) -> Self {
        RowValues::Blob(value)
    }
}

impl From<NaiveDateTime> for RowValues {
    fn from(value: NaiveDateTime) -> Self {
        RowValues::Timestamp(value)
    }
}

impl From<JsonValue> for RowValues {
    fn from(value: JsonValue) -> Self {
        RowValues::JSON(value)
    }
}

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// Typed extraction of a single column value.
pub trait FromValue: Sized {
    /// Convert a column value into `Self`.
    ///
    /// # Errors
    /// Returns [`SqlRegistryError::Scan`] when the value has an incompatible type.
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError>;
}

fn mismatch(expected: &str, value: &RowValues) -> SqlRegistryError {
    SqlRegistryError::Scan(format!(
        "cannot read {} column as {expected}",
        value.type_name()
    ))
}

impl FromValue for RowValues {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        match value {
            RowValues::Int(i) => Ok(*i),
            RowValues::Bool(b) => Ok(i64::from(*b)),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide)
            .map_err(|_| SqlRegistryError::Scan(format!("{wide} does not fit in i32")))
    }
}

impl FromValue for f64 {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        value.as_float().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl FromValue for String {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        match value {
            RowValues::Text(s) => Ok(s.clone()),
            RowValues::JSON(json) => Ok(json.to_string()),
            other => Err(mismatch("string", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        match value {
            RowValues::Blob(bytes) => Ok(bytes.clone()),
            RowValues::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(mismatch("bytes", other)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        value.as_timestamp().ok_or_else(|| mismatch("timestamp", value))
    }
}

impl FromValue for JsonValue {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        match value {
            RowValues::JSON(json) => Ok(json.clone()),
            RowValues::Text(s) => serde_json::from_str(s)
                .map_err(|e| SqlRegistryError::Scan(format!("invalid json: {e}"))),
            other => Err(mismatch("json", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &RowValues) -> Result<Self, SqlRegistryError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// The database engines a registry entry can point at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `SQLite` file (or `file:` URI)
    #[default]
    Sqlite,
    /// `PostgreSQL` server
    Postgres,
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::Sqlite => f.write_str("sqlite"),
            DatabaseType::Postgres => f.write_str("postgres"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_integers_read_as_bool() {
        assert!(bool::from_value(&RowValues::Int(1)).unwrap());
        assert!(!bool::from_value(&RowValues::Int(0)).unwrap());
        assert!(bool::from_value(&RowValues::Int(2)).is_err());
    }

    #[test]
    fn null_reads_as_none() {
        let value: Option<String> = FromValue::from_value(&RowValues::Null).unwrap();
        assert_eq!(value, None);
        let value: Option<i64> = FromValue::from_value(&RowValues::Int(3)).unwrap();
        assert_eq!(value, Some(3));
    }

    #[test]
    fn text_timestamps_parse() {
        let ts = NaiveDateTime::from_value(&RowValues::Text("2024-01-01 08:00:01".into())).unwrap();
        assert_eq!(ts.to_string(), "2024-01-01 08:00:01");
    }

    #[test]
    fn mismatch_names_both_types() {
        let err = i64::from_value(&RowValues::Text("x".into())).unwrap_err();
        assert_eq!(err.to_string(), "scan error: cannot read text column as i64");
    }

    #[test]
    fn i32_rejects_overflow() {
        assert!(i32::from_value(&RowValues::Int(i64::MAX)).is_err());
        assert_eq!(i32::from_value(&RowValues::Int(-4)).unwrap(), -4);
    }
}
