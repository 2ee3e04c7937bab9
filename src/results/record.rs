use std::sync::Arc;

use crate::error::SqlRegistryError;
use crate::types::{FromValue, RowValues};

/// A row from a database query result
///
/// Column names are shared by every record produced from the same cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<Vec<String>>,
    values: Vec<RowValues>,
}

impl Record {
    #[must_use]
    pub fn new(columns: Arc<Vec<String>>, values: Vec<RowValues>) -> Self {
        Self { columns, values }
    }

    /// Get the index of a column by name
    #[must_use]
    pub fn column_index(&self, column_name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col == column_name)
    }

    /// Get a value from the row by column name
    ///
    /// # Returns
    ///
    /// The value at the column, or None if the column wasn't found
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.column_index(column_name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get a value from the row by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.values.get(index)
    }

    /// Typed lookup by column name.
    ///
    /// # Errors
    /// Returns [`SqlRegistryError::Scan`] if the column is missing or has an incompatible type.
    pub fn try_get<T: FromValue>(&self, column_name: &str) -> Result<T, SqlRegistryError> {
        let value = self
            .get(column_name)
            .ok_or_else(|| SqlRegistryError::Scan(format!("no column named `{column_name}`")))?;
        T::from_value(value)
    }

    /// Typed lookup by position.
    ///
    /// # Errors
    /// Returns [`SqlRegistryError::Scan`] if the index is out of range or the type is incompatible.
    pub fn try_get_index<T: FromValue>(&self, index: usize) -> Result<T, SqlRegistryError> {
        let value = self.values.get(index).ok_or_else(|| {
            SqlRegistryError::Scan(format!(
                "column index {index} out of range for {} columns",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[RowValues] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<RowValues> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::new(
            Arc::new(vec!["id".into(), "name".into(), "note".into()]),
            vec![
                RowValues::Int(1),
                RowValues::Text("alice".into()),
                RowValues::Null,
            ],
        )
    }

    #[test]
    fn lookup_by_name_and_index() {
        let record = sample();
        assert_eq!(record.get("name"), Some(&RowValues::Text("alice".into())));
        assert_eq!(record.get_by_index(0), Some(&RowValues::Int(1)));
        assert!(record.get("missing").is_none());
        assert_eq!(record.len(), 3);
    }

    #[test]
    fn typed_lookup() {
        let record = sample();
        let id: i64 = record.try_get("id").unwrap();
        let note: Option<String> = record.try_get("note").unwrap();
        assert_eq!(id, 1);
        assert!(note.is_none());
        assert!(record.try_get::<i64>("name").is_err());
        assert!(record.try_get_index::<i64>(9).is_err());
    }
}
