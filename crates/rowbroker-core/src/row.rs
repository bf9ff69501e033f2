//! Stored row representation.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared across all rows fetched with the same layout.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();
        Self { name_to_index }
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }
}

/// A single row returned by a key lookup.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row from parallel column names and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(ColumnInfo::new(column_names)),
        }
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .index_of(name)
            .and_then(|i| self.values.get(i))
    }
}
