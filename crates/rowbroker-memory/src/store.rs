//! Shared in-memory tables.

use crate::connection::MemoryConnection;
use rowbroker_core::{Error, Result, Row, StoreErrorKind, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) type StoredRow = BTreeMap<String, Value>;

/// Key and lock comparison: integer widths are not significant.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    a.canonical().same_as(&b.canonical())
}

#[derive(Debug, Default)]
pub(crate) struct Table {
    pub(crate) key_columns: Vec<String>,
    pub(crate) rows: Vec<StoredRow>,
    /// Next value handed out for a store-generated key.
    next_generated: i64,
}

impl Table {
    fn new(key_columns: &[&str]) -> Self {
        Self {
            key_columns: key_columns.iter().map(|c| (*c).to_string()).collect(),
            rows: Vec::new(),
            next_generated: 1,
        }
    }

    /// Position of the row whose `columns` equal `values`.
    pub(crate) fn position(&self, columns: &[&str], values: &[Value]) -> Option<usize> {
        self.rows.iter().position(|row| matches_row(row, columns, values))
    }

    pub(crate) fn key_of(&self, row: &StoredRow) -> Vec<Value> {
        self.key_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Take the next generated key for `column`, skipping values already used.
    pub(crate) fn generate(&mut self, column: &str) -> Value {
        let used = self
            .rows
            .iter()
            .filter_map(|r| r.get(column).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        let next = self.next_generated.max(used.saturating_add(1));
        self.next_generated = next.saturating_add(1);
        Value::BigInt(next)
    }

    /// Add a row, enforcing key uniqueness.
    pub(crate) fn insert(&mut self, table: &str, row: StoredRow) -> Result<()> {
        if !self.key_columns.is_empty() {
            let key = self.key_of(&row);
            let columns: Vec<&str> = self.key_columns.iter().map(String::as_str).collect();
            if self.position(&columns, &key).is_some() {
                return Err(Error::store(
                    StoreErrorKind::Constraint,
                    format!(
                        "UNIQUE constraint failed: {table}.{}",
                        self.key_columns.join(", ")
                    ),
                ));
            }
        }
        self.rows.push(row);
        Ok(())
    }
}

pub(crate) fn matches_row(row: &StoredRow, columns: &[&str], values: &[Value]) -> bool {
    columns.len() == values.len()
        && columns.iter().zip(values).all(|(column, value)| {
            row.get(*column)
                .is_some_and(|stored| !stored.is_null() && same_value(stored, value))
        })
}

pub(crate) fn to_row(row: &StoredRow) -> Row {
    let (names, values): (Vec<String>, Vec<Value>) =
        row.iter().map(|(k, v)| (k.clone(), v.clone())).unzip();
    Row::new(names, values)
}

#[derive(Debug, Default)]
pub(crate) struct StoreData {
    pub(crate) tables: HashMap<String, Table>,
}

impl StoreData {
    pub(crate) fn table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| no_such_table(name))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| no_such_table(name))
    }
}

fn no_such_table(name: &str) -> Error {
    Error::store(StoreErrorKind::Statement, format!("no such table: {name}"))
}

/// A set of in-memory tables shared by every connection made from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) `table`, unique on `key_columns`.
    ///
    /// A table with no key columns accepts duplicate rows.
    pub fn define_table(&self, table: &str, key_columns: &[&str]) {
        tracing::debug!(table, ?key_columns, "defining table");
        self.lock()
            .tables
            .insert(table.to_string(), Table::new(key_columns));
    }

    /// Insert a row directly, outside any transaction.
    pub fn seed(&self, table: &str, row: Vec<(&str, Value)>) -> Result<()> {
        let row: StoredRow = row
            .into_iter()
            .map(|(column, value)| (column.to_string(), value))
            .collect();
        self.lock().table_mut(table)?.insert(table, row)
    }

    /// Set one column of the row keyed by `key`, outside any transaction.
    ///
    /// Returns `false` if there is no such row.
    pub fn set_column(&self, table: &str, key: &[Value], column: &str, value: Value) -> Result<bool> {
        let mut data = self.lock();
        let t = data.table_mut(table)?;
        let columns: Vec<String> = t.key_columns.clone();
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let Some(idx) = t.position(&columns, key) else {
            return Ok(false);
        };
        t.rows[idx].insert(column.to_string(), value);
        Ok(true)
    }

    /// The row of `table` keyed by `key`.
    pub fn get(&self, table: &str, key: &[Value]) -> Option<Row> {
        let data = self.lock();
        let t = data.tables.get(table)?;
        let columns: Vec<&str> = t.key_columns.iter().map(String::as_str).collect();
        t.position(&columns, key).map(|idx| to_row(&t.rows[idx]))
    }

    /// Every row of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(to_row).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Open a connection executing against this store.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection::new(self.clone())
    }
}
