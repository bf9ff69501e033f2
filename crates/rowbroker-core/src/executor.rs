//! Statements and the external collaborators that run them.

use crate::descriptor::DescriptorLookup;
use crate::error::Result;
use crate::identifiers::quote_ident;
use crate::row::Row;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Kind of row-level write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything about a statement except its bound values.
///
/// Two statements with equal shapes can share one batched round-trip.
/// Bound values are ordered as follows:
///
/// - insert: `columns`
/// - update: `columns`, then `key_columns`, then the expected lock token
/// - delete: `key_columns`, then the expected lock token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementShape {
    pub kind: StatementKind,
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub key_columns: Vec<&'static str>,
    /// Column compared against the expected token in the WHERE clause.
    pub lock_column: Option<&'static str>,
    /// Key column the store fills in on insert.
    pub generates_key: Option<&'static str>,
}

impl StatementShape {
    pub fn insert(table: &'static str, columns: Vec<&'static str>) -> Self {
        Self {
            kind: StatementKind::Insert,
            table,
            columns,
            key_columns: Vec::new(),
            lock_column: None,
            generates_key: None,
        }
    }

    pub fn update(
        table: &'static str,
        columns: Vec<&'static str>,
        key_columns: Vec<&'static str>,
    ) -> Self {
        Self {
            kind: StatementKind::Update,
            table,
            columns,
            key_columns,
            lock_column: None,
            generates_key: None,
        }
    }

    pub fn delete(table: &'static str, key_columns: Vec<&'static str>) -> Self {
        Self {
            kind: StatementKind::Delete,
            table,
            columns: Vec::new(),
            key_columns,
            lock_column: None,
            generates_key: None,
        }
    }

    #[must_use]
    pub fn with_lock(mut self, column: &'static str) -> Self {
        self.lock_column = Some(column);
        self
    }

    #[must_use]
    pub fn with_generated_key(mut self, column: &'static str) -> Self {
        self.generates_key = Some(column);
        self
    }

    /// Number of values a statement of this shape binds.
    pub fn arity(&self) -> usize {
        let lock = usize::from(self.lock_column.is_some());
        match self.kind {
            StatementKind::Insert => self.columns.len(),
            StatementKind::Update => self.columns.len() + self.key_columns.len() + lock,
            StatementKind::Delete => self.key_columns.len() + lock,
        }
    }

    /// Render as ANSI SQL with `?` placeholders.
    pub fn to_sql(&self) -> String {
        let table = quote_ident(self.table);
        let mut conditions: Vec<String> = self
            .key_columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect();
        if let Some(lock) = self.lock_column {
            conditions.push(format!("{} = ?", quote_ident(lock)));
        }
        match self.kind {
            StatementKind::Insert => {
                let cols: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
                let placeholders = vec!["?"; self.columns.len()].join(", ");
                format!(
                    "INSERT INTO {table} ({}) VALUES ({placeholders})",
                    cols.join(", ")
                )
            }
            StatementKind::Update => {
                let sets: Vec<String> = self
                    .columns
                    .iter()
                    .map(|c| format!("{} = ?", quote_ident(c)))
                    .collect();
                format!(
                    "UPDATE {table} SET {} WHERE {}",
                    sets.join(", "),
                    conditions.join(" AND ")
                )
            }
            StatementKind::Delete => {
                format!("DELETE FROM {table} WHERE {}", conditions.join(" AND "))
            }
        }
    }
}

/// One statement ready for the executor.
#[derive(Debug, Clone)]
pub struct Statement {
    pub shape: Arc<StatementShape>,
    pub values: Vec<Value>,
}

impl Statement {
    pub fn new(shape: Arc<StatementShape>, values: Vec<Value>) -> Self {
        Self { shape, values }
    }

    /// Values written to `shape.columns` (insert and update).
    pub fn column_values(&self) -> &[Value] {
        match self.shape.kind {
            StatementKind::Insert | StatementKind::Update => {
                &self.values[..self.shape.columns.len().min(self.values.len())]
            }
            StatementKind::Delete => &[],
        }
    }

    /// Values matched against `shape.key_columns` (update and delete).
    pub fn key_values(&self) -> &[Value] {
        let start = match self.shape.kind {
            StatementKind::Insert => return &[],
            StatementKind::Update => self.shape.columns.len(),
            StatementKind::Delete => 0,
        };
        let end = (start + self.shape.key_columns.len()).min(self.values.len());
        &self.values[start.min(end)..end]
    }

    /// The lock token the row must still carry for the write to apply.
    pub fn expected_lock(&self) -> Option<&Value> {
        if self.shape.lock_column.is_some() && self.shape.kind != StatementKind::Insert {
            self.values.last()
        } else {
            None
        }
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutcome {
    pub rows_affected: u64,
    /// Value of `shape.generates_key` assigned by the store.
    pub generated_key: Option<Value>,
}

impl StatementOutcome {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_key: None,
        }
    }
}

/// Runs statements against the underlying store.
///
/// All statements passed to one `execute` call share a shape; executors
/// that cannot batch are only ever handed one statement at a time.
pub trait StatementExecutor: Send + Sync {
    /// Execute statements in order, returning one outcome per statement.
    fn execute(&self, batch: &[Statement]) -> Result<Vec<StatementOutcome>>;

    /// Can `execute` take more than one statement per round-trip?
    fn supports_batching(&self) -> bool {
        false
    }

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Fetch one row of `table` by key. The row carries every stored column.
    fn select_by_key(&self, table: &str, key_columns: &[&str], key: &[Value])
    -> Result<Option<Row>>;

    /// Values of `key_columns` for every row whose `filter_columns` equal `filter`.
    fn select_keys(
        &self,
        table: &str,
        filter_columns: &[&str],
        filter: &[Value],
        key_columns: &[&str],
    ) -> Result<Vec<Vec<Value>>>;
}

/// Produces primary key values for `KeyGeneration::Sequence` fields.
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self, type_name: &str, field: &str) -> Result<Value>;
}

/// Read-only context shared by every session: metadata and key source.
#[derive(Clone)]
pub struct BrokerContext {
    pub lookup: Arc<dyn DescriptorLookup>,
    pub keys: Option<Arc<dyn KeyGenerator>>,
}

impl BrokerContext {
    pub fn new(lookup: Arc<dyn DescriptorLookup>) -> Self {
        Self { lookup, keys: None }
    }

    #[must_use]
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = Some(keys);
        self
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerContext")
            .field("keys", &self.keys.is_some())
            .finish_non_exhaustive()
    }
}
