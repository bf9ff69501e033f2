//! Statement executor over a [`MemoryStore`].
//!
//! Each connection keeps its own undo log and statement log behind an
//! `Arc<Mutex<>>`, so clones of a connection share them. Hand one clone to
//! a session and keep another to inspect what was executed.

use crate::store::{MemoryStore, StoredRow, matches_row, same_value, to_row};
use rowbroker_core::{
    Error, Result, Row, Statement, StatementExecutor, StatementKind, StatementOutcome,
    StoreErrorKind, Value,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One executed statement, as recorded by the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub kind: StatementKind,
    pub table: &'static str,
    pub sql: String,
    pub values: Vec<Value>,
    pub rows_affected: u64,
}

/// How to reverse one write.
#[derive(Debug)]
enum Undo {
    Inserted { table: &'static str, row: StoredRow },
    Updated { table: &'static str, after: StoredRow, before: StoredRow },
    Deleted { table: &'static str, row: StoredRow },
}

#[derive(Debug, Default)]
struct ConnectionState {
    in_transaction: bool,
    undo: Vec<Undo>,
    executed: Vec<ExecutedStatement>,
    round_trips: usize,
    commits: usize,
    rollbacks: usize,
}

/// A connection to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    store: MemoryStore,
    state: Arc<Mutex<ConnectionState>>,
    batching: bool,
    unreachable_table: Option<&'static str>,
}

impl MemoryConnection {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(ConnectionState::default())),
            batching: true,
            unreachable_table: None,
        }
    }

    /// Whether `execute` accepts more than one statement per call.
    #[must_use]
    pub fn with_batching(mut self, batching: bool) -> Self {
        self.batching = batching;
        self
    }

    /// Fail every statement against `table` with a connectivity error.
    #[must_use]
    pub fn fail_on_table(mut self, table: &'static str) -> Self {
        self.unreachable_table = Some(table);
        self
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every statement executed so far, in order.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state().executed.clone()
    }

    /// `(kind, table)` of every executed statement, for order assertions.
    pub fn executed_kinds(&self) -> Vec<(StatementKind, &'static str)> {
        self.state()
            .executed
            .iter()
            .map(|s| (s.kind, s.table))
            .collect()
    }

    /// Number of `execute` calls made.
    pub fn round_trips(&self) -> usize {
        self.state().round_trips
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    pub fn in_transaction(&self) -> bool {
        self.state().in_transaction
    }

    /// Forget executed statements and counters.
    pub fn clear_log(&self) {
        let mut state = self.state();
        state.executed.clear();
        state.round_trips = 0;
        state.commits = 0;
        state.rollbacks = 0;
    }

    fn apply(&self, statement: &Statement) -> Result<(StatementOutcome, Option<Undo>)> {
        let shape = &*statement.shape;
        if self.unreachable_table == Some(shape.table) {
            return Err(Error::store(
                StoreErrorKind::Connectivity,
                format!("connection to {} lost", shape.table),
            ));
        }
        if statement.values.len() != shape.arity() {
            return Err(Error::store(
                StoreErrorKind::Statement,
                format!(
                    "{} binds {} values, expected {}",
                    shape.to_sql(),
                    statement.values.len(),
                    shape.arity()
                ),
            ));
        }

        let mut data = self.store.lock();
        let table = data.table_mut(shape.table)?;
        match shape.kind {
            StatementKind::Insert => {
                let mut row: StoredRow = shape
                    .columns
                    .iter()
                    .zip(statement.column_values())
                    .map(|(c, v)| ((*c).to_string(), v.clone()))
                    .collect();
                let generated_key = shape.generates_key.map(|column| {
                    let key = table.generate(column);
                    row.insert(column.to_string(), key.clone());
                    key
                });
                table.insert(shape.table, row.clone())?;
                Ok((
                    StatementOutcome {
                        rows_affected: 1,
                        generated_key,
                    },
                    Some(Undo::Inserted {
                        table: shape.table,
                        row,
                    }),
                ))
            }
            StatementKind::Update | StatementKind::Delete => {
                let key_values = statement.key_values();
                let expected = statement.expected_lock();
                let found = table.rows.iter().position(|row| {
                    matches_row(row, &shape.key_columns, key_values)
                        && match (shape.lock_column, expected) {
                            (Some(column), Some(token)) => row
                                .get(column)
                                .is_some_and(|stored| same_value(stored, token)),
                            _ => true,
                        }
                });
                let Some(idx) = found else {
                    return Ok((StatementOutcome::affected(0), None));
                };
                if shape.kind == StatementKind::Delete {
                    let row = table.rows.remove(idx);
                    return Ok((
                        StatementOutcome::affected(1),
                        Some(Undo::Deleted {
                            table: shape.table,
                            row,
                        }),
                    ));
                }
                let before = table.rows[idx].clone();
                for (column, value) in shape.columns.iter().zip(statement.column_values()) {
                    table.rows[idx].insert((*column).to_string(), value.clone());
                }
                Ok((
                    StatementOutcome::affected(1),
                    Some(Undo::Updated {
                        table: shape.table,
                        after: table.rows[idx].clone(),
                        before,
                    }),
                ))
            }
        }
    }

    fn undo(&self, undo: Undo) {
        let mut data = self.store.lock();
        match undo {
            Undo::Inserted { table, row } => {
                if let Some(t) = data.tables.get_mut(table) {
                    if let Some(idx) = t.rows.iter().position(|r| *r == row) {
                        t.rows.remove(idx);
                    }
                }
            }
            Undo::Updated {
                table,
                after,
                before,
            } => {
                if let Some(t) = data.tables.get_mut(table) {
                    if let Some(r) = t.rows.iter_mut().find(|r| **r == after) {
                        *r = before;
                    }
                }
            }
            Undo::Deleted { table, row } => {
                if let Some(t) = data.tables.get_mut(table) {
                    t.rows.push(row);
                }
            }
        }
    }
}

impl StatementExecutor for MemoryConnection {
    fn execute(&self, batch: &[Statement]) -> Result<Vec<StatementOutcome>> {
        if batch.len() > 1 && !self.batching {
            return Err(Error::store(
                StoreErrorKind::Statement,
                format!("connection does not batch, got {} statements", batch.len()),
            ));
        }
        self.state().round_trips += 1;

        let mut outcomes = Vec::with_capacity(batch.len());
        for statement in batch {
            let (outcome, undo) = self.apply(statement)?;
            tracing::trace!(
                sql = %statement.shape.to_sql(),
                rows_affected = outcome.rows_affected,
                "executed"
            );
            let mut state = self.state();
            state.executed.push(ExecutedStatement {
                kind: statement.shape.kind,
                table: statement.shape.table,
                sql: statement.shape.to_sql(),
                values: statement.values.clone(),
                rows_affected: outcome.rows_affected,
            });
            if let Some(undo) = undo {
                if state.in_transaction {
                    state.undo.push(undo);
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn supports_batching(&self) -> bool {
        self.batching
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state();
        if state.in_transaction {
            return Err(Error::store(
                StoreErrorKind::Statement,
                "cannot start a transaction within a transaction",
            ));
        }
        state.in_transaction = true;
        state.undo.clear();
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state();
        if !state.in_transaction {
            return Err(Error::store(
                StoreErrorKind::Statement,
                "cannot commit - no transaction is active",
            ));
        }
        state.in_transaction = false;
        state.undo.clear();
        state.commits += 1;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let undo = {
            let mut state = self.state();
            state.in_transaction = false;
            state.rollbacks += 1;
            std::mem::take(&mut state.undo)
        };
        tracing::debug!(writes = undo.len(), "rolling back");
        for entry in undo.into_iter().rev() {
            self.undo(entry);
        }
        Ok(())
    }

    fn select_by_key(&self, table: &str, key_columns: &[&str], key: &[Value]) -> Result<Option<Row>> {
        let data = self.store.lock();
        let t = data.table(table)?;
        Ok(t.position(key_columns, key).map(|idx| to_row(&t.rows[idx])))
    }

    fn select_keys(
        &self,
        table: &str,
        filter_columns: &[&str],
        filter: &[Value],
        key_columns: &[&str],
    ) -> Result<Vec<Vec<Value>>> {
        let data = self.store.lock();
        let t = data.table(table)?;
        Ok(t.rows
            .iter()
            .filter(|row| matches_row(row, filter_columns, filter))
            .map(|row| {
                key_columns
                    .iter()
                    .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }
}
