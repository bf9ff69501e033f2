//! Statement batch coordination.
//!
//! Pending operations are kept in the order the cascade walker produced
//! them. On flush they run in exactly that order; consecutive statements of
//! the same shape may share one round-trip when the executor supports it.
//!
//! Repeated operations on one identity within a transaction are coalesced
//! on enqueue:
//!
//! - an update after a pending update replaces it (moving to the later position)
//! - an update identical to the pending insert or update is dropped
//! - a delete after a pending insert cancels both, along with every link
//!   or linkage operation naming that identity
//! - a delete after a pending update replaces it
//! - a store after a pending delete replaces the delete
//! - link-row insert and delete of the same row cancel each other
//!
//! So storing, deleting, and storing again a new object flushes one INSERT.

use crate::locking::OptimisticLockManager;
use crate::operation::{OperationClass, PendingOperation, RowWrite};
use rowbroker_core::{
    Error, IllegalStateKind, Identity, Result, Statement, StatementExecutor, StatementKind,
    StoreErrorKind, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Counts of what a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Objects inserted.
    pub inserted: usize,
    /// Objects updated, plus collection members whose linkage was rewritten.
    pub updated: usize,
    /// Objects deleted.
    pub deleted: usize,
    /// Link-table rows inserted.
    pub linked: usize,
    /// Link-table rows deleted.
    pub unlinked: usize,
    /// Calls made to the executor.
    pub round_trips: usize,
}

impl FlushResult {
    /// Total number of operations flushed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }

    fn count(&mut self, op: &PendingOperation) {
        match (op.class, op.kind) {
            (OperationClass::LinkRow, StatementKind::Insert) => self.linked += 1,
            (OperationClass::LinkRow, _) => self.unlinked += 1,
            (_, StatementKind::Insert) => self.inserted += 1,
            (_, StatementKind::Update) => self.updated += 1,
            (_, StatementKind::Delete) => self.deleted += 1,
        }
    }
}

/// A successful flush: counts, the operations in the order they ran, and
/// the keys the store generated for provisional slots.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub result: FlushResult,
    pub completed: Vec<PendingOperation>,
    pub generated: HashMap<u64, Value>,
}

impl FlushOutcome {
    /// The final identity of an operation, replacing a provisional key with
    /// the generated one.
    pub fn resolve_identity(&self, identity: &Identity, generates: Option<(u64, &'static str)>) -> Identity {
        match generates.and_then(|(slot, _)| self.generated.get(&slot)) {
            Some(key) => Identity::new(identity.type_name(), vec![key.clone()]),
            None => identity.clone(),
        }
    }
}

/// Orders, coalesces, groups, and flushes pending operations.
#[derive(Debug)]
pub struct BatchCoordinator {
    pending: Vec<PendingOperation>,
    batching: bool,
    max_batch_size: usize,
    locks: OptimisticLockManager,
}

impl Default for BatchCoordinator {
    fn default() -> Self {
        Self::new(true, 500)
    }
}

impl BatchCoordinator {
    pub fn new(batching: bool, max_batch_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            batching,
            max_batch_size: max_batch_size.max(1),
            locks: OptimisticLockManager::new(),
        }
    }

    pub fn pending(&self) -> &[PendingOperation] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Is an insert of `identity` waiting to be flushed?
    pub fn has_pending_insert(&self, identity: &Identity) -> bool {
        self.pending_insert(identity).is_some()
    }

    /// The pending insert of `identity`, if any.
    pub fn pending_insert(&self, identity: &Identity) -> Option<&PendingOperation> {
        self.pending.iter().find(|op| {
            op.class == OperationClass::Object
                && op.kind == StatementKind::Insert
                && &op.identity == identity
        })
    }

    /// Is any object operation on `identity` waiting to be flushed?
    pub fn has_pending(&self, identity: &Identity) -> bool {
        self.pending
            .iter()
            .any(|op| op.class == OperationClass::Object && &op.identity == identity)
    }

    /// Add an operation, coalescing it with earlier ones on the same row.
    pub fn enqueue(&mut self, op: PendingOperation) {
        match op.class {
            OperationClass::Object => self.enqueue_object(op),
            OperationClass::Linkage => {
                // Only a rewrite of the same foreign key columns supersedes.
                self.remove_where(|p| {
                    p.class == OperationClass::Linkage
                        && p.identity == op.identity
                        && p.shapes().eq(op.shapes())
                });
                self.pending.push(op);
            }
            OperationClass::LinkRow => self.enqueue_link_row(op),
        }
    }

    fn enqueue_object(&mut self, op: PendingOperation) {
        let same = |p: &PendingOperation| p.class == OperationClass::Object && p.identity == op.identity;
        let has_insert = self
            .pending
            .iter()
            .any(|p| same(p) && p.kind == StatementKind::Insert);
        let last = self.pending.iter().rev().find(|p| same(p));

        match (op.kind, last.map(|p| p.kind)) {
            (_, None) => self.pending.push(op),
            (StatementKind::Delete, Some(StatementKind::Delete)) => {
                tracing::trace!(identity = %op.identity, "dropping repeated delete");
            }
            (StatementKind::Delete, Some(_)) if has_insert => {
                tracing::debug!(identity = %op.identity, "delete cancels pending insert");
                let identity = op.identity;
                self.remove_where(|p| p.mentions(&identity));
            }
            (StatementKind::Delete, Some(_)) => {
                self.remove_where(|p| same(p));
                self.pending.push(op);
            }
            (_, Some(StatementKind::Delete)) => {
                tracing::trace!(identity = %op.identity, "store replaces pending delete");
                self.remove_where(|p| same(p));
                self.pending.push(op);
            }
            (_, Some(_)) => {
                if last.is_some_and(|p| p.image == op.image) {
                    tracing::trace!(identity = %op.identity, "dropping unchanged store");
                    return;
                }
                self.remove_where(|p| same(p) && p.kind == StatementKind::Update);
                self.pending.push(op);
            }
        }
    }

    fn enqueue_link_row(&mut self, op: PendingOperation) {
        let earlier = self
            .pending
            .iter()
            .rposition(|p| p.class == OperationClass::LinkRow && p.identity == op.identity);
        match earlier {
            Some(idx) if self.pending[idx].kind == op.kind => {}
            Some(idx) => {
                tracing::trace!(link = %op.identity, "link insert and delete cancel");
                self.pending.remove(idx);
            }
            None => self.pending.push(op),
        }
    }

    fn remove_where(&mut self, pred: impl Fn(&PendingOperation) -> bool) {
        self.pending.retain(|p| !pred(p));
    }

    /// Drop every pending operation.
    pub fn discard(&mut self) -> usize {
        let n = self.pending.len();
        if n > 0 {
            tracing::warn!(count = n, "discarding pending operations");
        }
        self.pending.clear();
        n
    }

    /// Execute all pending operations through `executor`, in order.
    ///
    /// The first failure poisons the set: nothing stays pending and the
    /// error is returned for the session to abort on.
    #[tracing::instrument(level = "debug", skip(self, executor), fields(pending = self.pending.len()))]
    pub fn flush(&mut self, executor: &dyn StatementExecutor) -> Result<FlushOutcome> {
        let ops = std::mem::take(&mut self.pending);
        let start = std::time::Instant::now();
        let can_batch = self.batching && executor.supports_batching();

        let mut run = FlushRun {
            executor,
            locks: &self.locks,
            ops: &ops,
            max: if can_batch { self.max_batch_size } else { 1 },
            group: Vec::new(),
            generated: HashMap::new(),
            round_trips: 0,
        };

        for (op_idx, op) in ops.iter().enumerate() {
            for write in &op.writes {
                let mut values = run.resolve(write);
                if values.is_none() && !run.group.is_empty() {
                    // Depends on a key the current group has not produced yet.
                    run.execute_group()?;
                    values = run.resolve(write);
                }
                let Some(values) = values else {
                    return Err(Error::illegal_state(
                        IllegalStateKind::RollbackOnly,
                        format!("{op} depends on a generated key no earlier insert produces"),
                    ));
                };
                let joins = run
                    .group
                    .first()
                    .is_some_and(|(_, s)| s.shape == write.shape && run.group.len() < run.max);
                if !run.group.is_empty() && !joins {
                    run.execute_group()?;
                }
                run.group
                    .push((op_idx, Statement::new(Arc::clone(&write.shape), values)));
            }
        }
        run.execute_group()?;

        let mut result = FlushResult {
            round_trips: run.round_trips,
            ..FlushResult::default()
        };
        for op in &ops {
            result.count(op);
        }
        let generated = run.generated;
        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            linked = result.linked,
            unlinked = result.unlinked,
            round_trips = result.round_trips,
            "Flush complete"
        );
        Ok(FlushOutcome {
            result,
            completed: ops,
            generated,
        })
    }
}

struct FlushRun<'a> {
    executor: &'a dyn StatementExecutor,
    locks: &'a OptimisticLockManager,
    ops: &'a [PendingOperation],
    max: usize,
    group: Vec<(usize, Statement)>,
    generated: HashMap<u64, Value>,
    round_trips: usize,
}

impl FlushRun<'_> {
    /// Bound values of `write`, or `None` if a generated key is missing.
    fn resolve(&self, write: &RowWrite) -> Option<Vec<Value>> {
        write
            .values
            .iter()
            .map(|v| v.resolve(&self.generated))
            .collect()
    }

    fn execute_group(&mut self) -> Result<()> {
        if self.group.is_empty() {
            return Ok(());
        }
        let group = std::mem::take(&mut self.group);
        let statements: Vec<Statement> = group.iter().map(|(_, s)| s.clone()).collect();
        let sql = statements
            .first()
            .map(|s| s.shape.to_sql())
            .unwrap_or_default();
        tracing::trace!(sql = %sql, count = statements.len(), "executing statement group");
        self.round_trips += 1;
        let outcomes = self.executor.execute(&statements).map_err(|e| match e {
            Error::Store(inner) if inner.sql.is_none() => Error::Store(inner.with_sql(sql)),
            other => other,
        })?;
        if outcomes.len() != statements.len() {
            return Err(Error::store(
                StoreErrorKind::Statement,
                format!(
                    "executor returned {} outcomes for {} statements",
                    outcomes.len(),
                    statements.len()
                ),
            ));
        }

        for ((op_idx, stmt), outcome) in group.iter().zip(&outcomes) {
            let Some(op) = self.ops.get(*op_idx) else {
                continue;
            };
            if stmt.shape.lock_column.is_some() {
                self.locks.check_outcome(op, outcome)?;
            }
            if let (Some(_), Some((slot, _))) = (stmt.shape.generates_key, op.generates) {
                match &outcome.generated_key {
                    Some(key) => {
                        self.generated.insert(slot, key.clone());
                    }
                    None => {
                        return Err(Error::store(
                            StoreErrorKind::Statement,
                            format!("insert for {op} did not return a generated key"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
