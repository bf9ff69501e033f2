//! Planned row operations awaiting flush.

use rowbroker_core::{EntityHandle, Identity, StatementKind, StatementShape, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A statement input that may not be known until an earlier insert runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Value(Value),
    /// Key the store generates for the insert owning provisional `slot`.
    GeneratedKey { slot: u64 },
}

impl BoundValue {
    /// Resolve against the keys generated so far.
    pub fn resolve(&self, generated: &HashMap<u64, Value>) -> Option<Value> {
        match self {
            BoundValue::Value(v) => Some(v.clone()),
            BoundValue::GeneratedKey { slot } => generated.get(slot).cloned(),
        }
    }

    pub fn slot(&self) -> Option<u64> {
        match self {
            BoundValue::GeneratedKey { slot } => Some(*slot),
            BoundValue::Value(_) => None,
        }
    }
}

impl From<Value> for BoundValue {
    fn from(v: Value) -> Self {
        BoundValue::Value(v)
    }
}

/// One statement's worth of an operation: a shape and its ordered inputs.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub shape: Arc<StatementShape>,
    pub values: Vec<BoundValue>,
}

impl RowWrite {
    pub fn new(shape: StatementShape, values: Vec<BoundValue>) -> Self {
        Self {
            shape: Arc::new(shape),
            values,
        }
    }

    /// Provisional slots this write needs resolved before it can run.
    pub fn pending_slots(&self) -> impl Iterator<Item = u64> + '_ {
        self.values.iter().filter_map(BoundValue::slot)
    }
}

/// What an operation writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// The object's own row(s).
    Object,
    /// Foreign key columns of a collection member, written on the owner's behalf.
    Linkage,
    /// A row of a many-to-many link table.
    LinkRow,
}

/// Lock token check and advance carried by an update or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct LockStamp {
    pub field: &'static str,
    /// Token read by the writer; the row must still carry it.
    pub expected: Value,
    /// Token written by an update, applied to the object after commit.
    pub next: Value,
}

/// Link-table membership change, applied to cached snapshots after commit.
#[derive(Debug, Clone)]
pub struct LinkChange {
    pub owner: Identity,
    pub owner_type: &'static str,
    pub edge: &'static str,
    pub member: Identity,
}

/// A planned insert, update, or delete of one logical row.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub kind: StatementKind,
    pub identity: Identity,
    pub class: OperationClass,
    /// Statements in execution order (one per table segment).
    pub writes: Vec<RowWrite>,
    pub lock: Option<LockStamp>,
    /// Object the operation was planned from.
    pub target: Option<EntityHandle>,
    /// Provisional slot this insert resolves, with the key field to fill.
    pub generates: Option<(u64, &'static str)>,
    /// Fields of `target` to fill with generated keys after flush.
    pub deferred: Vec<(&'static str, u64)>,
    /// Field values written, used to drop repeated identical updates.
    pub image: Vec<(&'static str, BoundValue)>,
    /// Other identities this operation names (owners, link members).
    pub depends_on: Vec<Identity>,
    pub link: Option<LinkChange>,
}

impl PendingOperation {
    pub fn new(kind: StatementKind, identity: Identity, class: OperationClass) -> Self {
        Self {
            kind,
            identity,
            class,
            writes: Vec::new(),
            lock: None,
            target: None,
            generates: None,
            deferred: Vec::new(),
            image: Vec::new(),
            depends_on: Vec::new(),
            link: None,
        }
    }

    #[must_use]
    pub fn with_write(mut self, write: RowWrite) -> Self {
        self.writes.push(write);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: EntityHandle) -> Self {
        self.target = Some(target);
        self
    }

    /// Does this operation name `identity` as itself or a dependency?
    pub fn mentions(&self, identity: &Identity) -> bool {
        &self.identity == identity || self.depends_on.contains(identity)
    }

    /// Statement shapes written, in order.
    pub fn shapes(&self) -> impl Iterator<Item = &StatementShape> {
        self.writes.iter().map(|w| &*w.shape)
    }

    /// Tables written, in order. Handy in logs and assertions.
    pub fn tables(&self) -> Vec<&'static str> {
        self.writes.iter().map(|w| w.shape.table).collect()
    }
}

impl std::fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.class {
            OperationClass::Object => write!(f, "{} {}", self.kind, self.identity),
            OperationClass::Linkage => write!(f, "{} linkage of {}", self.kind, self.identity),
            OperationClass::LinkRow => write!(f, "{} link {}", self.kind, self.identity),
        }
    }
}
