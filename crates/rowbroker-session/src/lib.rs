//! Transaction session for rowbroker.
//!
//! `rowbroker-session` is the **unit-of-work layer**. A [`Session`] owns one
//! object cache, one batch coordinator and one executor connection, and
//! drives them through a transaction:
//!
//! - **Identity map**: one in-memory object per identity for the lifetime of
//!   the session.
//! - **Cascade planning**: `store` and `delete` expand into ordered row
//!   operations following each edge's cascade policy.
//! - **Optimistic locking**: updates and deletes compare-and-swap the row's
//!   lock token; a stale token surfaces as `OptimisticLock` at commit.
//! - **Deferred writes**: nothing is written until `commit`, which flushes
//!   everything in dependency order and then commits the store transaction.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(context, Arc::new(store.connect()));
//! session.begin()?;
//! session.store(&parent)?;
//! let result = session.commit()?;
//! assert_eq!(result.inserted, 2);
//! ```
//!
//! Sessions are single-owner and synchronous. Concurrency comes from several
//! sessions sharing one store, each with its own cache.

pub mod batch;
pub mod cache;
pub mod cascade;
pub mod loader;
pub mod locking;
pub mod operation;

pub use batch::{BatchCoordinator, FlushOutcome, FlushResult};
pub use cache::{CacheEntry, ObjectCache};
pub use cascade::{CascadeOperation, CascadeWalker, PlanState};
pub use loader::SessionLoader;
pub use locking::{OptimisticLockManager, now_micros};
pub use operation::{
    BoundValue, LinkChange, LockStamp, OperationClass, PendingOperation, RowWrite,
};

use rowbroker_core::{
    BrokerContext, EdgeKind, EntityHandle, EntityRef, Error, Identity, IllegalStateKind,
    ProxySeed, Result, SessionHandle, StatementExecutor, StatementKind, Value, identity_of,
    read_entity, write_entity,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Callbacks receive no arguments; returning `Err` from a before-flush
/// callback aborts the commit.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_abort: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_abort", &self.after_abort.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterAbort => &mut self.after_abort,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired at the start of commit, before anything is written.
    BeforeFlush,
    /// Fired after the store transaction committed and the cache is updated.
    AfterCommit,
    /// Fired after pending work was discarded and the store rolled back.
    AfterAbort,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Drop every cached object after each successful commit.
    pub clear_cache_on_commit: bool,
    /// Group consecutive same-shape statements when the executor can batch.
    pub batch_statements: bool,
    /// Most statements sent in one grouped round-trip.
    pub max_batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clear_cache_on_commit: false,
            batch_statements: true,
            max_batch_size: 500,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn clear_cache_on_commit(mut self, value: bool) -> Self {
        self.clear_cache_on_commit = value;
        self
    }

    #[must_use]
    pub fn batch_statements(mut self, value: bool) -> Self {
        self.batch_statements = value;
        self
    }

    #[must_use]
    pub fn max_batch_size(mut self, value: usize) -> Self {
        self.max_batch_size = value;
        self
    }
}

/// Where a session is in its transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Committing,
    Aborting,
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work: cache, planner, and coordinator over one executor.
pub struct Session {
    executor: Arc<dyn StatementExecutor>,
    loader: Arc<SessionLoader>,
    coordinator: BatchCoordinator,
    plan: PlanState,
    locks: OptimisticLockManager,
    state: SessionState,
    /// Set when planning failed; the transaction can only be aborted.
    rollback_only: bool,
    config: SessionConfig,
    event_callbacks: SessionEventCallbacks,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("rollback_only", &self.rollback_only)
            .field("pending", &self.coordinator.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over `executor`, using the metadata in `context`.
    pub fn new(context: BrokerContext, executor: Arc<dyn StatementExecutor>) -> Self {
        Self::with_config(context, executor, SessionConfig::default())
    }

    pub fn with_config(
        context: BrokerContext,
        executor: Arc<dyn StatementExecutor>,
        config: SessionConfig,
    ) -> Self {
        let loader = SessionLoader::new(context, Arc::clone(&executor));
        Self {
            executor,
            loader,
            coordinator: BatchCoordinator::new(config.batch_statements, config.max_batch_size),
            plan: PlanState::new(),
            locks: OptimisticLockManager::new(),
            state: SessionState::Idle,
            rollback_only: false,
            config,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Replace the lock manager, e.g. to pin the clock for timestamp tokens.
    #[must_use]
    pub fn with_lock_manager(mut self, locks: OptimisticLockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Operations planned but not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.coordinator.len()
    }

    pub fn pending(&self) -> &[PendingOperation] {
        self.coordinator.pending()
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before commit writes anything.
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_abort(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_abort.push(Box::new(f));
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    /// Start a transaction. Only valid while idle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn begin(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::illegal_state(
                IllegalStateKind::NestedBegin,
                format!("begin called in state {:?}", self.state),
            ));
        }
        self.executor.begin()?;
        self.state = SessionState::Active;
        self.rollback_only = false;
        tracing::debug!("Transaction started");
        Ok(())
    }

    /// Plan storing `entity` and whatever its store cascades reach.
    ///
    /// Nothing is written until [`commit`](Self::commit).
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn store(&mut self, entity: &EntityHandle) -> Result<()> {
        self.plan_operation(entity, CascadeOperation::Store)
    }

    /// Plan deleting `entity` and whatever its delete cascades reach.
    #[tracing::instrument(level = "debug", skip(self, entity))]
    pub fn delete(&mut self, entity: &EntityHandle) -> Result<()> {
        self.plan_operation(entity, CascadeOperation::Delete)
    }

    fn plan_operation(&mut self, entity: &EntityHandle, operation: CascadeOperation) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(Error::illegal_state(
                IllegalStateKind::NotActive,
                format!("{operation:?} requires an active transaction"),
            ));
        }
        if self.rollback_only {
            return Err(Error::illegal_state(
                IllegalStateKind::RollbackOnly,
                "an earlier operation failed; the transaction can only be aborted",
            ));
        }

        let mut visited = HashSet::new();
        let walker = CascadeWalker::new(&self.loader, &self.locks, &self.coordinator, &mut self.plan);
        match walker.plan(entity, operation, &mut visited) {
            Ok(ops) => {
                let planned = ops.len();
                for op in ops {
                    self.coordinator.enqueue(op);
                }
                tracing::debug!(planned, pending = self.coordinator.len(), "Operations queued");
                Ok(())
            }
            Err(e) => {
                self.rollback_only = true;
                tracing::warn!(error = %e, "planning failed, transaction marked rollback-only");
                Err(e)
            }
        }
    }

    /// Flush every pending operation and commit the store transaction.
    ///
    /// Any failure aborts the transaction: pending work is discarded, the
    /// store is rolled back, and the error is returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<FlushResult> {
        if self.state != SessionState::Active {
            return Err(Error::illegal_state(
                IllegalStateKind::NotActive,
                "commit requires an active transaction",
            ));
        }
        if self.rollback_only {
            self.abort_quietly();
            return Err(Error::illegal_state(
                IllegalStateKind::RollbackOnly,
                "transaction was marked rollback-only and has been aborted",
            ));
        }
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            self.abort_quietly();
            return Err(e);
        }

        self.state = SessionState::Committing;
        let start = std::time::Instant::now();
        let outcome = match self.coordinator.flush(&*self.executor) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "flush failed, aborting");
                self.abort_quietly();
                return Err(e);
            }
        };
        if let Err(e) = self.executor.commit() {
            tracing::warn!(error = %e, "store commit failed, aborting");
            self.abort_quietly();
            return Err(e);
        }

        let applied = self.apply(&outcome);
        if self.config.clear_cache_on_commit {
            self.loader.cache().clear();
        }
        self.plan.clear();
        self.state = SessionState::Idle;
        applied?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            total = outcome.result.total(),
            round_trips = outcome.result.round_trips,
            "Transaction committed"
        );
        self.event_callbacks.fire(SessionEvent::AfterCommit)?;
        Ok(outcome.result)
    }

    /// Discard pending work and roll back the store transaction.
    ///
    /// Field values the caller changed in memory are not restored.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn abort(&mut self) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(Error::illegal_state(
                IllegalStateKind::NotActive,
                "abort requires an active transaction",
            ));
        }
        self.abort_inner()
    }

    fn abort_inner(&mut self) -> Result<()> {
        self.state = SessionState::Aborting;
        let discarded = self.coordinator.discard();
        self.plan.clear();
        let rolled_back = self.executor.rollback();
        self.state = SessionState::Idle;
        self.rollback_only = false;
        tracing::info!(discarded, "Transaction aborted");
        let fired = self.event_callbacks.fire(SessionEvent::AfterAbort);
        rolled_back.and(fired)
    }

    /// Abort on a failure path, keeping the original error for the caller.
    fn abort_quietly(&mut self) {
        if let Err(e) = self.abort_inner() {
            tracing::warn!(error = %e, "rollback after failure also failed");
        }
    }

    /// Bring the cache in line with what was just committed.
    fn apply(&self, outcome: &FlushOutcome) -> Result<()> {
        let loader = Arc::clone(&self.loader);
        let lookup = &*loader.context().lookup;
        let mut resolved: HashMap<Identity, Identity> = HashMap::new();

        for op in &outcome.completed {
            if let Some(target) = &op.target {
                if let Some((slot, field)) = op.generates {
                    if let Some(key) = outcome.generated.get(&slot) {
                        write_entity(target).set_field(field, key.clone())?;
                        resolved.insert(
                            op.identity.clone(),
                            outcome.resolve_identity(&op.identity, op.generates),
                        );
                    }
                }
                for (field, slot) in &op.deferred {
                    if let Some(key) = outcome.generated.get(slot) {
                        write_entity(target).set_field(field, key.clone())?;
                    }
                }
            }
            let resolve = |id: &Identity| resolved.get(id).cloned().unwrap_or_else(|| id.clone());
            let identity = resolve(&op.identity);

            match (op.class, op.kind) {
                (OperationClass::Object, StatementKind::Insert | StatementKind::Update) => {
                    let Some(target) = &op.target else { continue };
                    if let Some(stamp) = &op.lock {
                        write_entity(target).set_field(stamp.field, stamp.next.clone())?;
                    }
                    let type_name = read_entity(target).entity_type();
                    let token = match lookup.lock_field(type_name)? {
                        Some(field) => Some(read_entity(target).field(field.name)?),
                        None => None,
                    };
                    let mut cache = loader.cache();
                    cache.put(identity.clone(), Arc::clone(target));
                    cache.set_lock_snapshot(&identity, token);
                    if op.kind == StatementKind::Insert {
                        for edge in lookup.edges_of(type_name)? {
                            let unread = cache.link_snapshot(&identity, edge.name).is_none();
                            if edge.link_table().is_some() && unread {
                                cache.set_link_snapshot(&identity, edge.name, Vec::new());
                            }
                        }
                    }
                }
                (OperationClass::Object, StatementKind::Delete) => {
                    loader.cache().remove(&identity);
                }
                (OperationClass::LinkRow, kind) => {
                    let Some(change) = &op.link else { continue };
                    let present = kind == StatementKind::Insert;
                    let owner = resolve(&change.owner);
                    let member = resolve(&change.member);
                    let link = lookup
                        .edge_of(change.owner_type, change.edge)?
                        .link_table()
                        .copied();
                    let mut cache = loader.cache();
                    if cache.link_snapshot(&owner, change.edge).is_some() {
                        cache.update_link_snapshot(&owner, change.edge, &member, present);
                    }
                    let member_type = cache
                        .lookup(&member)
                        .map(|h| read_entity(&h).entity_type());
                    let Some((link, member_type)) = link.zip(member_type) else {
                        continue;
                    };
                    for edge in lookup.edges_of(member_type)? {
                        let EdgeKind::ManyToMany(reverse) = &edge.kind else {
                            continue;
                        };
                        let mirrors = reverse.table == link.table
                            && reverse.owner_columns == link.target_columns;
                        if mirrors && cache.link_snapshot(&member, edge.name).is_some() {
                            cache.update_link_snapshot(&member, edge.name, &owner, present);
                        }
                    }
                }
                (OperationClass::Linkage, _) => {}
            }
        }
        Ok(())
    }

    // ========================================================================
    // Reads and cache control
    // ========================================================================

    /// Fetch an object by type and key through the identity map.
    ///
    /// Returns `None` if no such row exists or the row belongs to a type
    /// outside `type_name`'s extent.
    #[tracing::instrument(level = "debug", skip(self, key))]
    pub fn get(&self, type_name: &str, key: Vec<Value>) -> Result<Option<EntityHandle>> {
        self.loader.get(type_name, key)
    }

    /// Fetch `identity`, failing with `DanglingReference` if it does not exist.
    pub fn materialize(&self, identity: &Identity) -> Result<EntityHandle> {
        self.loader
            .load(identity)?
            .ok_or_else(|| Error::dangling(identity.clone()))
    }

    /// A lazy reference to `type_name` with `key`. Nothing is read until the
    /// reference is first accessed.
    pub fn reference(&self, type_name: &str, key: Vec<Value>) -> Result<EntityRef> {
        let root = self.loader.context().lookup.identity_type(type_name)?;
        Ok(self.loader.proxy_for(Identity::new(root, key)))
    }

    /// Re-read `entity` from the store in place, including its lock token.
    pub fn refresh(&self, entity: &EntityHandle) -> Result<()> {
        self.loader.refresh(entity)
    }

    /// Identity of `entity` as this session knows it.
    pub fn identity_of(&self, entity: &EntityHandle) -> Result<Identity> {
        if let Some(identity) = self.loader.cache().identity_of_handle(entity).cloned() {
            return Ok(identity);
        }
        if let Some(identity) = self.plan.provisional_of(entity) {
            return Ok(identity);
        }
        identity_of(&*read_entity(entity), &*self.loader.context().lookup)
    }

    /// Detach one object from the identity map.
    pub fn evict(&self, identity: &Identity) -> Option<EntityHandle> {
        self.loader.cache().remove(identity)
    }

    /// Detach every cached object.
    pub fn evict_all(&self) {
        self.loader.cache().clear();
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.loader.cache().contains(identity)
    }

    pub fn cached_count(&self) -> usize {
        self.loader.cache().len()
    }

    /// Weak handle through which proxies load their targets.
    pub fn handle(&self) -> SessionHandle {
        self.loader.session_handle()
    }

    /// Bind an unmaterialized proxy to this session, e.g. one whose
    /// session has been dropped.
    pub fn adopt(&self, proxy: &EntityRef) {
        proxy.attach(self.handle());
    }

    /// Seed for deserializing proxies bound to this session.
    pub fn proxy_seed(&self) -> ProxySeed {
        ProxySeed::new(self.handle())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            tracing::warn!(
                pending = self.coordinator.len(),
                "session dropped with an open transaction, rolling back"
            );
            self.abort_quietly();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowbroker_core::{DescriptorRegistry, Entity, EntityDescriptor, FieldDescriptor, handle};
    use rowbroker_memory::MemoryStore;
    use std::any::Any;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Widget {
        id: Option<i64>,
        label: Option<String>,
    }

    impl Entity for Widget {
        fn entity_type(&self) -> &'static str {
            "Widget"
        }
        fn field(&self, name: &str) -> Result<Value> {
            match name {
                "id" => Ok(self.id.into()),
                "label" => Ok(self.label.clone().into()),
                _ => Err(Error::unknown_field("Widget", name)),
            }
        }
        fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
            match name {
                "id" => self.id = rowbroker_core::entity::field_value(value, name)?,
                "label" => self.label = rowbroker_core::entity::field_value(value, name)?,
                _ => return Err(Error::unknown_field("Widget", name)),
            }
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn widget_factory() -> EntityHandle {
        handle(Widget::default())
    }

    fn session() -> (Session, MemoryStore) {
        const FIELDS: &[FieldDescriptor] = &[
            FieldDescriptor::new("id").primary_key(true),
            FieldDescriptor::new("label"),
        ];
        let registry = DescriptorRegistry::new()
            .with(EntityDescriptor::new("Widget", "widgets", widget_factory).fields(FIELDS))
            .unwrap();
        let store = MemoryStore::new();
        store.define_table("widgets", &["id"]);
        let session = Session::new(
            BrokerContext::new(Arc::new(registry)),
            Arc::new(store.connect()),
        );
        (session, store)
    }

    fn widget(id: i64, label: &str) -> EntityHandle {
        handle(Widget {
            id: Some(id),
            label: Some(label.to_string()),
        })
    }

    #[test]
    fn test_store_requires_active_transaction() {
        let (mut session, _) = session();
        let err = session.store(&widget(1, "a")).unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalState(ref e) if e.kind == IllegalStateKind::NotActive
        ));
    }

    #[test]
    fn test_nested_begin_is_rejected() {
        let (mut session, _) = session();
        session.begin().unwrap();
        let err = session.begin().unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalState(ref e) if e.kind == IllegalStateKind::NestedBegin
        ));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_commit_inserts_and_caches() {
        let (mut session, store) = session();
        let w = widget(1, "first");
        session.begin().unwrap();
        session.store(&w).unwrap();
        assert_eq!(store.row_count("widgets"), 0);
        let result = session.commit().unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(store.row_count("widgets"), 1);
        assert_eq!(session.state(), SessionState::Idle);

        let id = Identity::new("Widget", vec![Value::BigInt(1)]);
        assert!(session.contains(&id));
        let fetched = session.get("Widget", vec![Value::BigInt(1)]).unwrap().unwrap();
        assert!(rowbroker_core::same_entity(&fetched, &w));
    }

    #[test]
    fn test_abort_discards_pending() {
        let (mut session, store) = session();
        session.begin().unwrap();
        session.store(&widget(1, "a")).unwrap();
        assert_eq!(session.pending_count(), 1);
        session.abort().unwrap();
        assert_eq!(session.pending_count(), 0);
        assert_eq!(store.row_count("widgets"), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_before_flush_error_aborts_commit() {
        let (mut session, store) = session();
        let aborted = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&aborted);
        session.on_before_flush(|| Err(Error::Custom("vetoed".to_string())));
        session.on_after_abort(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        session.begin().unwrap();
        session.store(&widget(1, "a")).unwrap();
        let err = session.commit().unwrap_err();
        assert!(err.to_string().contains("vetoed"));
        assert!(*aborted.lock().unwrap());
        assert_eq!(store.row_count("widgets"), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_clear_cache_on_commit() {
        let (session, store) = session();
        let context = session.loader.context().clone();
        drop(session);
        let mut session = Session::with_config(
            context,
            Arc::new(store.connect()),
            SessionConfig::new().clear_cache_on_commit(true),
        );
        session.begin().unwrap();
        session.store(&widget(2, "b")).unwrap();
        session.commit().unwrap();
        assert_eq!(session.cached_count(), 0);
    }
}
