//! Cascade graph walker.
//!
//! Expands one `store` or `delete` request into the ordered row operations
//! it implies, following each edge's cascade policy:
//!
//! - `None` edges are skipped without reading them.
//! - `Link` edges write only linkage: the owner's foreign key fields, the
//!   members' foreign key columns, or link-table rows.
//! - `Full` edges recurse into the target with the same operation.
//!
//! Each identity is visited at most once per top-level call, which is what
//! makes cyclic graphs terminate. Edges are processed in declaration order.
//! On store, a reference target declared `TargetFirst` is planned before its
//! owner and everything else after; on delete the order is reversed so that
//! rows naming others always go first.

use crate::batch::BatchCoordinator;
use crate::loader::SessionLoader;
use crate::locking::OptimisticLockManager;
use crate::operation::{
    BoundValue, LinkChange, LockStamp, OperationClass, PendingOperation, RowWrite,
};
use rowbroker_core::{
    CascadePolicy, ColumnBinding, DescriptorLookup, EdgeDescriptor, EdgeKind, EdgeOrdering,
    EntityHandle, EntityRef, Error, FieldDescriptor, Identity, IdentityKey, KeyGeneration,
    KeyGenerator, LinkTable, Result, StatementKind, StatementShape, Value, handle_addr,
    identity_of, read_entity, write_entity,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Which top-level operation to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOperation {
    Store,
    Delete,
}

/// Provisional identities handed out during one transaction.
///
/// Objects whose key the store generates are tracked here by handle until
/// their insert is flushed. The handles are held strongly so an address is
/// never reused while its entry lives.
#[derive(Debug, Default)]
pub struct PlanState {
    provisional: HashMap<usize, (EntityHandle, Identity)>,
    next_slot: u64,
}

impl PlanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provisional_of(&self, handle: &EntityHandle) -> Option<Identity> {
        self.provisional
            .get(&handle_addr(handle))
            .map(|(_, identity)| identity.clone())
    }

    fn allocate(&mut self, type_name: &str, handle: &EntityHandle) -> Identity {
        self.next_slot += 1;
        let identity = Identity::provisional(type_name, self.next_slot);
        self.provisional.insert(
            handle_addr(handle),
            (Arc::clone(handle), identity.clone()),
        );
        identity
    }

    pub fn len(&self) -> usize {
        self.provisional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.provisional.is_empty()
    }

    /// Forget every provisional identity. Slots keep counting up.
    pub fn clear(&mut self) {
        self.provisional.clear();
    }
}

#[derive(Debug, Clone)]
enum WriteMode {
    Insert,
    /// Row exists; `snapshot` is the lock token read when it was loaded.
    Update { snapshot: Option<Value> },
    /// Row is inserted earlier in this transaction and not flushed yet.
    UpdateAfterInsert,
}

/// Plans one top-level store or delete.
pub struct CascadeWalker<'a> {
    loader: &'a SessionLoader,
    lookup: &'a dyn DescriptorLookup,
    keys: Option<&'a dyn KeyGenerator>,
    locks: &'a OptimisticLockManager,
    pending: &'a BatchCoordinator,
    state: &'a mut PlanState,
    /// Foreign key fields to bind to a generated key, by object address.
    bindings: HashMap<usize, Vec<(&'static str, u64)>>,
    out: Vec<PendingOperation>,
}

impl<'a> CascadeWalker<'a> {
    pub fn new(
        loader: &'a SessionLoader,
        locks: &'a OptimisticLockManager,
        pending: &'a BatchCoordinator,
        state: &'a mut PlanState,
    ) -> Self {
        let context = loader.context();
        Self {
            loader,
            lookup: &*context.lookup,
            keys: context.keys.as_deref(),
            locks,
            pending,
            state,
            bindings: HashMap::new(),
            out: Vec::new(),
        }
    }

    /// Plan `operation` on `root` and everything its edges cascade to.
    ///
    /// Identities already in `visited` are skipped; every identity planned
    /// is added to it.
    pub fn plan(
        mut self,
        root: &EntityHandle,
        operation: CascadeOperation,
        visited: &mut HashSet<Identity>,
    ) -> Result<Vec<PendingOperation>> {
        match operation {
            CascadeOperation::Store => self.store(root, visited)?,
            CascadeOperation::Delete => self.delete(root, visited)?,
        }
        tracing::debug!(
            operation = ?operation,
            planned = self.out.len(),
            visited = visited.len(),
            "Cascade planned"
        );
        Ok(self.out)
    }

    pub fn plan_store(
        self,
        root: &EntityHandle,
        visited: &mut HashSet<Identity>,
    ) -> Result<Vec<PendingOperation>> {
        self.plan(root, CascadeOperation::Store, visited)
    }

    pub fn plan_delete(
        self,
        root: &EntityHandle,
        visited: &mut HashSet<Identity>,
    ) -> Result<Vec<PendingOperation>> {
        self.plan(root, CascadeOperation::Delete, visited)
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    fn store(&mut self, handle: &EntityHandle, visited: &mut HashSet<Identity>) -> Result<()> {
        let lookup = self.lookup;
        let type_name = read_entity(handle).entity_type();
        let (identity, fresh) = self.store_identity(handle, type_name)?;
        if !visited.insert(identity.clone()) {
            tracing::trace!(identity = %identity, "already visited");
            return Ok(());
        }
        let mode = self.write_mode(&identity, fresh)?;
        tracing::trace!(identity = %identity, mode = ?mode, "planning store");
        let edges = lookup.edges_of(type_name)?;

        let mut after = Vec::new();
        for edge in edges.iter().filter(|e| e.kind == EdgeKind::Reference) {
            let policy = edge.cascade.store;
            if policy == CascadePolicy::None {
                continue;
            }
            let target = read_entity(handle).reference(edge.name)?;
            let Some(target) = target else {
                let mut owner = write_entity(handle);
                for fk in edge.foreign_key {
                    owner.set_field(fk, Value::Null)?;
                }
                continue;
            };
            let loaded = target.loaded();
            let target_identity = match (&loaded, policy) {
                (Some(th), CascadePolicy::Full) => {
                    let target_type = read_entity(th).entity_type();
                    self.store_identity(th, target_type)?.0
                }
                (Some(th), _) => self.known_identity(th)?,
                (None, _) => ref_identity(&target)?,
            };
            self.bind_foreign_key(handle, edge.foreign_key, &target_identity)?;

            if policy == CascadePolicy::Full {
                if let Some(th) = loaded {
                    match edge.ordering {
                        EdgeOrdering::TargetFirst => self.store(&th, visited)?,
                        EdgeOrdering::OwnerFirst => after.push(th),
                    }
                }
            }
        }

        if let Some(op) = self.object_operation(handle, &identity, type_name, &mode)? {
            self.out.push(op);
        }
        for target in after {
            self.store(&target, visited)?;
        }

        for edge in edges.iter().filter(|e| e.is_to_many()) {
            let policy = edge.cascade.store;
            if policy == CascadePolicy::None {
                continue;
            }
            match &edge.kind {
                EdgeKind::Collection => self.store_collection(handle, &identity, edge, visited)?,
                EdgeKind::ManyToMany(link) => {
                    self.store_links(handle, &identity, type_name, edge, link, &mode, visited)?;
                }
                EdgeKind::Reference => {}
            }
        }
        Ok(())
    }

    fn store_collection(
        &mut self,
        owner: &EntityHandle,
        owner_identity: &Identity,
        edge: &EdgeDescriptor,
        visited: &mut HashSet<Identity>,
    ) -> Result<()> {
        let members = read_entity(owner).collection(edge.name)?;
        for member in members {
            match (member.loaded(), edge.cascade.store) {
                (Some(mh), CascadePolicy::Full) => {
                    self.bind_foreign_key(&mh, edge.foreign_key, owner_identity)?;
                    self.store(&mh, visited)?;
                }
                (Some(mh), _) => match self.known_identity(&mh) {
                    Ok(member_identity) => {
                        if member_identity.values().is_some() {
                            self.bind_foreign_key(&mh, edge.foreign_key, owner_identity)?;
                        }
                        self.linkage(&member_identity, owner_identity, edge, false)?;
                    }
                    Err(Error::IncompleteKey(_)) => {
                        tracing::trace!(edge = edge.name, "skipping transient member of linked collection");
                    }
                    Err(e) => return Err(e),
                },
                (None, _) => {
                    let member_identity = ref_identity(&member)?;
                    self.linkage(&member_identity, owner_identity, edge, false)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store_links(
        &mut self,
        owner: &EntityHandle,
        owner_identity: &Identity,
        owner_type: &'static str,
        edge: &EdgeDescriptor,
        link: &LinkTable,
        mode: &WriteMode,
        visited: &mut HashSet<Identity>,
    ) -> Result<()> {
        let members = read_entity(owner).collection(edge.name)?;
        let mut current = Vec::with_capacity(members.len());
        for member in members {
            let member_identity = match (member.loaded(), edge.cascade.store) {
                (Some(mh), CascadePolicy::Full) => {
                    let member_type = read_entity(&mh).entity_type();
                    let (member_identity, _) = self.store_identity(&mh, member_type)?;
                    self.store(&mh, visited)?;
                    member_identity
                }
                (Some(mh), _) => match self.known_identity(&mh) {
                    Ok(member_identity) => member_identity,
                    Err(Error::IncompleteKey(_)) => {
                        tracing::trace!(edge = edge.name, "skipping transient link member");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                (None, _) => ref_identity(&member)?,
            };
            if !current.contains(&member_identity) {
                current.push(member_identity);
            }
        }

        let snapshot = match mode {
            WriteMode::Insert | WriteMode::UpdateAfterInsert => Some(Vec::new()),
            WriteMode::Update { .. } => self
                .loader
                .cache()
                .link_snapshot(owner_identity, edge.name)
                .map(<[Identity]>::to_vec),
        };
        let Some(snapshot) = snapshot else {
            tracing::trace!(
                identity = %owner_identity,
                edge = edge.name,
                "no membership snapshot, link rows left alone"
            );
            return Ok(());
        };

        for member in current.iter().filter(|m| !snapshot.contains(m)) {
            self.link_row(StatementKind::Insert, owner_identity, owner_type, edge, link, member, visited);
        }
        for member in snapshot.iter().filter(|m| !current.contains(m)) {
            self.link_row(StatementKind::Delete, owner_identity, owner_type, edge, link, member, visited);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    fn delete(&mut self, handle: &EntityHandle, visited: &mut HashSet<Identity>) -> Result<()> {
        let lookup = self.lookup;
        let type_name = read_entity(handle).entity_type();
        let identity = self.known_identity(handle)?;
        if !visited.insert(identity.clone()) {
            tracing::trace!(identity = %identity, "already visited");
            return Ok(());
        }
        let known = identity.is_provisional()
            || self.loader.cache().contains(&identity)
            || self.pending.has_pending(&identity)
            || self.planned(&identity).is_some();
        if !known && !self.loader.exists(&identity)? {
            tracing::debug!(identity = %identity, "nothing stored to delete");
            return Ok(());
        }
        tracing::trace!(identity = %identity, "planning delete");

        let mut after = Vec::new();
        for edge in lookup.edges_of(type_name)? {
            let policy = edge.cascade.delete;
            if policy == CascadePolicy::None {
                continue;
            }
            match &edge.kind {
                EdgeKind::Reference => {
                    // Link: the owner's row carries the linkage and goes with it.
                    if policy != CascadePolicy::Full {
                        continue;
                    }
                    let target = read_entity(handle).reference(edge.name)?;
                    let Some(target) = target else { continue };
                    let th = target.get()?;
                    match edge.ordering {
                        EdgeOrdering::TargetFirst => after.push(th),
                        EdgeOrdering::OwnerFirst => self.delete(&th, visited)?,
                    }
                }
                EdgeKind::Collection => {
                    for member in self.collection_for_delete(handle, &identity, edge)? {
                        if policy == CascadePolicy::Full {
                            if let Some(mh) = self.resolve_member(&member)? {
                                self.delete(&mh, visited)?;
                            }
                        } else {
                            self.linkage(&member, &identity, edge, true)?;
                        }
                    }
                }
                EdgeKind::ManyToMany(link) => {
                    let members = self.links_for_delete(handle, &identity, edge, link)?;
                    for member in &members {
                        self.link_row(StatementKind::Delete, &identity, type_name, edge, link, member, visited);
                    }
                    if policy == CascadePolicy::Full {
                        for member in &members {
                            if let Some(mh) = self.resolve_member(member)? {
                                self.delete(&mh, visited)?;
                            }
                        }
                    }
                }
            }
        }

        let op = self.delete_operation(handle, &identity, type_name)?;
        self.out.push(op);
        for target in after {
            self.delete(&target, visited)?;
        }
        Ok(())
    }

    /// Members of a collection: those in memory plus those in the store.
    fn collection_for_delete(
        &self,
        owner: &EntityHandle,
        owner_identity: &Identity,
        edge: &EdgeDescriptor,
    ) -> Result<Vec<Identity>> {
        let mut members = Vec::new();
        for member in read_entity(owner).collection(edge.name)? {
            let member_identity = match member.loaded() {
                Some(mh) => match self.known_identity(&mh) {
                    Ok(id) => id,
                    Err(Error::IncompleteKey(_)) => continue,
                    Err(e) => return Err(e),
                },
                None => ref_identity(&member)?,
            };
            push_unique(&mut members, member_identity);
        }
        for member in self.loader.collection_members(owner_identity, edge)? {
            push_unique(&mut members, member);
        }
        Ok(members)
    }

    /// Link-table members: in memory, in the snapshot, and in the store.
    fn links_for_delete(
        &self,
        owner: &EntityHandle,
        owner_identity: &Identity,
        edge: &EdgeDescriptor,
        link: &LinkTable,
    ) -> Result<Vec<Identity>> {
        let mut members = Vec::new();
        for member in read_entity(owner).collection(edge.name)? {
            let member_identity = match member.loaded() {
                Some(mh) => match self.known_identity(&mh) {
                    Ok(id) => id,
                    Err(Error::IncompleteKey(_)) => continue,
                    Err(e) => return Err(e),
                },
                None => ref_identity(&member)?,
            };
            push_unique(&mut members, member_identity);
        }
        let snapshot = self
            .loader
            .cache()
            .link_snapshot(owner_identity, edge.name)
            .map(<[Identity]>::to_vec)
            .unwrap_or_default();
        for member in snapshot {
            push_unique(&mut members, member);
        }
        if let Some(owner_key) = owner_identity.values() {
            let target_type = self.lookup.identity_type(edge.target)?;
            let stored = self.loader.executor().select_keys(
                link.table,
                link.owner_columns,
                owner_key,
                link.target_columns,
            )?;
            for key in stored {
                push_unique(&mut members, Identity::new(target_type, key));
            }
        }
        Ok(members)
    }

    /// The object behind a member identity. Inserts not flushed yet, from
    /// this walk or an earlier call in the transaction, win over the store.
    fn resolve_member(&self, identity: &Identity) -> Result<Option<EntityHandle>> {
        let unflushed = self
            .planned(identity)
            .or_else(|| self.pending.pending_insert(identity));
        if let Some(op) = unflushed {
            return Ok(op.target.clone());
        }
        self.loader.load(identity)
    }

    // ------------------------------------------------------------------
    // Identities and modes
    // ------------------------------------------------------------------

    /// Identity for storing `handle`, generating a key if the descriptor
    /// allows it. The flag is true when the key was generated just now.
    fn store_identity(&mut self, handle: &EntityHandle, type_name: &str) -> Result<(Identity, bool)> {
        if let Some(identity) = self.state.provisional_of(handle) {
            return Ok((identity, false));
        }
        let lookup = self.lookup;
        let computed = identity_of(&*read_entity(handle), lookup);
        let incomplete = match computed {
            Ok(identity) => return Ok((identity, false)),
            Err(Error::IncompleteKey(e)) => e,
            Err(e) => return Err(e),
        };
        let root = lookup.identity_type(type_name)?;
        match incomplete.generation {
            KeyGeneration::None => Err(Error::IncompleteKey(incomplete)),
            KeyGeneration::Sequence => {
                let Some(keys) = self.keys else {
                    return Err(Error::IncompleteKey(incomplete));
                };
                let key_fields: Vec<&FieldDescriptor> = lookup.key_fields(type_name)?;
                let mut entity = write_entity(handle);
                for field in key_fields {
                    if field.key_generation == KeyGeneration::Sequence
                        && entity.field(field.name)?.is_null()
                    {
                        let key = keys.next_key(root, field.name)?;
                        tracing::trace!(type_name = root, field = field.name, key = %key, "generated key");
                        entity.set_field(field.name, key)?;
                    }
                }
                drop(entity);
                Ok((identity_of(&*read_entity(handle), lookup)?, true))
            }
            KeyGeneration::Store => {
                if lookup.key_fields(type_name)?.len() != 1 {
                    return Err(Error::IncompleteKey(incomplete));
                }
                let identity = self.state.allocate(root, handle);
                tracing::trace!(identity = %identity, "provisional identity");
                Ok((identity, true))
            }
        }
    }

    /// Identity of an object that is not being stored through this edge.
    fn known_identity(&self, handle: &EntityHandle) -> Result<Identity> {
        if let Some(identity) = self.state.provisional_of(handle) {
            return Ok(identity);
        }
        if let Some(identity) = self.loader.cache().identity_of_handle(handle).cloned() {
            return Ok(identity);
        }
        identity_of(&*read_entity(handle), self.lookup)
    }

    fn planned(&self, identity: &Identity) -> Option<&PendingOperation> {
        self.out.iter().find(|op| {
            op.class == OperationClass::Object
                && op.kind == StatementKind::Insert
                && &op.identity == identity
        })
    }

    fn write_mode(&self, identity: &Identity, fresh: bool) -> Result<WriteMode> {
        let inserted_earlier =
            self.pending.has_pending_insert(identity) || self.planned(identity).is_some();
        if inserted_earlier {
            return Ok(WriteMode::UpdateAfterInsert);
        }
        if identity.is_provisional() || fresh {
            return Ok(WriteMode::Insert);
        }
        let cached = self
            .loader
            .cache()
            .entry(identity)
            .map(|e| e.lock_snapshot().cloned());
        if let Some(snapshot) = cached {
            return Ok(WriteMode::Update { snapshot });
        }
        if self.pending.has_pending(identity) || self.loader.exists(identity)? {
            Ok(WriteMode::Update { snapshot: None })
        } else {
            Ok(WriteMode::Insert)
        }
    }

    /// Point `fields` of `holder` at `target`: assign the key now, or bind
    /// the fields to the key the store will generate.
    fn bind_foreign_key(
        &mut self,
        holder: &EntityHandle,
        fields: &'static [&'static str],
        target: &Identity,
    ) -> Result<()> {
        match target.key() {
            IdentityKey::Assigned(values) => {
                let mut entity = write_entity(holder);
                for (field, value) in fields.iter().zip(values) {
                    entity.set_field(field, value.clone())?;
                }
            }
            IdentityKey::Provisional(slot) => {
                let bound = self.bindings.entry(handle_addr(holder)).or_default();
                for field in fields {
                    bound.retain(|(f, _)| f != field);
                    bound.push((field, *slot));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operation builders
    // ------------------------------------------------------------------

    fn object_operation(
        &mut self,
        handle: &EntityHandle,
        identity: &Identity,
        type_name: &'static str,
        mode: &WriteMode,
    ) -> Result<Option<PendingOperation>> {
        let lookup = self.lookup;
        let layout = lookup.table_layout(type_name)?;
        let lock_field = lookup.lock_field(type_name)?.copied();

        let stamp = match (mode, &lock_field) {
            (WriteMode::Insert, Some(field)) => {
                self.locks
                    .stamp_for_insert(&mut *write_entity(handle), field)?;
                None
            }
            (WriteMode::Update { snapshot }, Some(field)) => Some(
                self.locks
                    .validate_and_advance(identity, handle, field, snapshot.as_ref())?,
            ),
            _ => None,
        };

        let deferred = self
            .bindings
            .remove(&handle_addr(handle))
            .unwrap_or_default();
        let overrides: HashMap<&str, u64> = deferred.iter().copied().collect();
        let key_slot = provisional_slot(identity);

        let entity = read_entity(handle);
        let bound = |field: &str| -> Result<BoundValue> {
            match overrides.get(field) {
                Some(slot) => Ok(BoundValue::GeneratedKey { slot: *slot }),
                None => Ok(BoundValue::Value(entity.field(field)?)),
            }
        };
        let key_bound = |binding: &ColumnBinding| -> Result<BoundValue> {
            match key_slot {
                Some(slot) => Ok(BoundValue::GeneratedKey { slot }),
                None => bound(binding.field),
            }
        };

        let mut writes = Vec::with_capacity(layout.len());
        let mut generated_field = None;
        match mode {
            WriteMode::Insert => {
                for (level, segment) in layout.iter().enumerate() {
                    let mut columns = Vec::new();
                    let mut values = Vec::new();
                    let mut generates = None;
                    for key in &segment.key_columns {
                        if level == 0 && key_slot.is_some() {
                            generates = Some(key.column);
                            generated_field = Some(key.field);
                            continue;
                        }
                        columns.push(key.column);
                        values.push(key_bound(key)?);
                    }
                    for binding in segment.columns.iter().chain(segment.lock_column.iter()) {
                        columns.push(binding.column);
                        values.push(bound(binding.field)?);
                    }
                    if let Some((column, value)) = segment.discriminator {
                        columns.push(column);
                        values.push(BoundValue::Value(Value::from(value)));
                    }
                    let mut shape = StatementShape::insert(segment.table, columns);
                    if let Some(column) = generates {
                        shape = shape.with_generated_key(column);
                    }
                    writes.push(RowWrite::new(shape, values));
                }
            }
            WriteMode::Update { .. } | WriteMode::UpdateAfterInsert => {
                for segment in &layout {
                    let mut columns = Vec::new();
                    let mut values = Vec::new();
                    for binding in &segment.columns {
                        columns.push(binding.column);
                        values.push(bound(binding.field)?);
                    }
                    let checked = segment.lock_column.zip(stamp.as_ref());
                    if let Some((lock, stamp)) = checked {
                        columns.push(lock.column);
                        values.push(BoundValue::Value(stamp.next.clone()));
                    }
                    if columns.is_empty() {
                        continue;
                    }
                    for key in &segment.key_columns {
                        values.push(key_bound(key)?);
                    }
                    let keys = segment.key_columns.iter().map(|k| k.column).collect();
                    let mut shape = StatementShape::update(segment.table, columns, keys);
                    if let Some((lock, stamp)) = checked {
                        shape = shape.with_lock(lock.column);
                        values.push(BoundValue::Value(stamp.expected.clone()));
                    }
                    writes.push(RowWrite::new(shape, values));
                }
            }
        }

        let mut image = Vec::new();
        for segment in &layout {
            for binding in segment
                .key_columns
                .iter()
                .chain(&segment.columns)
                .chain(segment.lock_column.iter())
            {
                if !image.iter().any(|(f, _)| *f == binding.field) {
                    image.push((binding.field, bound(binding.field)?));
                }
            }
        }
        drop(entity);

        if writes.is_empty() {
            tracing::trace!(identity = %identity, "no columns to update");
            return Ok(None);
        }
        let kind = match mode {
            WriteMode::Insert => StatementKind::Insert,
            _ => StatementKind::Update,
        };
        let mut op = PendingOperation::new(kind, identity.clone(), OperationClass::Object)
            .with_target(Arc::clone(handle));
        op.writes = writes;
        op.lock = stamp;
        op.generates = key_slot.zip(generated_field);
        op.deferred = deferred;
        op.image = image;
        op.depends_on = overrides
            .values()
            .filter_map(|slot| self.slot_identity(*slot))
            .collect();
        Ok(Some(op))
    }

    fn delete_operation(
        &self,
        handle: &EntityHandle,
        identity: &Identity,
        type_name: &str,
    ) -> Result<PendingOperation> {
        let lookup = self.lookup;
        let layout = lookup.table_layout(type_name)?;
        let stamp: Option<LockStamp> = match lookup.lock_field(type_name)? {
            Some(field)
                if self.planned(identity).is_none() && !self.pending.has_pending_insert(identity) =>
            {
                let snapshot = self.loader.cache().lock_snapshot(identity).cloned();
                Some(
                    self.locks
                        .validate_and_advance(identity, handle, field, snapshot.as_ref())?,
                )
            }
            _ => None,
        };

        let key_values = identity_binding(identity);
        let mut op =
            PendingOperation::new(StatementKind::Delete, identity.clone(), OperationClass::Object)
                .with_target(Arc::clone(handle));
        for segment in layout.iter().rev() {
            let keys = segment.key_columns.iter().map(|k| k.column).collect();
            let mut shape = StatementShape::delete(segment.table, keys);
            let mut values = key_values.clone();
            if let (Some(lock), Some(stamp)) = (segment.lock_column, &stamp) {
                shape = shape.with_lock(lock.column);
                values.push(BoundValue::Value(stamp.expected.clone()));
            }
            op.writes.push(RowWrite::new(shape, values));
        }
        op.lock = stamp;
        Ok(op)
    }

    /// Rewrite a collection member's foreign key columns, to the owner's key
    /// or to NULL.
    fn linkage(
        &mut self,
        member: &Identity,
        owner: &Identity,
        edge: &EdgeDescriptor,
        clear: bool,
    ) -> Result<()> {
        let lookup = self.lookup;
        let layout = lookup.table_layout(edge.target)?;
        let Some(segment) = layout
            .iter()
            .find(|s| edge.foreign_key.iter().all(|f| s.stores_field(f)))
        else {
            return Err(Error::unknown_field(
                edge.target,
                edge.foreign_key.first().copied().unwrap_or(""),
            ));
        };
        let columns: Vec<&'static str> = edge
            .foreign_key
            .iter()
            .filter_map(|f| segment.column_for(f))
            .collect();
        let mut values: Vec<BoundValue> = if clear {
            vec![BoundValue::Value(Value::Null); columns.len()]
        } else {
            identity_binding(owner)
        };
        values.extend(identity_binding(member));
        let keys = segment.key_columns.iter().map(|k| k.column).collect();
        let mut op = PendingOperation::new(StatementKind::Update, member.clone(), OperationClass::Linkage)
            .with_write(RowWrite::new(
                StatementShape::update(segment.table, columns, keys),
                values,
            ));
        op.depends_on.push(owner.clone());
        tracing::trace!(member = %member, owner = %owner, edge = edge.name, clear, "linkage");
        self.out.push(op);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn link_row(
        &mut self,
        kind: StatementKind,
        owner: &Identity,
        owner_type: &'static str,
        edge: &EdgeDescriptor,
        link: &LinkTable,
        member: &Identity,
        visited: &mut HashSet<Identity>,
    ) {
        let identity = link_identity(link, owner, member);
        if !visited.insert(identity.clone()) {
            return;
        }
        let mut columns: Vec<&'static str> = link.owner_columns.to_vec();
        columns.extend_from_slice(link.target_columns);
        let mut values = identity_binding(owner);
        values.extend(identity_binding(member));
        let shape = match kind {
            StatementKind::Delete => StatementShape::delete(link.table, columns),
            _ => StatementShape::insert(link.table, columns),
        };
        let mut op = PendingOperation::new(kind, identity, OperationClass::LinkRow)
            .with_write(RowWrite::new(shape, values));
        op.depends_on = vec![owner.clone(), member.clone()];
        op.link = Some(LinkChange {
            owner: owner.clone(),
            owner_type,
            edge: edge.name,
            member: member.clone(),
        });
        tracing::trace!(link = %op.identity, kind = %kind, "link row");
        self.out.push(op);
    }

    fn slot_identity(&self, slot: u64) -> Option<Identity> {
        self.state
            .provisional
            .values()
            .find(|(_, id)| provisional_slot(id) == Some(slot))
            .map(|(_, id)| id.clone())
    }
}

fn ref_identity(target: &EntityRef) -> Result<Identity> {
    target.identity().ok_or_else(|| {
        Error::Custom("reference has neither a loaded target nor an identity".to_string())
    })
}

fn provisional_slot(identity: &Identity) -> Option<u64> {
    match identity.key() {
        IdentityKey::Provisional(slot) => Some(*slot),
        IdentityKey::Assigned(_) => None,
    }
}

/// Key values of `identity` as statement inputs.
fn identity_binding(identity: &Identity) -> Vec<BoundValue> {
    match identity.key() {
        IdentityKey::Assigned(values) => values.iter().cloned().map(BoundValue::Value).collect(),
        IdentityKey::Provisional(slot) => vec![BoundValue::GeneratedKey { slot: *slot }],
    }
}

/// Identity of one link-table row, independent of which side plans it.
fn link_identity(link: &LinkTable, owner: &Identity, member: &Identity) -> Identity {
    let label = |identity: &Identity, i: usize| match identity.key() {
        IdentityKey::Assigned(values) => values.get(i).map_or_else(String::new, ToString::to_string),
        IdentityKey::Provisional(slot) => format!("#{slot}"),
    };
    let mut parts: Vec<(&str, String)> = link
        .owner_columns
        .iter()
        .enumerate()
        .map(|(i, c)| (*c, label(owner, i)))
        .chain(
            link.target_columns
                .iter()
                .enumerate()
                .map(|(i, c)| (*c, label(member, i))),
        )
        .collect();
    parts.sort();
    Identity::new(
        link.table,
        parts
            .into_iter()
            .map(|(c, v)| Value::Text(format!("{c}={v}")))
            .collect(),
    )
}

fn push_unique(list: &mut Vec<Identity>, identity: Identity) {
    if !list.contains(&identity) {
        list.push(identity);
    }
}
