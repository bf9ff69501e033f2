//! Loading objects through the identity map.
//!
//! The loader owns the session's [`ObjectCache`]. Every fetch goes through
//! it: a cached identity is returned as is, anything else is read from the
//! store, hydrated through the type's factory, cached, and then has its
//! edges wired according to each edge's retrieve policy. Lazy proxies hold
//! a weak link to the loader and come back here on first access.

use crate::cache::ObjectCache;
use rowbroker_core::{
    BrokerContext, CascadePolicy, EdgeDescriptor, EdgeKind, Entity, EntityDescriptor,
    EntityHandle, EntityRef, Error, Identity, Materializer, Result, Row, SessionHandle,
    StatementExecutor, StoreErrorKind, TableSegment, Value, identity_of, read_entity,
    write_entity,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Rows of one object, one per table segment, plus its concrete type.
struct Fetched {
    descriptor: &'static str,
    layout: Vec<TableSegment>,
    rows: Vec<Row>,
}

/// Identity-map-backed loader shared by a session and its proxies.
pub struct SessionLoader {
    context: BrokerContext,
    executor: Arc<dyn StatementExecutor>,
    cache: Mutex<ObjectCache>,
    me: Weak<SessionLoader>,
}

impl std::fmt::Debug for SessionLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLoader")
            .field("cached", &self.cache().len())
            .finish_non_exhaustive()
    }
}

impl SessionLoader {
    pub fn new(context: BrokerContext, executor: Arc<dyn StatementExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            context,
            executor,
            cache: Mutex::new(ObjectCache::new()),
            me: me.clone(),
        })
    }

    /// Weak handle for proxies created by this loader.
    pub fn session_handle(&self) -> SessionHandle {
        let handle: Weak<dyn Materializer> = self.me.clone();
        handle
    }

    pub fn cache(&self) -> MutexGuard<'_, ObjectCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &BrokerContext {
        &self.context
    }

    pub fn executor(&self) -> &dyn StatementExecutor {
        &*self.executor
    }

    /// Fetch `identity`, from the cache if resident.
    ///
    /// Returns `None` when no row exists. Provisional identities are never
    /// in the store and always return `None` unless cached.
    #[tracing::instrument(level = "trace", skip(self, identity), fields(identity = %identity))]
    pub fn load(&self, identity: &Identity) -> Result<Option<EntityHandle>> {
        if let Some(handle) = self.cache().lookup(identity) {
            tracing::trace!("cache hit");
            return Ok(Some(handle));
        }
        let Some(fetched) = self.fetch(identity)? else {
            return Ok(None);
        };

        let lookup = &*self.context.lookup;
        let descriptor: &EntityDescriptor = lookup.describe(fetched.descriptor)?;
        let handle = (descriptor.factory)();
        hydrate(&mut *write_entity(&handle), &fetched)?;
        let token = self.lock_token(&handle, fetched.descriptor)?;

        let resident = {
            let mut cache = self.cache();
            if let Some(existing) = cache.lookup(identity) {
                return Ok(Some(existing));
            }
            let resident = cache.put(identity.clone(), handle);
            cache.set_lock_snapshot(identity, token);
            resident
        };
        tracing::debug!(identity = %identity, type_name = fetched.descriptor, "loaded");
        self.wire_edges(identity, &resident, fetched.descriptor)?;
        Ok(Some(resident))
    }

    /// Fetch by type and key. `None` if missing or of an unrelated type.
    pub fn get(&self, type_name: &str, key: Vec<Value>) -> Result<Option<EntityHandle>> {
        let lookup = &*self.context.lookup;
        let identity = Identity::new(lookup.identity_type(type_name)?, key);
        let Some(handle) = self.load(&identity)? else {
            return Ok(None);
        };
        let actual = read_entity(&handle).entity_type();
        if lookup.is_a(actual, type_name)? {
            Ok(Some(handle))
        } else {
            tracing::debug!(identity = %identity, requested = type_name, actual, "type mismatch");
            Ok(None)
        }
    }

    /// Proxy for `identity`, already resolved when the object is cached.
    pub fn proxy_for(&self, identity: Identity) -> EntityRef {
        let cached = self.cache().lookup(&identity);
        match cached {
            Some(handle) => EntityRef::resolved(identity, handle),
            None => EntityRef::unmaterialized(identity, self.session_handle()),
        }
    }

    /// Does a row for `identity` exist in the store?
    pub fn exists(&self, identity: &Identity) -> Result<bool> {
        let Some(key) = identity.values() else {
            return Ok(false);
        };
        let layout = self.context.lookup.table_layout(identity.type_name())?;
        let Some(root) = layout.first() else {
            return Ok(false);
        };
        let key_columns = columns(&root.key_columns);
        Ok(self
            .executor
            .select_by_key(root.table, &key_columns, key)?
            .is_some())
    }

    /// Re-read a cached object's fields, lock token, and edges in place.
    #[tracing::instrument(level = "debug", skip(self, handle))]
    pub fn refresh(&self, handle: &EntityHandle) -> Result<()> {
        let cached = self.cache().identity_of_handle(handle).cloned();
        let identity = match cached {
            Some(identity) => identity,
            None => identity_of(&*read_entity(handle), &*self.context.lookup)?,
        };
        let Some(fetched) = self.fetch(&identity)? else {
            return Err(Error::dangling(identity));
        };
        hydrate(&mut *write_entity(handle), &fetched)?;
        let token = self.lock_token(handle, fetched.descriptor)?;
        {
            let mut cache = self.cache();
            cache.put(identity.clone(), Arc::clone(handle));
            cache.set_lock_snapshot(&identity, token);
        }
        self.wire_edges(&identity, handle, fetched.descriptor)
    }

    fn fetch(&self, identity: &Identity) -> Result<Option<Fetched>> {
        let Some(key) = identity.values() else {
            return Ok(None);
        };
        let lookup = &*self.context.lookup;
        let root_layout = lookup.table_layout(identity.type_name())?;
        let Some(root) = root_layout.first() else {
            return Ok(None);
        };
        let key_columns = columns(&root.key_columns);
        let Some(row) = self.executor.select_by_key(root.table, &key_columns, key)? else {
            tracing::trace!(identity = %identity, "no row");
            return Ok(None);
        };

        let discriminator = root
            .discriminator
            .and_then(|(column, _)| row.get_by_name(column))
            .and_then(Value::as_str);
        let concrete = match discriminator {
            Some(value) => lookup.resolve_discriminator(identity.type_name(), value)?,
            None => lookup.describe(identity.type_name())?,
        };
        let descriptor = concrete.type_name;
        let layout = lookup.table_layout(descriptor)?;

        let mut rows = vec![row];
        for segment in layout.iter().skip(1) {
            let row = self
                .executor
                .select_by_key(segment.table, &key_columns, key)?
                .ok_or_else(|| {
                    Error::store(
                        StoreErrorKind::Statement,
                        format!("{identity} has no row in {}", segment.table),
                    )
                })?;
            rows.push(row);
        }
        Ok(Some(Fetched {
            descriptor,
            layout,
            rows,
        }))
    }

    fn lock_token(&self, handle: &EntityHandle, type_name: &str) -> Result<Option<Value>> {
        match self.context.lookup.lock_field(type_name)? {
            Some(field) => Ok(Some(read_entity(handle).field(field.name)?)),
            None => Ok(None),
        }
    }

    fn wire_edges(&self, identity: &Identity, handle: &EntityHandle, type_name: &str) -> Result<()> {
        let lookup = &*self.context.lookup;
        for edge in lookup.edges_of(type_name)? {
            let policy = edge.cascade.retrieve;
            if policy == CascadePolicy::None {
                continue;
            }
            match &edge.kind {
                EdgeKind::Reference => {
                    let key = {
                        let entity = read_entity(handle);
                        edge.foreign_key
                            .iter()
                            .map(|f| entity.field(f))
                            .collect::<Result<Vec<_>>>()?
                    };
                    let target = if key.iter().any(Value::is_null) {
                        None
                    } else {
                        let target = Identity::new(lookup.identity_type(edge.target)?, key);
                        Some(self.edge_target(target, policy)?)
                    };
                    write_entity(handle).set_reference(edge.name, target)?;
                }
                EdgeKind::Collection => {
                    let members = self.collection_members(identity, edge)?;
                    let refs = members
                        .into_iter()
                        .map(|m| self.edge_target(m, policy))
                        .collect::<Result<Vec<_>>>()?;
                    write_entity(handle).set_collection(edge.name, refs)?;
                }
                EdgeKind::ManyToMany(link) => {
                    let Some(owner_key) = identity.values() else {
                        continue;
                    };
                    let target_type = lookup.identity_type(edge.target)?;
                    let members: Vec<Identity> = self
                        .executor
                        .select_keys(link.table, link.owner_columns, owner_key, link.target_columns)?
                        .into_iter()
                        .map(|k| Identity::new(target_type, k))
                        .collect();
                    let refs = members
                        .iter()
                        .map(|m| self.edge_target(m.clone(), policy))
                        .collect::<Result<Vec<_>>>()?;
                    write_entity(handle).set_collection(edge.name, refs)?;
                    self.cache().set_link_snapshot(identity, edge.name, members);
                }
            }
        }
        Ok(())
    }

    /// Identities of the targets whose foreign key names `owner`.
    pub(crate) fn collection_members(&self, owner: &Identity, edge: &EdgeDescriptor) -> Result<Vec<Identity>> {
        let Some(owner_key) = owner.values() else {
            return Ok(Vec::new());
        };
        let lookup = &*self.context.lookup;
        let layout = lookup.table_layout(edge.target)?;
        let segment = layout
            .iter()
            .find(|s| edge.foreign_key.iter().all(|f| s.stores_field(f)))
            .ok_or_else(|| {
                Error::unknown_field(edge.target, edge.foreign_key.first().copied().unwrap_or(""))
            })?;
        let fk_columns: Vec<&str> = edge
            .foreign_key
            .iter()
            .filter_map(|f| segment.column_for(f))
            .collect();
        let key_columns = columns(&segment.key_columns);
        let target_type = lookup.identity_type(edge.target)?;
        Ok(self
            .executor
            .select_keys(segment.table, &fk_columns, owner_key, &key_columns)?
            .into_iter()
            .map(|k| Identity::new(target_type, k))
            .collect())
    }

    fn edge_target(&self, identity: Identity, policy: CascadePolicy) -> Result<EntityRef> {
        if policy == CascadePolicy::Full {
            let handle = self
                .load(&identity)?
                .ok_or_else(|| Error::dangling(identity.clone()))?;
            Ok(EntityRef::resolved(identity, handle))
        } else {
            Ok(self.proxy_for(identity))
        }
    }
}

impl Materializer for SessionLoader {
    fn materialize(&self, identity: &Identity) -> Result<Option<EntityHandle>> {
        tracing::trace!(identity = %identity, "materializing proxy");
        self.load(identity)
    }
}

fn columns(bindings: &[rowbroker_core::ColumnBinding]) -> Vec<&'static str> {
    bindings.iter().map(|b| b.column).collect()
}

fn hydrate(entity: &mut dyn Entity, fetched: &Fetched) -> Result<()> {
    for (segment, row) in fetched.layout.iter().zip(&fetched.rows) {
        let bindings = segment
            .key_columns
            .iter()
            .chain(&segment.columns)
            .chain(segment.lock_column.iter());
        for binding in bindings {
            if let Some(value) = row.get_by_name(binding.column) {
                entity.set_field(binding.field, value.clone())?;
            }
        }
    }
    Ok(())
}
