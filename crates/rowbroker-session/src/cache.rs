//! Per-session identity map.
//!
//! Maps each [`Identity`] to the one in-memory object that represents it,
//! together with the lock token and link-table membership last read from
//! or written to the store. Two lookups of the same identity always return
//! the same handle.
//!
//! The cache provides no locking of its own; the session serializes access.

use rowbroker_core::{EntityHandle, Identity, Value, handle_addr};
use std::collections::HashMap;
use std::sync::Arc;

/// A cached object plus the state needed to write it back safely.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    handle: EntityHandle,
    lock_snapshot: Option<Value>,
    links: HashMap<&'static str, Vec<Identity>>,
}

impl CacheEntry {
    fn new(handle: EntityHandle) -> Self {
        Self {
            handle,
            lock_snapshot: None,
            links: HashMap::new(),
        }
    }

    pub fn handle(&self) -> &EntityHandle {
        &self.handle
    }

    /// Lock token as of the last load or successful write.
    pub fn lock_snapshot(&self) -> Option<&Value> {
        self.lock_snapshot.as_ref()
    }

    /// Link-table members of `edge` as of the last load or successful write.
    pub fn link_snapshot(&self, edge: &str) -> Option<&[Identity]> {
        self.links.get(edge).map(Vec::as_slice)
    }
}

/// Identity map: `Identity -> CacheEntry`.
#[derive(Debug, Default)]
pub struct ObjectCache {
    entries: HashMap<Identity, CacheEntry>,
    by_addr: HashMap<usize, Identity>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, identity: &Identity) -> Option<EntityHandle> {
        self.entries.get(identity).map(|e| Arc::clone(&e.handle))
    }

    pub fn entry(&self, identity: &Identity) -> Option<&CacheEntry> {
        self.entries.get(identity)
    }

    /// Insert `handle` unless `identity` is already cached.
    ///
    /// Returns the resident handle, which is the existing one when present.
    /// The new object's values never replace the cached reference.
    pub fn put(&mut self, identity: Identity, handle: EntityHandle) -> EntityHandle {
        if let Some(existing) = self.entries.get(&identity) {
            return Arc::clone(&existing.handle);
        }
        self.by_addr.insert(handle_addr(&handle), identity.clone());
        self.entries
            .insert(identity, CacheEntry::new(Arc::clone(&handle)));
        handle
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<EntityHandle> {
        let entry = self.entries.remove(identity)?;
        self.by_addr.remove(&handle_addr(&entry.handle));
        Some(entry.handle)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_addr.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Identity under which this exact object is cached, if any.
    pub fn identity_of_handle(&self, handle: &EntityHandle) -> Option<&Identity> {
        self.by_addr.get(&handle_addr(handle))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.keys()
    }

    pub fn lock_snapshot(&self, identity: &Identity) -> Option<&Value> {
        self.entries.get(identity).and_then(CacheEntry::lock_snapshot)
    }

    /// Record the token now stored for `identity`. No-op if not cached.
    pub fn set_lock_snapshot(&mut self, identity: &Identity, token: Option<Value>) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.lock_snapshot = token;
        }
    }

    pub fn link_snapshot(&self, identity: &Identity, edge: &str) -> Option<&[Identity]> {
        self.entries
            .get(identity)
            .and_then(|e| e.link_snapshot(edge))
    }

    pub fn set_link_snapshot(&mut self, identity: &Identity, edge: &'static str, members: Vec<Identity>) {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.links.insert(edge, members);
        }
    }

    /// Add or remove one member of a cached link snapshot.
    ///
    /// Creates the snapshot when adding to an edge never read before.
    pub fn update_link_snapshot(
        &mut self,
        identity: &Identity,
        edge: &'static str,
        member: &Identity,
        present: bool,
    ) {
        let Some(entry) = self.entries.get_mut(identity) else {
            return;
        };
        let members = entry.links.entry(edge).or_default();
        let idx = members.iter().position(|m| m == member);
        match (present, idx) {
            (true, None) => members.push(member.clone()),
            (false, Some(i)) => {
                members.remove(i);
            }
            _ => {}
        }
    }
}
