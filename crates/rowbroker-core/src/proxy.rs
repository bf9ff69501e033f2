//! Lazy reference proxy.
//!
//! An [`EntityRef`] stands in for a related object. It starts either
//! materialized (wrapping a handle the caller already has) or unmaterialized
//! (holding only the target's identity and a weak link back to the session
//! that will load it). The first real access loads the target; after that
//! the proxy delegates to the resolved object and never goes back.
//!
//! Clones share state, so materializing through one clone materializes all.

use crate::entity::{Entity, EntityHandle, read_entity, same_entity, write_entity};
use crate::error::{Error, IllegalStateKind, Result};
use crate::identity::Identity;
use serde::de::{DeserializeSeed, Deserializer};
use serde::ser::{Error as _, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Loads objects on behalf of proxies.
///
/// Implemented by the session's loader, which consults the identity map
/// before fetching. `Ok(None)` means the row does not exist.
pub trait Materializer: Send + Sync {
    fn materialize(&self, identity: &Identity) -> Result<Option<EntityHandle>>;
}

/// Weak link from a proxy to the session that loads it.
pub type SessionHandle = Weak<dyn Materializer>;

enum ProxyState {
    Unmaterialized {
        identity: Identity,
        session: SessionHandle,
    },
    Materializing {
        identity: Identity,
    },
    Materialized {
        identity: Option<Identity>,
        handle: EntityHandle,
    },
}

/// A reference to a managed object that may not be loaded yet.
#[derive(Clone)]
pub struct EntityRef {
    state: Arc<Mutex<ProxyState>>,
}

impl EntityRef {
    /// Wrap an object the caller already holds.
    pub fn to(handle: EntityHandle) -> Self {
        Self::with_state(ProxyState::Materialized {
            identity: None,
            handle,
        })
    }

    /// Wrap a loaded object whose identity is known.
    pub fn resolved(identity: Identity, handle: EntityHandle) -> Self {
        Self::with_state(ProxyState::Materialized {
            identity: Some(identity),
            handle,
        })
    }

    /// A placeholder that loads `identity` through `session` on first access.
    pub fn unmaterialized(identity: Identity, session: SessionHandle) -> Self {
        Self::with_state(ProxyState::Unmaterialized { identity, session })
    }

    fn with_state(state: ProxyState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The target's identity, if known. Never triggers a load.
    ///
    /// A proxy built with [`EntityRef::to`] does not know its identity;
    /// ask the object itself through the descriptor lookup instead.
    pub fn identity(&self) -> Option<Identity> {
        match &*self.lock() {
            ProxyState::Unmaterialized { identity, .. } | ProxyState::Materializing { identity } => {
                Some(identity.clone())
            }
            ProxyState::Materialized { identity, .. } => identity.clone(),
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(&*self.lock(), ProxyState::Materialized { .. })
    }

    /// The resolved handle if already materialized. Never triggers a load.
    pub fn loaded(&self) -> Option<EntityHandle> {
        match &*self.lock() {
            ProxyState::Materialized { handle, .. } => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Resolve the target, loading it through the owning session if needed.
    ///
    /// # Errors
    ///
    /// `DanglingReference` if the target does not exist, `IllegalState` if
    /// the session is gone or this proxy is already materializing. A failed
    /// load leaves the proxy unmaterialized so a later access can retry.
    pub fn get(&self) -> Result<EntityHandle> {
        let mut state = self.lock();
        let (identity, session) = match &*state {
            ProxyState::Materialized { handle, .. } => return Ok(Arc::clone(handle)),
            ProxyState::Materializing { identity } => {
                return Err(Error::illegal_state(
                    IllegalStateKind::ReentrantMaterialization,
                    format!("proxy for {identity} accessed while materializing"),
                ));
            }
            ProxyState::Unmaterialized { identity, session } => (identity.clone(), session.clone()),
        };
        *state = ProxyState::Materializing {
            identity: identity.clone(),
        };
        drop(state);

        let outcome = match session.upgrade() {
            Some(materializer) => materializer.materialize(&identity),
            None => Err(Error::illegal_state(
                IllegalStateKind::SessionClosed,
                format!("session owning proxy for {identity} is gone"),
            )),
        };

        let mut state = self.lock();
        match outcome {
            Ok(Some(handle)) => {
                tracing::trace!(identity = %identity, "materialized proxy");
                *state = ProxyState::Materialized {
                    identity: Some(identity),
                    handle: Arc::clone(&handle),
                };
                Ok(handle)
            }
            Ok(None) => {
                *state = ProxyState::Unmaterialized {
                    identity: identity.clone(),
                    session,
                };
                Err(Error::dangling(identity))
            }
            Err(e) => {
                *state = ProxyState::Unmaterialized { identity, session };
                Err(e)
            }
        }
    }

    /// Materialize and read the target through its accessor table.
    pub fn read<R>(&self, f: impl FnOnce(&dyn Entity) -> R) -> Result<R> {
        let handle = self.get()?;
        let guard = read_entity(&handle);
        Ok(f(&*guard))
    }

    /// Materialize and mutate the target through its accessor table.
    pub fn write<R>(&self, f: impl FnOnce(&mut dyn Entity) -> R) -> Result<R> {
        let handle = self.get()?;
        let mut guard = write_entity(&handle);
        Ok(f(&mut *guard))
    }

    /// Materialize and run `f` against the concrete type `E`.
    pub fn read_as<E: Entity, R>(&self, f: impl FnOnce(&E) -> R) -> Result<R> {
        let handle = self.get()?;
        crate::entity::read_as(&handle, f).ok_or_else(|| self.type_mismatch::<E>(&handle))
    }

    pub fn write_as<E: Entity, R>(&self, f: impl FnOnce(&mut E) -> R) -> Result<R> {
        let handle = self.get()?;
        crate::entity::write_as(&handle, f).ok_or_else(|| self.type_mismatch::<E>(&handle))
    }

    fn type_mismatch<E: Entity>(&self, handle: &EntityHandle) -> Error {
        Error::Type(crate::error::TypeError {
            expected: std::any::type_name::<E>(),
            actual: read_entity(handle).entity_type().to_string(),
            field: None,
        })
    }

    /// Do both proxies resolve to the same loaded object?
    ///
    /// Unmaterialized proxies compare by identity.
    pub fn refers_to_same(&self, other: &EntityRef) -> bool {
        if Arc::ptr_eq(&self.state, &other.state) {
            return true;
        }
        match (self.loaded(), other.loaded()) {
            (Some(a), Some(b)) => same_entity(&a, &b),
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Re-bind a detached proxy to `session`. Has no effect once materialized.
    pub fn attach(&self, session: SessionHandle) {
        let mut state = self.lock();
        if let ProxyState::Unmaterialized { session: slot, .. } = &mut *state {
            *slot = session;
        }
    }
}

impl From<EntityHandle> for EntityRef {
    fn from(handle: EntityHandle) -> Self {
        EntityRef::to(handle)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.lock() {
            ProxyState::Unmaterialized { identity, .. } => {
                write!(f, "EntityRef(unmaterialized {identity})")
            }
            ProxyState::Materializing { identity } => {
                write!(f, "EntityRef(materializing {identity})")
            }
            ProxyState::Materialized {
                identity: Some(identity),
                ..
            } => write!(f, "EntityRef(materialized {identity})"),
            ProxyState::Materialized { identity: None, .. } => {
                write!(f, "EntityRef(materialized)")
            }
        }
    }
}

/// Only the identity is written, never the target's fields.
impl Serialize for EntityRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let Some(identity) = self.identity() else {
            return Err(S::Error::custom(
                "cannot serialize a reference whose identity is unknown",
            ));
        };
        let mut st = serializer.serialize_struct("EntityRef", 1)?;
        st.serialize_field("identity", &identity)?;
        st.end()
    }
}

#[derive(Deserialize)]
struct SerializedRef {
    identity: Identity,
}

/// Deserializes an [`EntityRef`] bound to a session.
///
/// The result is always unmaterialized; deserializing never loads. Fails
/// when no session is supplied.
pub struct ProxySeed {
    pub session: Option<SessionHandle>,
}

impl ProxySeed {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn detached() -> Self {
        Self { session: None }
    }
}

impl<'de> DeserializeSeed<'de> for ProxySeed {
    type Value = EntityRef;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<EntityRef, D::Error> {
        let raw = SerializedRef::deserialize(deserializer)?;
        match self.session {
            Some(session) => Ok(EntityRef::unmaterialized(raw.identity, session)),
            None => Err(serde::de::Error::custom(format!(
                "reference to {} needs a session to deserialize",
                raw.identity
            ))),
        }
    }
}

/// Deserialize a proxy from JSON text, bound to `session`.
pub fn proxy_from_json(json: &str, seed: ProxySeed) -> Result<EntityRef> {
    let mut de = serde_json::Deserializer::from_str(json);
    let proxy = seed.deserialize(&mut de)?;
    de.end()?;
    Ok(proxy)
}
