//! The accessor table every managed type exposes to the broker.

use crate::error::{Error, Result, TypeError};
use crate::proxy::EntityRef;
use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Field and edge accessors for a managed domain type.
///
/// The broker never reflects over objects: it reads and writes mapped fields
/// by name through this table and walks edges through the reference and
/// collection accessors. Edge accessors default to "unknown edge" so types
/// without associations only implement the field methods.
pub trait Entity: Any + Send + Sync + fmt::Debug {
    /// Logical type name, as registered with the descriptor lookup.
    fn entity_type(&self) -> &'static str;

    /// Read a mapped field.
    fn field(&self, name: &str) -> Result<Value>;

    /// Write a mapped field.
    fn set_field(&mut self, name: &str, value: Value) -> Result<()>;

    /// Current target of a single-valued edge.
    fn reference(&self, edge: &str) -> Result<Option<EntityRef>> {
        Err(Error::unknown_edge(self.entity_type(), edge))
    }

    fn set_reference(&mut self, edge: &str, target: Option<EntityRef>) -> Result<()> {
        let _ = target;
        Err(Error::unknown_edge(self.entity_type(), edge))
    }

    /// Current members of a collection or many-to-many edge.
    fn collection(&self, edge: &str) -> Result<Vec<EntityRef>> {
        Err(Error::unknown_edge(self.entity_type(), edge))
    }

    fn set_collection(&mut self, edge: &str, items: Vec<EntityRef>) -> Result<()> {
        let _ = items;
        Err(Error::unknown_edge(self.entity_type(), edge))
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared, interior-mutable reference to a managed object.
///
/// The identity map hands out clones of one handle per identity, so
/// `same_entity` on two lookups of the same identity is always true.
pub type EntityHandle = Arc<RwLock<dyn Entity>>;

/// Wrap a concrete object in a handle.
pub fn handle<E: Entity>(entity: E) -> EntityHandle {
    Arc::new(RwLock::new(entity))
}

/// Acquire a read guard, recovering from poisoning.
pub fn read_entity(handle: &EntityHandle) -> RwLockReadGuard<'_, dyn Entity> {
    handle.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire a write guard, recovering from poisoning.
pub fn write_entity(handle: &EntityHandle) -> RwLockWriteGuard<'_, dyn Entity> {
    handle.write().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` against the concrete type behind `handle`.
///
/// Returns `None` if the handle holds a different type.
pub fn read_as<E: Entity, R>(handle: &EntityHandle, f: impl FnOnce(&E) -> R) -> Option<R> {
    let guard = read_entity(handle);
    guard.as_any().downcast_ref::<E>().map(f)
}

/// Mutable counterpart of [`read_as`].
pub fn write_as<E: Entity, R>(handle: &EntityHandle, f: impl FnOnce(&mut E) -> R) -> Option<R> {
    let mut guard = write_entity(handle);
    guard.as_any_mut().downcast_mut::<E>().map(f)
}

/// Do two handles point at the same object?
pub fn same_entity(a: &EntityHandle, b: &EntityHandle) -> bool {
    handle_addr(a) == handle_addr(b)
}

/// Stable address of the object behind a handle, usable as a map key.
pub fn handle_addr(handle: &EntityHandle) -> usize {
    Arc::as_ptr(handle).cast::<()>() as usize
}

/// Convert a field value for a typed setter, mapping NULL to `None`.
///
/// ```
/// use rowbroker_core::{Value, entity::field_value};
///
/// let id: Option<i64> = field_value(Value::Int(3), "id").unwrap();
/// assert_eq!(id, Some(3));
/// let none: Option<i64> = field_value(Value::Null, "id").unwrap();
/// assert_eq!(none, None);
/// ```
pub fn field_value<T>(value: Value, field: &str) -> Result<Option<T>>
where
    T: TryFrom<Value, Error = Error>,
{
    if value.is_null() {
        return Ok(None);
    }
    T::try_from(value).map(Some).map_err(|e| match e {
        Error::Type(TypeError {
            expected, actual, ..
        }) => Error::Type(TypeError {
            expected,
            actual,
            field: Some(field.to_string()),
        }),
        other => other,
    })
}
