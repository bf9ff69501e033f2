//! Object identity: the (type, key) pair naming one stored row.

use crate::descriptor::DescriptorLookup;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// The key half of an [`Identity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IdentityKey {
    /// Primary key values in declared order.
    Assigned(Vec<Value>),
    /// Placeholder for an object whose key the store generates on insert.
    ///
    /// Only lives for the duration of one transaction.
    Provisional(u64),
}

/// Uniquely names one persistent object.
///
/// The type part is always the extent root, so a `Student` and the
/// `Person` row it extends share a single identity. Equality and hashing
/// are structural over the type name and canonicalized key values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    type_name: String,
    key: IdentityKey,
}

impl Identity {
    /// Build an identity from key values. Integer widths are canonicalized.
    pub fn new(type_name: impl Into<String>, key: Vec<Value>) -> Self {
        Self {
            type_name: type_name.into(),
            key: IdentityKey::Assigned(key.iter().map(Value::canonical).collect()),
        }
    }

    pub fn provisional(type_name: impl Into<String>, slot: u64) -> Self {
        Self {
            type_name: type_name.into(),
            key: IdentityKey::Provisional(slot),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// Assigned key values, or `None` for a provisional identity.
    pub fn values(&self) -> Option<&[Value]> {
        match &self.key {
            IdentityKey::Assigned(values) => Some(values),
            IdentityKey::Provisional(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.key, IdentityKey::Provisional(_))
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        if self.type_name != other.type_name {
            return false;
        }
        match (&self.key, &other.key) {
            (IdentityKey::Assigned(a), IdentityKey::Assigned(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            (IdentityKey::Provisional(a), IdentityKey::Provisional(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name.hash(state);
        match &self.key {
            IdentityKey::Assigned(values) => {
                0u8.hash(state);
                values.len().hash(state);
                for v in values {
                    v.hash_into(state);
                }
            }
            IdentityKey::Provisional(slot) => {
                1u8.hash(state);
                slot.hash(state);
            }
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdentityKey::Assigned(values) => {
                write!(f, "{}[", self.type_name)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            IdentityKey::Provisional(slot) => write!(f, "{}[#{}]", self.type_name, slot),
        }
    }
}

/// Compute the identity of `entity` from its primary key fields.
///
/// Fails with `IncompleteKey` when any key component is NULL; callers that
/// can generate keys must do so before asking.
pub fn identity_of(entity: &dyn Entity, lookup: &dyn DescriptorLookup) -> Result<Identity> {
    let type_name = entity.entity_type();
    let root = lookup.identity_type(type_name)?;
    let mut key = Vec::new();
    for field in lookup.key_fields(type_name)? {
        let value = entity.field(field.name)?;
        if value.is_null() {
            return Err(Error::incomplete_key(
                type_name,
                field.name,
                field.key_generation,
            ));
        }
        key.push(value);
    }
    Ok(Identity::new(root, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_structural_equality() {
        let a = Identity::new("Parent", vec![Value::Int(1)]);
        let b = Identity::new("Parent", vec![Value::BigInt(1)]);
        let c = Identity::new("Child", vec![Value::BigInt(1)]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn test_provisional_never_equals_assigned() {
        let p = Identity::provisional("Parent", 1);
        let a = Identity::new("Parent", vec![Value::BigInt(1)]);
        assert_ne!(p, a);
        assert!(p.is_provisional());
        assert!(p.values().is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Identity::new("Link", vec![Value::BigInt(1), Value::from("x")]).to_string(),
            "Link[1, \"x\"]"
        );
        assert_eq!(Identity::provisional("Tag", 4).to_string(), "Tag[#4]");
    }

    #[test]
    fn test_serde_roundtrip_keeps_equality() {
        let id = Identity::new("Parent", vec![Value::BigInt(7)]);
        let json = serde_json::to_string(&id).unwrap();
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
