//! Error types for rowbroker operations.

use crate::descriptor::KeyGeneration;
use crate::entity::EntityHandle;
use crate::identity::Identity;
use crate::value::Value;
use std::fmt;

/// The primary error type for all broker operations.
#[derive(Debug)]
pub enum Error {
    /// A primary key component is missing and cannot be generated.
    IncompleteKey(IncompleteKeyError),
    /// A lazy reference could not resolve its target.
    DanglingReference(DanglingReferenceError),
    /// A row's lock token no longer matches the value read by the writer.
    OptimisticLock(OptimisticLockConflict),
    /// Failure reported by the statement executor.
    Store(StoreError),
    /// Session or proxy used outside its valid state sequence.
    IllegalState(IllegalStateError),
    /// Unknown type/field/edge or an invalid descriptor registration.
    Descriptor(DescriptorError),
    /// Value could not be converted to the requested type.
    Type(TypeError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IncompleteKeyError {
    /// Logical type whose key is incomplete.
    pub type_name: String,
    /// The primary key field that is unset.
    pub field: &'static str,
    /// Generation policy declared for the field.
    pub generation: KeyGeneration,
}

#[derive(Debug, Clone)]
pub struct DanglingReferenceError {
    /// Identity the proxy tried to resolve.
    pub identity: Identity,
}

/// Raised when a write's expected lock token does not match the stored one.
///
/// Carries the conflicting object so callers can re-fetch and retry.
#[derive(Debug)]
pub struct OptimisticLockConflict {
    pub identity: Identity,
    /// Token the writer read (and expected to overwrite).
    pub expected: Value,
    /// Token found at validation time, when known.
    pub actual: Option<Value>,
    pub entity: Option<EntityHandle>,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    pub sql: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Unique / foreign key / not-null violation
    Constraint,
    /// Connection lost or unreachable store
    Connectivity,
    /// Statement rejected by the store (unknown table, bad arity, ...)
    Statement,
    /// Serialization failure or deadlock (retry may succeed)
    Serialization,
}

#[derive(Debug, Clone)]
pub struct IllegalStateError {
    pub kind: IllegalStateKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalStateKind {
    /// `begin()` while a transaction is already active
    NestedBegin,
    /// Write or boundary operation without an active transaction
    NotActive,
    /// A previous planning error poisoned the pending set
    RollbackOnly,
    /// The session that owns a proxy is gone
    SessionClosed,
    /// A proxy was accessed while it was materializing
    ReentrantMaterialization,
}

#[derive(Debug, Clone)]
pub struct DescriptorError {
    pub kind: DescriptorErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorErrorKind {
    UnknownType,
    UnknownField,
    UnknownEdge,
    InvalidIdentifier,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub field: Option<String>,
}

/// Result type alias for broker operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn incomplete_key(
        type_name: impl Into<String>,
        field: &'static str,
        generation: KeyGeneration,
    ) -> Self {
        Error::IncompleteKey(IncompleteKeyError {
            type_name: type_name.into(),
            field,
            generation,
        })
    }

    pub fn dangling(identity: Identity) -> Self {
        Error::DanglingReference(DanglingReferenceError { identity })
    }

    pub fn illegal_state(kind: IllegalStateKind, message: impl Into<String>) -> Self {
        Error::IllegalState(IllegalStateError {
            kind,
            message: message.into(),
        })
    }

    pub fn descriptor(kind: DescriptorErrorKind, message: impl Into<String>) -> Self {
        Error::Descriptor(DescriptorError {
            kind,
            message: message.into(),
        })
    }

    pub fn store(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            kind,
            message: message.into(),
            sql: None,
            source: None,
        })
    }

    pub fn unknown_field(type_name: &str, field: &str) -> Self {
        Self::descriptor(
            DescriptorErrorKind::UnknownField,
            format!("{type_name} has no field '{field}'"),
        )
    }

    pub fn unknown_edge(type_name: &str, edge: &str) -> Self {
        Self::descriptor(
            DescriptorErrorKind::UnknownEdge,
            format!("{type_name} has no edge '{edge}'"),
        )
    }

    /// Is this an error a caller-level retry may resolve?
    ///
    /// Lock conflicts are retryable after a re-fetch; nothing is retried internally.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticLock(_) => true,
            Error::Store(e) => matches!(e.kind, StoreErrorKind::Serialization),
            _ => false,
        }
    }

    /// The object involved in an optimistic lock conflict, if any.
    pub fn conflicting_entity(&self) -> Option<&EntityHandle> {
        match self {
            Error::OptimisticLock(c) => c.entity.as_ref(),
            _ => None,
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_constraint_violation())
    }

    /// Get the rendered SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Store(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl StoreError {
    /// Attach the statement text for diagnostics.
    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn is_constraint_violation(&self) -> bool {
        self.kind == StoreErrorKind::Constraint
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IncompleteKey(e) => write!(
                f,
                "Incomplete key: {}.{} is unset and key generation is {:?}",
                e.type_name, e.field, e.generation
            ),
            Error::DanglingReference(e) => {
                write!(f, "Dangling reference: {} does not exist", e.identity)
            }
            Error::OptimisticLock(e) => {
                if let Some(actual) = &e.actual {
                    write!(
                        f,
                        "Optimistic lock conflict on {}: expected token {:?}, found {:?}",
                        e.identity, e.expected, actual
                    )
                } else {
                    write!(
                        f,
                        "Optimistic lock conflict on {}: token {:?} is stale",
                        e.identity, e.expected
                    )
                }
            }
            Error::Store(e) => {
                if let Some(sql) = &e.sql {
                    write!(f, "Store error ({:?}): {} [{}]", e.kind, e.message, sql)
                } else {
                    write!(f, "Store error ({:?}): {}", e.kind, e.message)
                }
            }
            Error::IllegalState(e) => write!(f, "Illegal state ({:?}): {}", e.kind, e.message),
            Error::Descriptor(e) => write!(f, "Descriptor error: {}", e.message),
            Error::Type(e) => {
                if let Some(field) = &e.field {
                    write!(
                        f,
                        "Type error in field '{}': expected {}, found {}",
                        field, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_is_retryable() {
        let err = Error::OptimisticLock(OptimisticLockConflict {
            identity: Identity::new("Account", vec![Value::BigInt(7)]),
            expected: Value::BigInt(3),
            actual: None,
            entity: None,
        });
        assert!(err.is_retryable());
        assert!(err.conflicting_entity().is_none());
        assert!(err.to_string().contains("Account[7]"));
    }

    #[test]
    fn test_constraint_error_not_retryable() {
        let err = Error::store(StoreErrorKind::Constraint, "duplicate key");
        assert!(!err.is_retryable());
        assert_eq!(err.sql(), None);
    }

    #[test]
    fn test_store_error_with_sql_display() {
        let Error::Store(inner) = Error::store(StoreErrorKind::Statement, "no such table") else {
            unreachable!()
        };
        let err = Error::Store(inner.with_sql("DELETE FROM \"ghosts\""));
        assert_eq!(err.sql(), Some("DELETE FROM \"ghosts\""));
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_incomplete_key_display() {
        let err = Error::incomplete_key("Parent", "id", KeyGeneration::None);
        assert_eq!(
            err.to_string(),
            "Incomplete key: Parent.id is unset and key generation is None"
        );
    }
}
