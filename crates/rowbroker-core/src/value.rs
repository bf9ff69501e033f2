//! Dynamic field values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed field value.
///
/// Every field read from or written to an entity travels as a `Value`,
/// and statements carry them as bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Timestamp(v) => Some(*v),
            Value::Date(v) => Some(i64::from(*v)),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            #[allow(clippy::cast_precision_loss)]
            Value::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Canonical form used inside identities.
    ///
    /// Integer widths collapse to `BigInt` so a key read back as `Int(1)`
    /// and a generated `BigInt(1)` name the same object.
    #[must_use]
    pub fn canonical(&self) -> Value {
        match self {
            Value::Int(v) => Value::BigInt(i64::from(*v)),
            other => other.clone(),
        }
    }

    /// Structural equality, with floats compared by bit pattern.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    /// Feed a structural hash of this value into `state`.
    ///
    /// Consistent with [`Value::same_as`]: equal values hash equally.
    pub fn hash_into<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::BigInt(i) => {
                3u8.hash(state);
                i.hash(state);
            }
            Value::Double(f) => {
                4u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Text(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                6u8.hash(state);
                b.hash(state);
            }
            Value::Date(d) => {
                7u8.hash(state);
                d.hash(state);
            }
            Value::Timestamp(ts) => {
                8u8.hash(state);
                ts.hash(state);
            }
            Value::Uuid(u) => {
                9u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                10u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(i) | Value::Timestamp(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "{d}"),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = crate::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| {
            crate::Error::Type(crate::error::TypeError {
                expected: "i64",
                actual: value.type_name().to_string(),
                field: None,
            })
        })
    }
}

impl TryFrom<Value> for String {
    type Error = crate::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(crate::Error::Type(crate::error::TypeError {
                expected: "String",
                actual: other.type_name().to_string(),
                field: None,
            })),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = crate::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| {
            crate::Error::Type(crate::error::TypeError {
                expected: "bool",
                actual: value.type_name().to_string(),
                field: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash_into(&mut h);
        h.finish()
    }

    #[test]
    fn test_canonical_collapses_int_width() {
        assert_eq!(Value::Int(5).canonical(), Value::BigInt(5));
        assert_eq!(Value::Text("a".into()).canonical(), Value::Text("a".into()));
    }

    #[test]
    fn test_same_as_compares_float_bits() {
        let nan = Value::Double(f64::NAN);
        assert!(nan.same_as(&nan.clone()));
        assert_ne!(nan, nan.clone());
        assert!(!Value::Double(0.0).same_as(&Value::Double(-0.0)));
    }

    #[test]
    fn test_hash_consistent_with_same_as() {
        assert_eq!(hash_of(&Value::BigInt(9)), hash_of(&Value::BigInt(9)));
        assert_ne!(hash_of(&Value::BigInt(9)), hash_of(&Value::Int(9)));
        assert_eq!(
            hash_of(&Value::Double(1.5)),
            hash_of(&Value::Double(1.5))
        );
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i64> = None;
        assert!(Value::from(none).is_null());
        assert_eq!(Value::from(Some(3_i64)), Value::BigInt(3));
    }

    #[test]
    fn test_try_from_mismatch() {
        let err = i64::try_from(Value::Text("x".into())).unwrap_err();
        assert!(err.to_string().contains("expected i64"));
        assert_eq!(String::try_from(Value::from("ok")).unwrap(), "ok");
        assert!(bool::try_from(Value::Int(1)).unwrap());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::BigInt(42).to_string(), "42");
        assert_eq!(Value::from("hi").to_string(), "\"hi\"");
    }
}
