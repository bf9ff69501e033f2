//! Sequence-style key generation.

use rowbroker_core::{KeyGenerator, Result, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Hands out `1, 2, 3, ...` independently for each `(type, field)` pair,
/// or from one counter for everything when built with [`shared`].
///
/// [`shared`]: SequenceKeyGenerator::shared
#[derive(Debug)]
pub struct SequenceKeyGenerator {
    start: i64,
    shared: bool,
    counters: Mutex<HashMap<(String, String), i64>>,
}

impl Default for SequenceKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceKeyGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(start: i64) -> Self {
        Self {
            start,
            shared: false,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// One sequence across every type and field.
    pub fn shared() -> Self {
        Self {
            shared: true,
            ..Self::new()
        }
    }
}

impl KeyGenerator for SequenceKeyGenerator {
    fn next_key(&self, type_name: &str, field: &str) -> Result<Value> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = if self.shared {
            (String::new(), String::new())
        } else {
            (type_name.to_string(), field.to_string())
        };
        let next = counters.entry(counter).or_insert(self.start);
        let key = *next;
        *next += 1;
        tracing::trace!(type_name, field, key, "generated key");
        Ok(Value::BigInt(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_field() {
        let keys = SequenceKeyGenerator::new();
        assert_eq!(keys.next_key("Parent", "id").unwrap(), Value::BigInt(1));
        assert_eq!(keys.next_key("Parent", "id").unwrap(), Value::BigInt(2));
        assert_eq!(keys.next_key("Child", "id").unwrap(), Value::BigInt(1));
    }

    #[test]
    fn test_shared_sequence() {
        let keys = SequenceKeyGenerator::shared();
        assert_eq!(keys.next_key("Parent", "id").unwrap(), Value::BigInt(1));
        assert_eq!(keys.next_key("Child", "id").unwrap(), Value::BigInt(2));
    }

    #[test]
    fn test_starting_at() {
        let keys = SequenceKeyGenerator::starting_at(100);
        assert_eq!(keys.next_key("T", "id").unwrap(), Value::BigInt(100));
    }
}
