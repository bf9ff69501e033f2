//! Optimistic lock token handling.
//!
//! Every update and delete of a lock-managed row carries the token the
//! writer read. The store applies the write only if the row still carries
//! that token; an update also writes the advanced token in the same
//! statement. A write that matches no row is a conflict.

use crate::operation::{LockStamp, PendingOperation};
use rowbroker_core::{
    Entity, EntityHandle, Error, FieldDescriptor, Identity, LockKind, OptimisticLockConflict,
    Result, StatementKind, StatementOutcome, TypeError, Value,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in microseconds since the epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// Stamps, validates, and advances lock tokens.
#[derive(Debug, Clone, Copy)]
pub struct OptimisticLockManager {
    clock: fn() -> i64,
}

impl Default for OptimisticLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticLockManager {
    pub fn new() -> Self {
        Self { clock: now_micros }
    }

    /// Use a fixed clock for timestamp tokens.
    pub fn with_clock(clock: fn() -> i64) -> Self {
        Self { clock }
    }

    /// Initial token for a row about to be inserted.
    pub fn initial_token(&self, kind: LockKind) -> Value {
        match kind {
            LockKind::Version => Value::BigInt(0),
            LockKind::Timestamp => Value::Timestamp((self.clock)()),
        }
    }

    /// Set the lock field of an object about to be inserted.
    pub fn stamp_for_insert(&self, entity: &mut dyn Entity, field: &FieldDescriptor) -> Result<Value> {
        let Some(kind) = field.lock else {
            return entity.field(field.name);
        };
        let token = self.initial_token(kind);
        entity.set_field(field.name, token.clone())?;
        Ok(token)
    }

    /// Token following `previous`.
    ///
    /// Versions increment. Timestamps take the current time but never go
    /// backwards or repeat.
    pub fn advance(&self, kind: LockKind, previous: &Value) -> Result<Value> {
        match kind {
            LockKind::Version => match previous {
                Value::Int(v) => Ok(Value::Int(v.saturating_add(1))),
                Value::Null => Ok(Value::BigInt(0)),
                other => other
                    .as_i64()
                    .map(|v| Value::BigInt(v.saturating_add(1)))
                    .ok_or_else(|| token_type_error("version", other)),
            },
            LockKind::Timestamp => {
                let prev = match previous {
                    Value::Null => i64::MIN,
                    other => other
                        .as_i64()
                        .ok_or_else(|| token_type_error("timestamp", other))?,
                };
                Ok(Value::Timestamp((self.clock)().max(prev.saturating_add(1))))
            }
        }
    }

    /// Compare the token read earlier with the one the object carries now,
    /// and compute the token to write.
    ///
    /// `snapshot` is the token recorded when the object was loaded or last
    /// written; without one the object's own token is taken as read.
    pub fn validate_and_advance(
        &self,
        identity: &Identity,
        handle: &EntityHandle,
        field: &FieldDescriptor,
        snapshot: Option<&Value>,
    ) -> Result<LockStamp> {
        let Some(kind) = field.lock else {
            return Err(Error::Custom(format!(
                "{} is not a lock-managed field",
                field.name
            )));
        };
        let current = rowbroker_core::read_entity(handle).field(field.name)?;
        let expected = snapshot.cloned().unwrap_or_else(|| current.clone());
        if !current.canonical().same_as(&expected.canonical()) {
            tracing::warn!(
                identity = %identity,
                expected = %expected,
                found = %current,
                "lock token changed since it was read"
            );
            return Err(conflict(identity, expected, Some(current), Some(handle.clone())));
        }
        let next = self.advance(kind, &expected)?;
        Ok(LockStamp {
            field: field.name,
            expected,
            next,
        })
    }

    /// Turn a zero-row update or delete of a lock-managed row into a conflict.
    pub fn check_outcome(&self, op: &PendingOperation, outcome: &StatementOutcome) -> Result<()> {
        let Some(stamp) = &op.lock else {
            return Ok(());
        };
        if op.kind == StatementKind::Insert || outcome.rows_affected > 0 {
            return Ok(());
        }
        tracing::warn!(
            identity = %op.identity,
            expected = %stamp.expected,
            kind = %op.kind,
            "optimistic lock conflict"
        );
        Err(conflict(
            &op.identity,
            stamp.expected.clone(),
            None,
            op.target.clone(),
        ))
    }
}

fn conflict(
    identity: &Identity,
    expected: Value,
    actual: Option<Value>,
    entity: Option<EntityHandle>,
) -> Error {
    Error::OptimisticLock(OptimisticLockConflict {
        identity: identity.clone(),
        expected,
        actual,
        entity,
    })
}

fn token_type_error(expected: &'static str, found: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: found.type_name().to_string(),
        field: None,
    })
}
