//! In-memory store for rowbroker.
//!
//! `rowbroker-memory` is a **test and prototyping backend**. It implements
//! the `StatementExecutor` contract from `rowbroker-core` over plain
//! in-process tables, together with a `KeyGenerator` handing out sequence
//! keys.
//!
//! # Role In The Architecture
//!
//! - [`MemoryStore`] holds the tables. It is cheap to clone; every clone
//!   sees the same data.
//! - [`MemoryConnection`] is one executor over a store, with its own
//!   transaction and statement log. Several connections over one store
//!   behave like concurrent sessions against one database.
//! - [`SequenceKeyGenerator`] implements `KeyGenerator` with per-field
//!   counters.
//!
//! # Isolation
//!
//! Writes are visible to other connections as soon as they execute. A
//! rollback undoes the connection's own writes in reverse order. That is
//! enough to exercise optimistic locking, which never relies on isolation.

pub mod connection;
pub mod keys;
pub mod store;

pub use connection::{ExecutedStatement, MemoryConnection};
pub use keys::SequenceKeyGenerator;
pub use store::MemoryStore;
