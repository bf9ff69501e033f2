//! rowbroker - an object/relational persistence broker core.
//!
//! rowbroker sits between plain Rust objects and a row store, providing:
//!
//! - An identity map: one in-memory object per persistent identity
//! - Cascading store and delete over references, collections and
//!   many-to-many edges
//! - Lazy references that load their target on first access
//! - Optimistic locking with version or timestamp tokens
//! - Deferred, batched writes flushed in dependency order at commit
//!
//! SQL generation, connection handling and key sequences are collaborators
//! behind narrow traits ([`StatementExecutor`], [`KeyGenerator`],
//! [`DescriptorLookup`]). The [`memory`] module ships an in-process store
//! implementing them.
//!
//! # Quick Start
//!
//! ```ignore
//! use rowbroker::prelude::*;
//!
//! const FIELDS: &[FieldDescriptor] = &[
//!     FieldDescriptor::new("id").primary_key(true).generated(KeyGeneration::Sequence),
//!     FieldDescriptor::new("name"),
//! ];
//!
//! let registry = DescriptorRegistry::new()
//!     .with(EntityDescriptor::new("Hero", "heroes", Hero::empty).fields(FIELDS))?;
//! let context = BrokerContext::new(Arc::new(registry))
//!     .with_key_generator(Arc::new(SequenceKeyGenerator::new()));
//!
//! let store = MemoryStore::new();
//! store.define_table("heroes", &["id"]);
//!
//! let mut session = Session::new(context, Arc::new(store.connect()));
//! session.begin()?;
//! session.store(&handle(Hero::named("Spider-Man")))?;
//! session.commit()?;
//! ```

pub use rowbroker_core::{
    BrokerContext, CascadePolicies, CascadePolicy, ColumnBinding, DanglingReferenceError,
    DescriptorError, DescriptorErrorKind, DescriptorLookup, DescriptorRegistry, EdgeDescriptor,
    EdgeKind, EdgeOrdering, Entity, EntityDescriptor, EntityHandle, EntityRef, Error, Extent,
    ExtentStrategy, FieldDescriptor, Identity, IdentityKey, IllegalStateError, IllegalStateKind,
    IncompleteKeyError, KeyGeneration, KeyGenerator, LinkTable, LockKind, Materializer,
    OptimisticLockConflict, ProxySeed, Result, Row, SessionHandle, Statement, StatementExecutor,
    StatementKind, StatementOutcome, StatementShape, StoreError, StoreErrorKind, TableSegment,
    TypeError, Value, handle, identity_of, proxy_from_json, read_as, read_entity, same_entity,
    write_as, write_entity,
};
pub use rowbroker_core::entity::field_value;
pub use rowbroker_session::{
    BatchCoordinator, CascadeOperation, FlushResult, ObjectCache, OptimisticLockManager,
    PendingOperation, Session, SessionConfig, SessionEvent, SessionState,
};

/// In-process store and key generator.
pub mod memory {
    pub use rowbroker_memory::{
        ExecutedStatement, MemoryConnection, MemoryStore, SequenceKeyGenerator,
    };
}

/// Everything needed to declare types and run sessions.
pub mod prelude {
    pub use crate::memory::{MemoryStore, SequenceKeyGenerator};
    pub use crate::{
        BrokerContext, CascadePolicies, CascadePolicy, DescriptorLookup, DescriptorRegistry,
        EdgeDescriptor, EdgeOrdering, Entity, EntityDescriptor, EntityHandle, EntityRef, Error,
        Extent, ExtentStrategy, FieldDescriptor, Identity, KeyGeneration, LinkTable, LockKind,
        Result, Session, SessionConfig, StatementExecutor, Value, field_value, handle, read_as,
        write_as,
    };
    pub use std::sync::Arc;
}
