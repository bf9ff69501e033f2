//! Core types and collaborator contracts for rowbroker.
//!
//! This crate provides the foundations the persistence broker is built on:
//!
//! - `Value` and `Row` for field data
//! - `Identity` naming one persistent object
//! - `DescriptorLookup` and `DescriptorRegistry` for type-to-table mapping
//! - `Entity`, the explicit accessor table every managed type implements
//! - `EntityRef`, the lazy reference proxy
//! - `StatementExecutor` and `KeyGenerator`, the external collaborators

pub mod descriptor;
pub mod entity;
pub mod error;
pub mod executor;
pub mod identifiers;
pub mod identity;
pub mod proxy;
pub mod row;
pub mod value;

pub use descriptor::{
    CascadePolicies, CascadePolicy, ColumnBinding, DescriptorLookup, DescriptorRegistry,
    EdgeDescriptor, EdgeKind, EdgeOrdering, EntityDescriptor, Extent, ExtentStrategy,
    FieldDescriptor, KeyGeneration, LinkTable, LockKind, TableSegment,
};
pub use entity::{
    Entity, EntityHandle, handle, handle_addr, read_as, read_entity, same_entity, write_as,
    write_entity,
};
pub use error::{
    DanglingReferenceError, DescriptorError, DescriptorErrorKind, Error, IllegalStateError,
    IllegalStateKind, IncompleteKeyError, OptimisticLockConflict, Result, StoreError,
    StoreErrorKind, TypeError,
};
pub use executor::{
    BrokerContext, KeyGenerator, Statement, StatementExecutor, StatementKind, StatementOutcome,
    StatementShape,
};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use identity::{Identity, IdentityKey, identity_of};
pub use proxy::{EntityRef, Materializer, ProxySeed, SessionHandle, proxy_from_json};
pub use row::{ColumnInfo, Row};
pub use value::Value;
