//! Type-to-table mapping metadata.
//!
//! Descriptors are built once at startup into a [`DescriptorRegistry`] and
//! handed to sessions as an explicit read-only context through the
//! [`DescriptorLookup`] trait.

use crate::entity::EntityHandle;
use crate::error::{DescriptorErrorKind, Error, Result};
use crate::identifiers::is_valid_identifier;
use std::collections::HashMap;

/// How a primary key component is produced when the object has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyGeneration {
    /// The caller must assign the key.
    #[default]
    None,
    /// Drawn from the key generator before the insert is planned.
    Sequence,
    /// Produced by the store when the row is inserted.
    Store,
}

/// Kind of optimistic lock token carried by a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Integer counter, starts at 0.
    Version,
    /// Microseconds since the epoch, strictly increasing per row.
    Timestamp,
}

/// Mapping of one field to one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub column: &'static str,
    pub primary_key: bool,
    pub key_generation: KeyGeneration,
    pub lock: Option<LockKind>,
    pub nullable: bool,
}

impl FieldDescriptor {
    /// A nullable, non-key field whose column has the same name.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            column: name,
            primary_key: false,
            key_generation: KeyGeneration::None,
            lock: None,
            nullable: true,
        }
    }

    /// Override the column name.
    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        if value {
            self.nullable = false;
        }
        self
    }

    pub const fn generated(mut self, generation: KeyGeneration) -> Self {
        self.key_generation = generation;
        self
    }

    /// Make this field the optimistic lock token of its extent family.
    pub const fn lock(mut self, kind: LockKind) -> Self {
        self.lock = Some(kind);
        self.nullable = false;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn binding(&self) -> ColumnBinding {
        ColumnBinding {
            column: self.column,
            field: self.name,
        }
    }
}

/// How far an operation propagates across an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// The edge is neither read nor written.
    #[default]
    None,
    /// Only the linkage (foreign key columns or link rows) is touched.
    Link,
    /// The operation recurses into the target object.
    Full,
}

/// Independent policies for the three operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadePolicies {
    pub retrieve: CascadePolicy,
    pub store: CascadePolicy,
    pub delete: CascadePolicy,
}

impl CascadePolicies {
    pub const fn new(retrieve: CascadePolicy, store: CascadePolicy, delete: CascadePolicy) -> Self {
        Self {
            retrieve,
            store,
            delete,
        }
    }

    pub const fn uniform(policy: CascadePolicy) -> Self {
        Self::new(policy, policy, policy)
    }
}

impl Default for CascadePolicies {
    /// Lazy retrieval, linkage-only store, no delete propagation.
    fn default() -> Self {
        Self::new(CascadePolicy::Link, CascadePolicy::Link, CascadePolicy::None)
    }
}

/// Intermediary table backing a many-to-many edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTable {
    pub table: &'static str,
    /// Columns holding the owner's key, in key order.
    pub owner_columns: &'static [&'static str],
    /// Columns holding the target's key, in key order.
    pub target_columns: &'static [&'static str],
}

impl LinkTable {
    pub const fn new(
        table: &'static str,
        owner_columns: &'static [&'static str],
        target_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table,
            owner_columns,
            target_columns,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Single target; the owner holds the foreign key fields.
    Reference,
    /// Many targets; each target holds foreign key fields naming the owner.
    Collection,
    /// Many targets joined through an intermediary table.
    ManyToMany(LinkTable),
}

/// Which side's row must exist first on insert.
///
/// Deletes run in the opposite order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOrdering {
    TargetFirst,
    OwnerFirst,
}

/// A reference, collection, or many-to-many association of an owner type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeDescriptor {
    pub name: &'static str,
    pub target: &'static str,
    pub kind: EdgeKind,
    /// Reference: owner fields, in the target's key order.
    /// Collection: target fields, in the owner's key order.
    pub foreign_key: &'static [&'static str],
    pub ordering: EdgeOrdering,
    pub cascade: CascadePolicies,
}

impl EdgeDescriptor {
    pub const fn reference(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            target,
            kind: EdgeKind::Reference,
            foreign_key,
            ordering: EdgeOrdering::TargetFirst,
            cascade: CascadePolicies::new(
                CascadePolicy::Link,
                CascadePolicy::Link,
                CascadePolicy::None,
            ),
        }
    }

    pub const fn collection(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            target,
            kind: EdgeKind::Collection,
            foreign_key,
            ordering: EdgeOrdering::OwnerFirst,
            cascade: CascadePolicies::new(
                CascadePolicy::Link,
                CascadePolicy::Link,
                CascadePolicy::None,
            ),
        }
    }

    pub const fn many_to_many(name: &'static str, target: &'static str, link: LinkTable) -> Self {
        Self {
            name,
            target,
            kind: EdgeKind::ManyToMany(link),
            foreign_key: &[],
            ordering: EdgeOrdering::OwnerFirst,
            cascade: CascadePolicies::new(
                CascadePolicy::Link,
                CascadePolicy::Link,
                CascadePolicy::None,
            ),
        }
    }

    pub const fn cascade(mut self, policies: CascadePolicies) -> Self {
        self.cascade = policies;
        self
    }

    pub const fn retrieve(mut self, policy: CascadePolicy) -> Self {
        self.cascade.retrieve = policy;
        self
    }

    pub const fn store(mut self, policy: CascadePolicy) -> Self {
        self.cascade.store = policy;
        self
    }

    pub const fn delete(mut self, policy: CascadePolicy) -> Self {
        self.cascade.delete = policy;
        self
    }

    /// Override the declared precedence between owner and target rows.
    pub const fn ordering(mut self, ordering: EdgeOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub const fn is_to_many(&self) -> bool {
        !matches!(self.kind, EdgeKind::Reference)
    }

    pub const fn link_table(&self) -> Option<&LinkTable> {
        match &self.kind {
            EdgeKind::ManyToMany(link) => Some(link),
            _ => None,
        }
    }
}

/// Storage strategy of an extent family, declared identically on every member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentStrategy {
    /// All members share the root table.
    SingleTable { discriminator_column: &'static str },
    /// Each level stores its own fields in its own table, joined by key.
    TablePerSubtype { discriminator_column: &'static str },
}

impl ExtentStrategy {
    pub const fn discriminator_column(&self) -> &'static str {
        match self {
            ExtentStrategy::SingleTable {
                discriminator_column,
            }
            | ExtentStrategy::TablePerSubtype {
                discriminator_column,
            } => discriminator_column,
        }
    }
}

/// Membership of a type in an extent family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub root: &'static str,
    pub parent: Option<&'static str>,
    /// Value stored in the discriminator column for rows of this exact type.
    pub discriminator: &'static str,
    pub strategy: ExtentStrategy,
}

impl Extent {
    pub const fn root(type_name: &'static str, discriminator: &'static str, strategy: ExtentStrategy) -> Self {
        Self {
            root: type_name,
            parent: None,
            discriminator,
            strategy,
        }
    }

    pub const fn child_of(parent: &Extent, parent_type: &'static str, discriminator: &'static str) -> Self {
        Self {
            root: parent.root,
            parent: Some(parent_type),
            discriminator,
            strategy: parent.strategy,
        }
    }
}

/// Full mapping of one managed type.
#[derive(Debug, Clone, Copy)]
pub struct EntityDescriptor {
    pub type_name: &'static str,
    pub table: &'static str,
    /// Fields declared on this type; inherited fields come from the parent.
    pub fields: &'static [FieldDescriptor],
    pub edges: &'static [EdgeDescriptor],
    pub extent: Option<Extent>,
    /// Builds an empty instance for hydration.
    pub factory: fn() -> EntityHandle,
}

impl EntityDescriptor {
    pub const fn new(type_name: &'static str, table: &'static str, factory: fn() -> EntityHandle) -> Self {
        Self {
            type_name,
            table,
            fields: &[],
            edges: &[],
            extent: None,
            factory,
        }
    }

    pub const fn fields(mut self, fields: &'static [FieldDescriptor]) -> Self {
        self.fields = fields;
        self
    }

    pub const fn edges(mut self, edges: &'static [EdgeDescriptor]) -> Self {
        self.edges = edges;
        self
    }

    pub const fn extent(mut self, extent: Extent) -> Self {
        self.extent = Some(extent);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn edge(&self, name: &str) -> Option<&EdgeDescriptor> {
        self.edges.iter().find(|e| e.name == name)
    }

    pub fn parent(&self) -> Option<&'static str> {
        self.extent.and_then(|e| e.parent)
    }
}

/// Column-to-field pairing within a table segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnBinding {
    pub column: &'static str,
    pub field: &'static str,
}

/// One table's share of an object's row(s).
///
/// Plain and single-table types have one segment. Table-per-subtype types
/// have one per level, root first, all keyed by the root's key columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSegment {
    pub table: &'static str,
    pub key_columns: Vec<ColumnBinding>,
    /// Data columns, excluding key and lock columns.
    pub columns: Vec<ColumnBinding>,
    pub lock_column: Option<ColumnBinding>,
    /// `(column, value)` naming the concrete type, on the root segment only.
    pub discriminator: Option<(&'static str, &'static str)>,
}

impl TableSegment {
    /// Does this segment store `field` (as key, data, or lock column)?
    pub fn stores_field(&self, field: &str) -> bool {
        self.key_columns
            .iter()
            .chain(self.columns.iter())
            .chain(self.lock_column.iter())
            .any(|b| b.field == field)
    }

    pub fn column_for(&self, field: &str) -> Option<&'static str> {
        self.key_columns
            .iter()
            .chain(self.columns.iter())
            .chain(self.lock_column.iter())
            .find(|b| b.field == field)
            .map(|b| b.column)
    }
}

const MAX_EXTENT_DEPTH: usize = 32;

/// Read-only metadata lookup consumed by the broker.
///
/// Implementors provide `describe` and `resolve_discriminator`; everything
/// else is derived.
pub trait DescriptorLookup: Send + Sync {
    fn describe(&self, type_name: &str) -> Result<&EntityDescriptor>;

    /// Concrete type of a row in `root`'s family carrying `value`.
    fn resolve_discriminator(&self, root: &str, value: &str) -> Result<&EntityDescriptor>;

    /// Descriptors from the extent root down to `type_name`.
    fn lineage(&self, type_name: &str) -> Result<Vec<&EntityDescriptor>> {
        let mut chain = vec![self.describe(type_name)?];
        loop {
            let next = chain.last().and_then(|d| d.parent());
            let Some(parent) = next else { break };
            if chain.len() >= MAX_EXTENT_DEPTH {
                return Err(Error::descriptor(
                    DescriptorErrorKind::Invalid,
                    format!("extent chain of {type_name} is too deep"),
                ));
            }
            chain.push(self.describe(parent)?);
        }
        chain.reverse();
        Ok(chain)
    }

    /// All mapped fields, inherited ones first.
    fn fields_of(&self, type_name: &str) -> Result<Vec<&FieldDescriptor>> {
        Ok(self
            .lineage(type_name)?
            .into_iter()
            .flat_map(|d| d.fields.iter())
            .collect())
    }

    /// All edges, inherited ones first, each level in declaration order.
    fn edges_of(&self, type_name: &str) -> Result<Vec<&EdgeDescriptor>> {
        Ok(self
            .lineage(type_name)?
            .into_iter()
            .flat_map(|d| d.edges.iter())
            .collect())
    }

    fn field_of(&self, type_name: &str, field: &str) -> Result<&FieldDescriptor> {
        self.fields_of(type_name)?
            .into_iter()
            .find(|f| f.name == field)
            .ok_or_else(|| Error::unknown_field(type_name, field))
    }

    fn edge_of(&self, type_name: &str, edge: &str) -> Result<&EdgeDescriptor> {
        self.edges_of(type_name)?
            .into_iter()
            .find(|e| e.name == edge)
            .ok_or_else(|| Error::unknown_edge(type_name, edge))
    }

    /// Primary key fields in declared order.
    fn key_fields(&self, type_name: &str) -> Result<Vec<&FieldDescriptor>> {
        Ok(self
            .fields_of(type_name)?
            .into_iter()
            .filter(|f| f.primary_key)
            .collect())
    }

    fn lock_field(&self, type_name: &str) -> Result<Option<&FieldDescriptor>> {
        Ok(self
            .fields_of(type_name)?
            .into_iter()
            .find(|f| f.lock.is_some()))
    }

    /// Type name used in identities: the extent root, or the type itself.
    fn identity_type(&self, type_name: &str) -> Result<&'static str> {
        let desc = self.describe(type_name)?;
        Ok(desc.extent.map_or(desc.type_name, |e| e.root))
    }

    /// Is `type_name` the same as, or a descendant of, `ancestor`?
    fn is_a(&self, type_name: &str, ancestor: &str) -> Result<bool> {
        Ok(self
            .lineage(type_name)?
            .iter()
            .any(|d| d.type_name == ancestor))
    }

    /// Tables holding `type_name`'s rows, in insert order.
    fn table_layout(&self, type_name: &str) -> Result<Vec<TableSegment>> {
        let lineage = self.lineage(type_name)?;
        let (Some(root), Some(leaf)) = (lineage.first(), lineage.last()) else {
            return Err(Error::descriptor(
                DescriptorErrorKind::UnknownType,
                format!("no descriptor for {type_name}"),
            ));
        };
        let key_columns: Vec<ColumnBinding> = root
            .fields
            .iter()
            .filter(|f| f.primary_key)
            .map(FieldDescriptor::binding)
            .collect();
        let discriminator = leaf
            .extent
            .map(|e| (e.strategy.discriminator_column(), e.discriminator));
        let data = |d: &EntityDescriptor| -> Vec<ColumnBinding> {
            d.fields
                .iter()
                .filter(|f| !f.primary_key && f.lock.is_none())
                .map(FieldDescriptor::binding)
                .collect()
        };
        let lock_of = |d: &EntityDescriptor| -> Option<ColumnBinding> {
            d.fields
                .iter()
                .find(|f| f.lock.is_some())
                .map(FieldDescriptor::binding)
        };

        match leaf.extent.map(|e| e.strategy) {
            Some(ExtentStrategy::TablePerSubtype { .. }) => Ok(lineage
                .iter()
                .enumerate()
                .map(|(level, d)| TableSegment {
                    table: d.table,
                    key_columns: key_columns.clone(),
                    columns: data(d),
                    lock_column: lock_of(d),
                    discriminator: if level == 0 { discriminator } else { None },
                })
                .collect()),
            _ => Ok(vec![TableSegment {
                table: root.table,
                key_columns,
                columns: lineage.iter().flat_map(|d| data(d)).collect(),
                lock_column: lineage.iter().find_map(|d| lock_of(d)),
                discriminator,
            }]),
        }
    }
}

/// In-memory [`DescriptorLookup`] built at startup.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    types: HashMap<&'static str, EntityDescriptor>,
    discriminators: HashMap<(&'static str, &'static str), &'static str>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, descriptor: EntityDescriptor) -> Result<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }

    /// Add a descriptor. Parents must be registered before their subtypes.
    ///
    /// Checks everything that can be checked from this type's own lineage;
    /// cross-type references are checked by [`validate`](Self::validate).
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<()> {
        let name = descriptor.type_name;
        if self.types.contains_key(name) {
            return Err(invalid(format!("{name} is already registered")));
        }
        check_identifiers(&descriptor)?;

        let own_keys = descriptor.fields.iter().filter(|f| f.primary_key).count();
        let own_locks = descriptor.fields.iter().filter(|f| f.lock.is_some()).count();
        if let Some(field) = descriptor
            .fields
            .iter()
            .find(|f| f.primary_key && f.lock.is_some())
        {
            return Err(invalid(format!(
                "{name}.{} cannot be both key and lock token",
                field.name
            )));
        }

        let mut inherited_locks = 0;
        match descriptor.extent {
            Some(extent) if extent.parent.is_some() || extent.root != name => {
                let Some(parent_name) = extent.parent else {
                    return Err(invalid(format!(
                        "{name} names extent root {} but has no parent",
                        extent.root
                    )));
                };
                let parent = self.describe(parent_name)?;
                let Some(parent_extent) = parent.extent else {
                    return Err(invalid(format!(
                        "{name} extends {parent_name}, which is not in an extent family"
                    )));
                };
                if parent_extent.root != extent.root || parent_extent.strategy != extent.strategy {
                    return Err(invalid(format!(
                        "{name} disagrees with {parent_name} on extent root or strategy"
                    )));
                }
                if own_keys > 0 {
                    return Err(invalid(format!(
                        "{name} is a subtype and cannot declare key fields"
                    )));
                }
                if let ExtentStrategy::SingleTable { .. } = extent.strategy {
                    let root_table = self.describe(extent.root)?.table;
                    if root_table != descriptor.table {
                        return Err(invalid(format!(
                            "{name} must share table {root_table} with its single-table family"
                        )));
                    }
                }
                inherited_locks = self
                    .fields_of(parent_name)?
                    .iter()
                    .filter(|f| f.lock.is_some())
                    .count();
                if let Some(existing) = self.discriminators.get(&(extent.root, extent.discriminator)) {
                    return Err(invalid(format!(
                        "discriminator '{}' of {name} is already used by {existing}",
                        extent.discriminator
                    )));
                }
            }
            _ => {
                if own_keys == 0 {
                    return Err(invalid(format!("{name} declares no primary key field")));
                }
            }
        }
        if own_locks + inherited_locks > 1 {
            return Err(invalid(format!(
                "{name} has more than one lock-managed field in its extent family"
            )));
        }

        let own_fields: Vec<&str> = descriptor.fields.iter().map(|f| f.name).collect();
        let inherited: Vec<&'static str> = match descriptor.parent() {
            Some(parent) => self.fields_of(parent)?.iter().map(|f| f.name).collect(),
            None => Vec::new(),
        };
        for edge in descriptor.edges {
            if let EdgeKind::Reference = edge.kind {
                for fk in edge.foreign_key {
                    if !own_fields.contains(fk) && !inherited.contains(fk) {
                        return Err(Error::descriptor(
                            DescriptorErrorKind::UnknownField,
                            format!(
                                "edge {name}.{} names missing foreign key field '{fk}'",
                                edge.name
                            ),
                        ));
                    }
                }
            }
        }

        if let Some(extent) = descriptor.extent {
            self.discriminators
                .insert((extent.root, extent.discriminator), name);
        }
        tracing::trace!(type_name = name, table = descriptor.table, "registered descriptor");
        self.types.insert(name, descriptor);
        Ok(())
    }

    /// Check references between registered types: edge targets exist,
    /// collection foreign keys live on the target, and key arities match.
    pub fn validate(&self) -> Result<()> {
        for desc in self.types.values() {
            let owner_keys = self.key_fields(desc.type_name)?.len();
            for edge in desc.edges {
                let target_keys = self.key_fields(edge.target)?.len();
                match &edge.kind {
                    EdgeKind::Reference => {
                        if edge.foreign_key.len() != target_keys {
                            return Err(arity(desc.type_name, edge.name));
                        }
                    }
                    EdgeKind::Collection => {
                        if edge.foreign_key.len() != owner_keys {
                            return Err(arity(desc.type_name, edge.name));
                        }
                        for fk in edge.foreign_key {
                            self.field_of(edge.target, fk)?;
                        }
                    }
                    EdgeKind::ManyToMany(link) => {
                        if link.owner_columns.len() != owner_keys
                            || link.target_columns.len() != target_keys
                        {
                            return Err(arity(desc.type_name, edge.name));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl DescriptorLookup for DescriptorRegistry {
    fn describe(&self, type_name: &str) -> Result<&EntityDescriptor> {
        self.types.get(type_name).ok_or_else(|| {
            Error::descriptor(
                DescriptorErrorKind::UnknownType,
                format!("no descriptor registered for {type_name}"),
            )
        })
    }

    fn resolve_discriminator(&self, root: &str, value: &str) -> Result<&EntityDescriptor> {
        let found = self
            .discriminators
            .iter()
            .find(|((r, v), _)| *r == root && *v == value)
            .map(|(_, t)| *t);
        match found {
            Some(type_name) => self.describe(type_name),
            None => Err(Error::descriptor(
                DescriptorErrorKind::UnknownType,
                format!("no member of {root} has discriminator '{value}'"),
            )),
        }
    }
}

fn invalid(message: String) -> Error {
    Error::descriptor(DescriptorErrorKind::Invalid, message)
}

fn arity(type_name: &str, edge: &str) -> Error {
    invalid(format!(
        "edge {type_name}.{edge} key column count does not match the key it names"
    ))
}

fn check_identifiers(d: &EntityDescriptor) -> Result<()> {
    let mut names: Vec<&str> = vec![d.type_name, d.table];
    for f in d.fields {
        names.push(f.name);
        names.push(f.column);
    }
    for e in d.edges {
        names.push(e.name);
        names.extend(e.foreign_key.iter().copied());
        if let EdgeKind::ManyToMany(link) = &e.kind {
            names.push(link.table);
            names.extend(link.owner_columns.iter().copied());
            names.extend(link.target_columns.iter().copied());
        }
    }
    if let Some(extent) = d.extent {
        names.push(extent.strategy.discriminator_column());
    }
    match names.into_iter().find(|n| !is_valid_identifier(n)) {
        Some(bad) => Err(Error::descriptor(
            DescriptorErrorKind::InvalidIdentifier,
            format!("'{bad}' in {} is not a valid identifier", d.type_name),
        )),
        None => Ok(()),
    }
}
