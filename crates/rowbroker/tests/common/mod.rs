//! Shared fixtures: a small domain model, its descriptors, and an
//! in-memory store with every table defined.

#![allow(dead_code)]

use rowbroker::memory::{MemoryConnection, MemoryStore, SequenceKeyGenerator};
use rowbroker::{
    BrokerContext, CascadePolicies, CascadePolicy, DescriptorRegistry, EdgeDescriptor, Entity,
    EntityDescriptor, EntityHandle, EntityRef, Error, Extent, ExtentStrategy, FieldDescriptor,
    KeyGeneration, LinkTable, LockKind, Result, Session, SessionConfig, Value, field_value,
    handle, read_entity, write_as,
};
use std::any::Any;
use std::sync::Arc;

const FULL: CascadePolicies = CascadePolicies::uniform(CascadePolicy::Full);

// ============================================================================
// Parent / Child: sequence keys, FULL collection, FULL reference
// ============================================================================

#[derive(Debug, Default)]
pub struct Parent {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub favorite_id: Option<i64>,
    pub favorite: Option<EntityRef>,
    pub children: Vec<EntityRef>,
}

impl Entity for Parent {
    fn entity_type(&self) -> &'static str {
        "Parent"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "name" => Ok(self.name.clone().into()),
            "favorite_id" => Ok(self.favorite_id.into()),
            _ => Err(Error::unknown_field("Parent", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "name" => self.name = field_value(value, name)?,
            "favorite_id" => self.favorite_id = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Parent", name)),
        }
        Ok(())
    }
    fn reference(&self, edge: &str) -> Result<Option<EntityRef>> {
        match edge {
            "favorite" => Ok(self.favorite.clone()),
            _ => Err(Error::unknown_edge("Parent", edge)),
        }
    }
    fn set_reference(&mut self, edge: &str, target: Option<EntityRef>) -> Result<()> {
        match edge {
            "favorite" => {
                self.favorite = target;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Parent", edge)),
        }
    }
    fn collection(&self, edge: &str) -> Result<Vec<EntityRef>> {
        match edge {
            "children" => Ok(self.children.clone()),
            _ => Err(Error::unknown_edge("Parent", edge)),
        }
    }
    fn set_collection(&mut self, edge: &str, items: Vec<EntityRef>) -> Result<()> {
        match edge {
            "children" => {
                self.children = items;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Parent", edge)),
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Child {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub parent_id: Option<i64>,
}

impl Entity for Child {
    fn entity_type(&self) -> &'static str {
        "Child"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "name" => Ok(self.name.clone().into()),
            "parent_id" => Ok(self.parent_id.into()),
            _ => Err(Error::unknown_field("Child", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "name" => self.name = field_value(value, name)?,
            "parent_id" => self.parent_id = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Child", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const PARENT_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id")
        .primary_key(true)
        .generated(KeyGeneration::Sequence),
    FieldDescriptor::new("name"),
    FieldDescriptor::new("favorite_id"),
];
const PARENT_EDGES: &[EdgeDescriptor] = &[
    EdgeDescriptor::reference("favorite", "Child", &["favorite_id"]).store(CascadePolicy::Full),
    EdgeDescriptor::collection("children", "Child", &["parent_id"]).cascade(FULL),
];
const CHILD_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id")
        .primary_key(true)
        .generated(KeyGeneration::Sequence),
    FieldDescriptor::new("name"),
    FieldDescriptor::new("parent_id"),
];

fn new_parent() -> EntityHandle {
    handle(Parent::default())
}

fn new_child() -> EntityHandle {
    handle(Child::default())
}

pub fn parent(name: &str) -> EntityHandle {
    handle(Parent {
        name: Some(name.to_string()),
        ..Parent::default()
    })
}

pub fn child(name: &str) -> EntityHandle {
    handle(Child {
        name: Some(name.to_string()),
        ..Child::default()
    })
}

pub fn add_child(parent: &EntityHandle, child: &EntityHandle) {
    write_as::<Parent, _>(parent, |p| p.children.push(EntityRef::to(Arc::clone(child))));
}

pub fn set_favorite(parent: &EntityHandle, child: &EntityHandle) {
    write_as::<Parent, _>(parent, |p| p.favorite = Some(EntityRef::to(Arc::clone(child))));
}

// ============================================================================
// Node: self-referencing, assigned keys
// ============================================================================

#[derive(Debug, Default)]
pub struct Node {
    pub id: Option<i64>,
    pub label: Option<String>,
    pub next_id: Option<i64>,
    pub next: Option<EntityRef>,
}

impl Entity for Node {
    fn entity_type(&self) -> &'static str {
        "Node"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "label" => Ok(self.label.clone().into()),
            "next_id" => Ok(self.next_id.into()),
            _ => Err(Error::unknown_field("Node", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "label" => self.label = field_value(value, name)?,
            "next_id" => self.next_id = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Node", name)),
        }
        Ok(())
    }
    fn reference(&self, edge: &str) -> Result<Option<EntityRef>> {
        match edge {
            "next" => Ok(self.next.clone()),
            _ => Err(Error::unknown_edge("Node", edge)),
        }
    }
    fn set_reference(&mut self, edge: &str, target: Option<EntityRef>) -> Result<()> {
        match edge {
            "next" => {
                self.next = target;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Node", edge)),
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const NODE_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("label"),
    FieldDescriptor::new("next_id"),
];
const NODE_EDGES: &[EdgeDescriptor] =
    &[EdgeDescriptor::reference("next", "Node", &["next_id"]).cascade(FULL)];

fn new_node() -> EntityHandle {
    handle(Node::default())
}

pub fn node(id: i64, label: &str) -> EntityHandle {
    handle(Node {
        id: Some(id),
        label: Some(label.to_string()),
        ..Node::default()
    })
}

pub fn point(from: &EntityHandle, to: &EntityHandle) {
    write_as::<Node, _>(from, |n| n.next = Some(EntityRef::to(Arc::clone(to))));
}

// ============================================================================
// Team / Player: LINK collection, NONE reference
// ============================================================================

#[derive(Debug, Default)]
pub struct Team {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub captain_id: Option<i64>,
    pub captain: Option<EntityRef>,
    pub players: Vec<EntityRef>,
}

impl Entity for Team {
    fn entity_type(&self) -> &'static str {
        "Team"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "name" => Ok(self.name.clone().into()),
            "captain_id" => Ok(self.captain_id.into()),
            _ => Err(Error::unknown_field("Team", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "name" => self.name = field_value(value, name)?,
            "captain_id" => self.captain_id = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Team", name)),
        }
        Ok(())
    }
    fn reference(&self, edge: &str) -> Result<Option<EntityRef>> {
        match edge {
            "captain" => Ok(self.captain.clone()),
            _ => Err(Error::unknown_edge("Team", edge)),
        }
    }
    fn set_reference(&mut self, edge: &str, target: Option<EntityRef>) -> Result<()> {
        match edge {
            "captain" => {
                self.captain = target;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Team", edge)),
        }
    }
    fn collection(&self, edge: &str) -> Result<Vec<EntityRef>> {
        match edge {
            "players" => Ok(self.players.clone()),
            _ => Err(Error::unknown_edge("Team", edge)),
        }
    }
    fn set_collection(&mut self, edge: &str, items: Vec<EntityRef>) -> Result<()> {
        match edge {
            "players" => {
                self.players = items;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Team", edge)),
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Player {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub team_id: Option<i64>,
}

impl Entity for Player {
    fn entity_type(&self) -> &'static str {
        "Player"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "name" => Ok(self.name.clone().into()),
            "team_id" => Ok(self.team_id.into()),
            _ => Err(Error::unknown_field("Player", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "name" => self.name = field_value(value, name)?,
            "team_id" => self.team_id = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Player", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const TEAM_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("name"),
    FieldDescriptor::new("captain_id"),
];
const TEAM_EDGES: &[EdgeDescriptor] = &[
    EdgeDescriptor::reference("captain", "Player", &["captain_id"])
        .cascade(CascadePolicies::uniform(CascadePolicy::None)),
    EdgeDescriptor::collection("players", "Player", &["team_id"])
        .cascade(CascadePolicies::uniform(CascadePolicy::Link)),
];
const PLAYER_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("name"),
    FieldDescriptor::new("team_id"),
];

fn new_team() -> EntityHandle {
    handle(Team::default())
}

fn new_player() -> EntityHandle {
    handle(Player::default())
}

pub fn team(id: i64, name: &str) -> EntityHandle {
    handle(Team {
        id: Some(id),
        name: Some(name.to_string()),
        ..Team::default()
    })
}

pub fn player(id: i64, name: &str) -> EntityHandle {
    handle(Player {
        id: Some(id),
        name: Some(name.to_string()),
        ..Player::default()
    })
}

// ============================================================================
// Person / Student: single-table extent
// ============================================================================

#[derive(Debug, Default)]
pub struct Person {
    pub id: Option<i64>,
    pub name: Option<String>,
}

impl Entity for Person {
    fn entity_type(&self) -> &'static str {
        "Person"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "name" => Ok(self.name.clone().into()),
            _ => Err(Error::unknown_field("Person", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "name" => self.name = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Person", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Student {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub school: Option<String>,
}

impl Entity for Student {
    fn entity_type(&self) -> &'static str {
        "Student"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "name" => Ok(self.name.clone().into()),
            "school" => Ok(self.school.clone().into()),
            _ => Err(Error::unknown_field("Student", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "name" => self.name = field_value(value, name)?,
            "school" => self.school = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Student", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const PERSON_EXTENT: Extent = Extent::root(
    "Person",
    "person",
    ExtentStrategy::SingleTable {
        discriminator_column: "kind",
    },
);
const PERSON_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("name"),
];
const STUDENT_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("school")];

fn new_person() -> EntityHandle {
    handle(Person::default())
}

fn new_student() -> EntityHandle {
    handle(Student::default())
}

pub fn person(id: i64, name: &str) -> EntityHandle {
    handle(Person {
        id: Some(id),
        name: Some(name.to_string()),
    })
}

pub fn student(id: i64, name: &str, school: &str) -> EntityHandle {
    handle(Student {
        id: Some(id),
        name: Some(name.to_string()),
        school: Some(school.to_string()),
    })
}

// ============================================================================
// Vehicle / Car: table-per-subtype extent
// ============================================================================

#[derive(Debug, Default)]
pub struct Vehicle {
    pub id: Option<i64>,
    pub make: Option<String>,
}

impl Entity for Vehicle {
    fn entity_type(&self) -> &'static str {
        "Vehicle"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "make" => Ok(self.make.clone().into()),
            _ => Err(Error::unknown_field("Vehicle", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "make" => self.make = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Vehicle", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Car {
    pub id: Option<i64>,
    pub make: Option<String>,
    pub doors: Option<i64>,
}

impl Entity for Car {
    fn entity_type(&self) -> &'static str {
        "Car"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "make" => Ok(self.make.clone().into()),
            "doors" => Ok(self.doors.into()),
            _ => Err(Error::unknown_field("Car", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "make" => self.make = field_value(value, name)?,
            "doors" => self.doors = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Car", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const VEHICLE_EXTENT: Extent = Extent::root(
    "Vehicle",
    "vehicle",
    ExtentStrategy::TablePerSubtype {
        discriminator_column: "kind",
    },
);
const VEHICLE_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("make"),
];
const CAR_FIELDS: &[FieldDescriptor] = &[FieldDescriptor::new("doors")];

fn new_vehicle() -> EntityHandle {
    handle(Vehicle::default())
}

fn new_car() -> EntityHandle {
    handle(Car::default())
}

pub fn car(id: i64, make: &str, doors: i64) -> EntityHandle {
    handle(Car {
        id: Some(id),
        make: Some(make.to_string()),
        doors: Some(doors),
    })
}

// ============================================================================
// Post / Tag: many-to-many through post_tags
// ============================================================================

#[derive(Debug, Default)]
pub struct Post {
    pub id: Option<i64>,
    pub title: Option<String>,
    pub tags: Vec<EntityRef>,
}

impl Entity for Post {
    fn entity_type(&self) -> &'static str {
        "Post"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "title" => Ok(self.title.clone().into()),
            _ => Err(Error::unknown_field("Post", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "title" => self.title = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Post", name)),
        }
        Ok(())
    }
    fn collection(&self, edge: &str) -> Result<Vec<EntityRef>> {
        match edge {
            "tags" => Ok(self.tags.clone()),
            _ => Err(Error::unknown_edge("Post", edge)),
        }
    }
    fn set_collection(&mut self, edge: &str, items: Vec<EntityRef>) -> Result<()> {
        match edge {
            "tags" => {
                self.tags = items;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Post", edge)),
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Tag {
    pub id: Option<i64>,
    pub label: Option<String>,
    pub posts: Vec<EntityRef>,
}

impl Entity for Tag {
    fn entity_type(&self) -> &'static str {
        "Tag"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "label" => Ok(self.label.clone().into()),
            _ => Err(Error::unknown_field("Tag", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "label" => self.label = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Tag", name)),
        }
        Ok(())
    }
    fn collection(&self, edge: &str) -> Result<Vec<EntityRef>> {
        match edge {
            "posts" => Ok(self.posts.clone()),
            _ => Err(Error::unknown_edge("Tag", edge)),
        }
    }
    fn set_collection(&mut self, edge: &str, items: Vec<EntityRef>) -> Result<()> {
        match edge {
            "posts" => {
                self.posts = items;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Tag", edge)),
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const POST_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("title"),
];
const POST_EDGES: &[EdgeDescriptor] = &[EdgeDescriptor::many_to_many(
    "tags",
    "Tag",
    LinkTable::new("post_tags", &["post_id"], &["tag_id"]),
)
.cascade(CascadePolicies::new(
    CascadePolicy::Link,
    CascadePolicy::Full,
    CascadePolicy::Link,
))];
const TAG_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("label"),
];
const TAG_EDGES: &[EdgeDescriptor] = &[EdgeDescriptor::many_to_many(
    "posts",
    "Post",
    LinkTable::new("post_tags", &["tag_id"], &["post_id"]),
)];

fn new_post() -> EntityHandle {
    handle(Post::default())
}

fn new_tag() -> EntityHandle {
    handle(Tag::default())
}

pub fn post(id: i64, title: &str) -> EntityHandle {
    handle(Post {
        id: Some(id),
        title: Some(title.to_string()),
        ..Post::default()
    })
}

pub fn tag(id: i64, label: &str) -> EntityHandle {
    handle(Tag {
        id: Some(id),
        label: Some(label.to_string()),
        ..Tag::default()
    })
}

pub fn add_tag(post: &EntityHandle, tag: &EntityHandle) {
    write_as::<Post, _>(post, |p| p.tags.push(EntityRef::to(Arc::clone(tag))));
}

// ============================================================================
// Account: version-locked
// ============================================================================

#[derive(Debug, Default)]
pub struct Account {
    pub id: Option<i64>,
    pub owner: Option<String>,
    pub balance: Option<i64>,
    pub version: Option<i64>,
}

impl Entity for Account {
    fn entity_type(&self) -> &'static str {
        "Account"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "owner" => Ok(self.owner.clone().into()),
            "balance" => Ok(self.balance.into()),
            "version" => Ok(self.version.into()),
            _ => Err(Error::unknown_field("Account", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "owner" => self.owner = field_value(value, name)?,
            "balance" => self.balance = field_value(value, name)?,
            "version" => self.version = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Account", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const ACCOUNT_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("owner"),
    FieldDescriptor::new("balance"),
    FieldDescriptor::new("version").lock(LockKind::Version),
];

fn new_account() -> EntityHandle {
    handle(Account::default())
}

pub fn account(id: i64, owner: &str, balance: i64) -> EntityHandle {
    handle(Account {
        id: Some(id),
        owner: Some(owner.to_string()),
        balance: Some(balance),
        version: None,
    })
}

// ============================================================================
// Invoice / Line: store-generated keys
// ============================================================================

#[derive(Debug, Default)]
pub struct Invoice {
    pub id: Option<i64>,
    pub number: Option<String>,
    pub lines: Vec<EntityRef>,
}

impl Entity for Invoice {
    fn entity_type(&self) -> &'static str {
        "Invoice"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "number" => Ok(self.number.clone().into()),
            _ => Err(Error::unknown_field("Invoice", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "number" => self.number = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Invoice", name)),
        }
        Ok(())
    }
    fn collection(&self, edge: &str) -> Result<Vec<EntityRef>> {
        match edge {
            "lines" => Ok(self.lines.clone()),
            _ => Err(Error::unknown_edge("Invoice", edge)),
        }
    }
    fn set_collection(&mut self, edge: &str, items: Vec<EntityRef>) -> Result<()> {
        match edge {
            "lines" => {
                self.lines = items;
                Ok(())
            }
            _ => Err(Error::unknown_edge("Invoice", edge)),
        }
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct Line {
    pub id: Option<i64>,
    pub invoice_id: Option<i64>,
    pub amount: Option<i64>,
}

impl Entity for Line {
    fn entity_type(&self) -> &'static str {
        "Line"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "invoice_id" => Ok(self.invoice_id.into()),
            "amount" => Ok(self.amount.into()),
            _ => Err(Error::unknown_field("Line", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "invoice_id" => self.invoice_id = field_value(value, name)?,
            "amount" => self.amount = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Line", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const INVOICE_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id")
        .primary_key(true)
        .generated(KeyGeneration::Store),
    FieldDescriptor::new("number"),
];
const INVOICE_EDGES: &[EdgeDescriptor] =
    &[EdgeDescriptor::collection("lines", "Line", &["invoice_id"]).cascade(FULL)];
const LINE_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id")
        .primary_key(true)
        .generated(KeyGeneration::Store),
    FieldDescriptor::new("invoice_id"),
    FieldDescriptor::new("amount"),
];

fn new_invoice() -> EntityHandle {
    handle(Invoice::default())
}

fn new_line() -> EntityHandle {
    handle(Line::default())
}

pub fn invoice(number: &str) -> EntityHandle {
    handle(Invoice {
        number: Some(number.to_string()),
        ..Invoice::default()
    })
}

pub fn add_line(invoice: &EntityHandle, amount: i64) -> EntityHandle {
    let line = handle(Line {
        amount: Some(amount),
        ..Line::default()
    });
    write_as::<Invoice, _>(invoice, |i| i.lines.push(EntityRef::to(Arc::clone(&line))));
    line
}

// ============================================================================
// Memo: timestamp lock token
// ============================================================================

#[derive(Debug, Default)]
pub struct Memo {
    pub id: Option<i64>,
    pub body: Option<String>,
    pub stamped: Option<i64>,
}

impl Entity for Memo {
    fn entity_type(&self) -> &'static str {
        "Memo"
    }
    fn field(&self, name: &str) -> Result<Value> {
        match name {
            "id" => Ok(self.id.into()),
            "body" => Ok(self.body.clone().into()),
            "stamped" => Ok(self.stamped.map_or(Value::Null, Value::Timestamp)),
            _ => Err(Error::unknown_field("Memo", name)),
        }
    }
    fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = field_value(value, name)?,
            "body" => self.body = field_value(value, name)?,
            "stamped" => self.stamped = field_value(value, name)?,
            _ => return Err(Error::unknown_field("Memo", name)),
        }
        Ok(())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

const MEMO_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("id").primary_key(true),
    FieldDescriptor::new("body"),
    FieldDescriptor::new("stamped").lock(LockKind::Timestamp),
];

fn new_memo() -> EntityHandle {
    handle(Memo::default())
}

pub fn memo(id: i64, body: &str) -> EntityHandle {
    handle(Memo {
        id: Some(id),
        body: Some(body.to_string()),
        stamped: None,
    })
}

// ============================================================================
// Wiring
// ============================================================================

pub fn registry() -> DescriptorRegistry {
    let descriptors = [
        EntityDescriptor::new("Parent", "parents", new_parent)
            .fields(PARENT_FIELDS)
            .edges(PARENT_EDGES),
        EntityDescriptor::new("Child", "children", new_child).fields(CHILD_FIELDS),
        EntityDescriptor::new("Node", "nodes", new_node)
            .fields(NODE_FIELDS)
            .edges(NODE_EDGES),
        EntityDescriptor::new("Team", "teams", new_team)
            .fields(TEAM_FIELDS)
            .edges(TEAM_EDGES),
        EntityDescriptor::new("Player", "players", new_player).fields(PLAYER_FIELDS),
        EntityDescriptor::new("Person", "people", new_person)
            .fields(PERSON_FIELDS)
            .extent(PERSON_EXTENT),
        EntityDescriptor::new("Student", "people", new_student)
            .fields(STUDENT_FIELDS)
            .extent(Extent::child_of(&PERSON_EXTENT, "Person", "student")),
        EntityDescriptor::new("Vehicle", "vehicles", new_vehicle)
            .fields(VEHICLE_FIELDS)
            .extent(VEHICLE_EXTENT),
        EntityDescriptor::new("Car", "cars", new_car)
            .fields(CAR_FIELDS)
            .extent(Extent::child_of(&VEHICLE_EXTENT, "Vehicle", "car")),
        EntityDescriptor::new("Post", "posts", new_post)
            .fields(POST_FIELDS)
            .edges(POST_EDGES),
        EntityDescriptor::new("Tag", "tags", new_tag)
            .fields(TAG_FIELDS)
            .edges(TAG_EDGES),
        EntityDescriptor::new("Account", "accounts", new_account).fields(ACCOUNT_FIELDS),
        EntityDescriptor::new("Invoice", "invoices", new_invoice)
            .fields(INVOICE_FIELDS)
            .edges(INVOICE_EDGES),
        EntityDescriptor::new("Line", "lines", new_line).fields(LINE_FIELDS),
        EntityDescriptor::new("Memo", "memos", new_memo).fields(MEMO_FIELDS),
    ];
    let mut registry = DescriptorRegistry::new();
    for descriptor in descriptors {
        registry.register(descriptor).expect("fixture descriptor registers");
    }
    registry.validate().expect("fixture descriptors are consistent");
    registry
}

/// Context with a single shared key sequence starting at 1.
pub fn context() -> BrokerContext {
    BrokerContext::new(Arc::new(registry()))
        .with_key_generator(Arc::new(SequenceKeyGenerator::shared()))
}

pub fn memory_store() -> MemoryStore {
    let store = MemoryStore::new();
    for table in [
        "parents", "children", "nodes", "teams", "players", "people", "vehicles", "cars",
        "posts", "tags", "accounts", "invoices", "lines", "memos",
    ] {
        store.define_table(table, &["id"]);
    }
    store.define_table("post_tags", &["post_id", "tag_id"]);
    store
}

/// A session over a fresh connection to `store`. The returned connection
/// shares its statement log with the session's.
pub fn open(store: &MemoryStore, context: &BrokerContext) -> (Session, MemoryConnection) {
    open_with(store, context, SessionConfig::default())
}

pub fn open_with(
    store: &MemoryStore,
    context: &BrokerContext,
    config: SessionConfig,
) -> (Session, MemoryConnection) {
    let conn = store.connect();
    let session = Session::with_config(context.clone(), Arc::new(conn.clone()), config);
    (session, conn)
}

pub fn value(entity: &EntityHandle, field: &str) -> Value {
    read_entity(entity).field(field).expect("field is mapped")
}

pub fn int(entity: &EntityHandle, field: &str) -> Option<i64> {
    value(entity, field).as_i64()
}

pub fn text(entity: &EntityHandle, field: &str) -> Option<String> {
    value(entity, field).as_str().map(str::to_string)
}

/// Value of `column` in the stored row of `table` keyed by `id`.
pub fn stored(store: &MemoryStore, table: &str, id: i64, column: &str) -> Option<Value> {
    store
        .get(table, &[Value::BigInt(id)])
        .and_then(|row| row.get_by_name(column).cloned())
}
