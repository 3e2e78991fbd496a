use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attr::{Attr, AttrId, Value};

/// Opaque entity id, globally unique within a store.
///
/// Ids are immutable: a write that changes the id is a create of a new
/// entity, never a rename. Server-minted ids are random uuids, but anything
/// opaque and unique is accepted, which keeps ids like `sb-1` usable in
/// manifests and tests.
#[derive(
	Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
	pub fn random() -> Self {
		Self(Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for EntityId {
	fn from(s: &str) -> Self {
		Self(s.to_owned())
	}
}

impl From<String> for EntityId {
	fn from(s: String) -> Self {
		Self(s)
	}
}

impl std::fmt::Display for EntityId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_millis() as u64
}

/// A record in the store: id, revision, timestamps and an ordered attribute
/// list. Attributes of the same id may repeat (multi-valued).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
	pub id: EntityId,
	/// Bumped on every accepted write, starting at 1.
	pub revision: u64,
	pub created_at: u64,
	pub updated_at: u64,
	pub attrs: Vec<Attr>,
}

impl Entity {
	/// A fresh, unwritten entity. Revision and timestamps are assigned by the
	/// store on insert.
	pub fn new(id: EntityId) -> Self {
		Self {
			id,
			revision: 0,
			created_at: 0,
			updated_at: 0,
			attrs: Vec::new(),
		}
	}

	/// First value for `attr`, if any.
	pub fn first(&self, attr: AttrId) -> Option<&Value> {
		self.attrs.iter().find(|a| a.id == attr).map(|a| &a.value)
	}

	/// All values for `attr`, in attribute order.
	pub fn all(&self, attr: AttrId) -> impl Iterator<Item = &Value> {
		self.attrs.iter().filter(move |a| a.id == attr).map(|a| &a.value)
	}

	/// Appends an attribute, keeping any existing values for the same id.
	pub fn push(&mut self, attr: Attr) -> &mut Self {
		self.attrs.push(attr);
		self
	}

	/// Replaces all values of `attr.id` with the single given value.
	pub fn set(&mut self, attr: Attr) -> &mut Self {
		self.attrs.retain(|a| a.id != attr.id);
		self.attrs.push(attr);
		self
	}

	pub fn remove(&mut self, attr: AttrId) -> &mut Self {
		self.attrs.retain(|a| a.id != attr);
		self
	}
}

/// The kind of mutation a watcher observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
	Create,
	Update,
	Delete,
}

impl OpKind {
	/// Wire enum value (stable, see the entity wire format).
	pub fn wire(self) -> i64 {
		match self {
			OpKind::Create => 1,
			OpKind::Update => 2,
			OpKind::Delete => 3,
		}
	}

	pub fn from_wire(v: i64) -> Option<Self> {
		match v {
			1 => Some(OpKind::Create),
			2 => Some(OpKind::Update),
			3 => Some(OpKind::Delete),
			_ => None,
		}
	}
}

/// One accepted mutation, as delivered to watchers in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOp {
	pub op: OpKind,
	/// The entity after the mutation. Absent for deletes.
	pub entity: Option<Entity>,
	/// Revision before the mutation. Absent for creates.
	pub previous: Option<u64>,
	pub entity_id: EntityId,
}

impl EntityOp {
	pub fn create(entity: Entity) -> Self {
		Self {
			op: OpKind::Create,
			entity_id: entity.id.clone(),
			previous: None,
			entity: Some(entity),
		}
	}

	pub fn update(entity: Entity, previous: u64) -> Self {
		Self {
			op: OpKind::Update,
			entity_id: entity.id.clone(),
			previous: Some(previous),
			entity: Some(entity),
		}
	}

	pub fn delete(entity_id: EntityId, previous: u64) -> Self {
		Self {
			op: OpKind::Delete,
			entity: None,
			previous: Some(previous),
			entity_id,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::attr;

	#[test]
	fn multi_valued_attrs_keep_order() {
		let mut e = Entity::new(EntityId::from("e-1"));
		e.push(Attr::str(attr::SANDBOX_CONTAINER, "a"))
			.push(Attr::str(attr::SANDBOX_CONTAINER, "b"));
		let vals: Vec<_> = e
			.all(attr::SANDBOX_CONTAINER)
			.map(|v| v.as_str().unwrap().to_owned())
			.collect();
		assert_eq!(vals, ["a", "b"]);
	}

	#[test]
	fn set_replaces_all_values() {
		let mut e = Entity::new(EntityId::from("e-1"));
		e.push(Attr::str(attr::ROUTE_HOST, "a.com"))
			.push(Attr::str(attr::ROUTE_HOST, "b.com"));
		e.set(Attr::str(attr::ROUTE_HOST, "c.com"));
		assert_eq!(e.all(attr::ROUTE_HOST).count(), 1);
	}
}
