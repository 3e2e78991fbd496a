//! Self-describing wire records.
//!
//! A record is a map from stable numeric field ids to tagged values. Both wire
//! dialects (compact CBOR-style binary and JSON) serialize the same structure
//! and must decode to identical records; unknown field ids round-trip
//! untouched. Field ids are append-only; removal is forbidden.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::attr::{Attr, AttrId, Value};
use crate::entity::{Entity, EntityId, EntityOp, OpKind};
use crate::error::Error;
use crate::Result;

/// A tagged record value.
///
/// Adjacent tagging keeps the encoding self-describing in both dialects:
/// `{"t":"str","v":"..."}` in JSON, the isomorphic map form in binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum RecordValue {
	Bool(bool),
	Int(i64),
	Str(String),
	Bytes(Bytes),
	List(Vec<RecordValue>),
	Rec(Record),
}

/// Field id → value map. The unit of payload exchange on the RPC surface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub BTreeMap<u32, RecordValue>);

impl Record {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&mut self, field: u32, value: RecordValue) -> &mut Self {
		self.0.insert(field, value);
		self
	}

	pub fn get(&self, field: u32) -> Option<&RecordValue> {
		self.0.get(&field)
	}

	pub fn str(&self, field: u32) -> Option<&str> {
		match self.get(field) {
			Some(RecordValue::Str(s)) => Some(s),
			_ => None,
		}
	}

	pub fn int(&self, field: u32) -> Option<i64> {
		match self.get(field) {
			Some(RecordValue::Int(v)) => Some(*v),
			_ => None,
		}
	}

	pub fn list(&self, field: u32) -> Option<&[RecordValue]> {
		match self.get(field) {
			Some(RecordValue::List(vs)) => Some(vs),
			_ => None,
		}
	}

	pub fn rec(&self, field: u32) -> Option<&Record> {
		match self.get(field) {
			Some(RecordValue::Rec(r)) => Some(r),
			_ => None,
		}
	}
}

// Entity record field ids.
const F_ENTITY_ID: u32 = 0;
const F_ENTITY_REVISION: u32 = 1;
const F_ENTITY_CREATED_AT: u32 = 2;
const F_ENTITY_UPDATED_AT: u32 = 3;
const F_ENTITY_ATTRS: u32 = 4;

// Attr record field ids.
const F_ATTR_ID: u32 = 0;
const F_ATTR_TYPE: u32 = 1;
const F_ATTR_VALUE: u32 = 2;
const F_ATTR_GROUP: u32 = 3;

// EntityOp record field ids.
const F_OP_ENTITY: u32 = 0;
const F_OP_PREVIOUS: u32 = 1;
const F_OP_OPERATION: u32 = 2;
const F_OP_ENTITY_ID: u32 = 3;

// Attr value type tags.
const T_STR: i64 = 1;
const T_INT: i64 = 2;
const T_BOOL: i64 = 3;
const T_BYTES: i64 = 4;
const T_REF: i64 = 5;
const T_SYM: i64 = 6;

fn encode_value(value: &Value, out: &mut Record) {
	match value {
		Value::Str(s) => {
			out.set(F_ATTR_TYPE, RecordValue::Int(T_STR));
			out.set(F_ATTR_VALUE, RecordValue::Str(s.clone()));
		}
		Value::Int(v) => {
			out.set(F_ATTR_TYPE, RecordValue::Int(T_INT));
			out.set(F_ATTR_VALUE, RecordValue::Int(*v));
		}
		Value::Bool(v) => {
			out.set(F_ATTR_TYPE, RecordValue::Int(T_BOOL));
			out.set(F_ATTR_VALUE, RecordValue::Bool(*v));
		}
		Value::Bytes(b) => {
			out.set(F_ATTR_TYPE, RecordValue::Int(T_BYTES));
			out.set(F_ATTR_VALUE, RecordValue::Bytes(b.clone()));
		}
		Value::Ref(id) => {
			out.set(F_ATTR_TYPE, RecordValue::Int(T_REF));
			out.set(F_ATTR_VALUE, RecordValue::Str(id.to_string()));
		}
		Value::Sym { group, name } => {
			out.set(F_ATTR_TYPE, RecordValue::Int(T_SYM));
			out.set(F_ATTR_VALUE, RecordValue::Str(name.clone()));
			out.set(F_ATTR_GROUP, RecordValue::Str(group.clone()));
		}
	}
}

fn decode_value(rec: &Record) -> Result<Value> {
	let tag = rec
		.int(F_ATTR_TYPE)
		.ok_or_else(|| Error::Invalid("attr record missing type tag".into()))?;
	let value = match tag {
		T_STR => Value::Str(
			rec.str(F_ATTR_VALUE)
				.ok_or_else(|| Error::Invalid("str attr without value".into()))?
				.to_owned(),
		),
		T_INT => Value::Int(
			rec.int(F_ATTR_VALUE)
				.ok_or_else(|| Error::Invalid("int attr without value".into()))?,
		),
		T_BOOL => match rec.get(F_ATTR_VALUE) {
			Some(RecordValue::Bool(v)) => Value::Bool(*v),
			_ => return Err(Error::Invalid("bool attr without value".into())),
		},
		T_BYTES => match rec.get(F_ATTR_VALUE) {
			Some(RecordValue::Bytes(b)) => Value::Bytes(b.clone()),
			_ => return Err(Error::Invalid("bytes attr without value".into())),
		},
		T_REF => Value::Ref(EntityId::from(
			rec.str(F_ATTR_VALUE)
				.ok_or_else(|| Error::Invalid("ref attr without value".into()))?,
		)),
		T_SYM => Value::Sym {
			group: rec
				.str(F_ATTR_GROUP)
				.ok_or_else(|| Error::Invalid("sym attr without group".into()))?
				.to_owned(),
			name: rec
				.str(F_ATTR_VALUE)
				.ok_or_else(|| Error::Invalid("sym attr without value".into()))?
				.to_owned(),
		},
		other => {
			return Err(Error::Invalid(format!("unknown attr type tag: {other}")))
		}
	};
	Ok(value)
}

pub fn encode_attr(attr: &Attr) -> Record {
	let mut rec = Record::new();
	rec.set(F_ATTR_ID, RecordValue::Int(attr.id.0 as i64));
	encode_value(&attr.value, &mut rec);
	rec
}

pub fn decode_attr(rec: &Record) -> Result<Attr> {
	let id = rec
		.int(F_ATTR_ID)
		.ok_or_else(|| Error::Invalid("attr record missing id".into()))?;
	Ok(Attr::new(AttrId(id as u32), decode_value(rec)?))
}

/// Entity → wire record (`0=id, 1=revision, 2=created_at, 3=updated_at, 4=attrs`).
pub fn encode_entity(entity: &Entity) -> Record {
	let mut rec = Record::new();
	rec.set(F_ENTITY_ID, RecordValue::Str(entity.id.to_string()));
	rec.set(F_ENTITY_REVISION, RecordValue::Int(entity.revision as i64));
	rec.set(F_ENTITY_CREATED_AT, RecordValue::Int(entity.created_at as i64));
	rec.set(F_ENTITY_UPDATED_AT, RecordValue::Int(entity.updated_at as i64));
	rec.set(
		F_ENTITY_ATTRS,
		RecordValue::List(
			entity
				.attrs
				.iter()
				.map(|a| RecordValue::Rec(encode_attr(a)))
				.collect(),
		),
	);
	rec
}

pub fn decode_entity(rec: &Record) -> Result<Entity> {
	let id = rec
		.str(F_ENTITY_ID)
		.ok_or_else(|| Error::Invalid("entity record missing id".into()))?;
	let mut entity = Entity::new(EntityId::from(id));
	entity.revision = rec.int(F_ENTITY_REVISION).unwrap_or(0) as u64;
	entity.created_at = rec.int(F_ENTITY_CREATED_AT).unwrap_or(0) as u64;
	entity.updated_at = rec.int(F_ENTITY_UPDATED_AT).unwrap_or(0) as u64;
	if let Some(attrs) = rec.list(F_ENTITY_ATTRS) {
		for v in attrs {
			match v {
				RecordValue::Rec(r) => entity.attrs.push(decode_attr(r)?),
				_ => {
					return Err(Error::Invalid(
						"entity attrs must be records".into(),
					))
				}
			}
		}
	}
	Ok(entity)
}

/// EntityOp → wire record (`0=entity, 1=previous, 2=operation, 3=entity_id`).
pub fn encode_op(op: &EntityOp) -> Record {
	let mut rec = Record::new();
	if let Some(entity) = &op.entity {
		rec.set(F_OP_ENTITY, RecordValue::Rec(encode_entity(entity)));
	}
	if let Some(previous) = op.previous {
		rec.set(F_OP_PREVIOUS, RecordValue::Int(previous as i64));
	}
	rec.set(F_OP_OPERATION, RecordValue::Int(op.op.wire()));
	rec.set(F_OP_ENTITY_ID, RecordValue::Str(op.entity_id.to_string()));
	rec
}

pub fn decode_op(rec: &Record) -> Result<EntityOp> {
	let op = rec
		.int(F_OP_OPERATION)
		.and_then(OpKind::from_wire)
		.ok_or_else(|| Error::Invalid("op record missing operation".into()))?;
	let entity_id = rec
		.str(F_OP_ENTITY_ID)
		.ok_or_else(|| Error::Invalid("op record missing entity id".into()))?;
	let entity = match rec.rec(F_OP_ENTITY) {
		Some(r) => Some(decode_entity(r)?),
		None => None,
	};
	Ok(EntityOp {
		op,
		entity,
		previous: rec.int(F_OP_PREVIOUS).map(|v| v as u64),
		entity_id: EntityId::from(entity_id),
	})
}
