use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::Error;
use crate::Result;

/// Numeric attribute id. Stable on the wire; never reused.
#[derive(
	Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AttrId(pub u32);

impl std::fmt::Display for AttrId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

// Built-in attribute ids. Additions append; removals are forbidden.
pub const KIND: AttrId = AttrId(1);
pub const METADATA_NAME: AttrId = AttrId(2);
pub const APP_ACTIVE_VERSION: AttrId = AttrId(3);
pub const APP_PROJECT: AttrId = AttrId(4);
pub const VERSION_APP: AttrId = AttrId(5);
pub const VERSION_IMAGE_URL: AttrId = AttrId(6);
pub const VERSION_SERVICE: AttrId = AttrId(7);
pub const ROUTE_HOST: AttrId = AttrId(8);
pub const ROUTE_APP: AttrId = AttrId(9);
pub const ROUTE_DEFAULT: AttrId = AttrId(10);
pub const SANDBOX_CONTAINER: AttrId = AttrId(11);
pub const SANDBOX_NETWORK: AttrId = AttrId(12);
pub const SANDBOX_STATUS: AttrId = AttrId(13);
pub const SANDBOX_POOL: AttrId = AttrId(14);
pub const SANDBOX_APP: AttrId = AttrId(15);
pub const SANDBOX_VERSION: AttrId = AttrId(16);
pub const SANDBOX_SERVICE: AttrId = AttrId(17);
pub const MANIFEST_EXTRA: AttrId = AttrId(18);

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	Str(String),
	Int(i64),
	Bool(bool),
	Bytes(Bytes),
	/// Reference to another entity.
	Ref(EntityId),
	/// Typed enum value, e.g. `sandbox_status/RUNNING`.
	Sym { group: String, name: String },
}

impl Value {
	pub fn sym(group: &str, name: &str) -> Self {
		Value::Sym {
			group: group.to_owned(),
			name: name.to_owned(),
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Str(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			Value::Int(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(v) => Some(*v),
			_ => None,
		}
	}

	pub fn as_bytes(&self) -> Option<&Bytes> {
		match self {
			Value::Bytes(b) => Some(b),
			_ => None,
		}
	}

	pub fn as_ref_id(&self) -> Option<&EntityId> {
		match self {
			Value::Ref(id) => Some(id),
			_ => None,
		}
	}

	pub fn as_sym(&self) -> Option<&str> {
		match self {
			Value::Sym { name, .. } => Some(name),
			_ => None,
		}
	}

	/// Canonical key used by the secondary indexes. Prefixed by value type so
	/// that, say, `Int(1)` and `Str("1")` never collide.
	pub fn index_key(&self) -> String {
		match self {
			Value::Str(s) => format!("s:{s}"),
			Value::Int(v) => format!("i:{v}"),
			Value::Bool(v) => format!("b:{v}"),
			Value::Bytes(b) => {
				let mut key = String::with_capacity(2 + b.len() * 2);
				key.push_str("x:");
				for byte in b.iter() {
					key.push_str(&format!("{byte:02x}"));
				}
				key
			}
			Value::Ref(id) => format!("r:{id}"),
			Value::Sym { group, name } => format!("e:{group}/{name}"),
		}
	}
}

/// One `(attribute, value)` pair on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr {
	pub id: AttrId,
	pub value: Value,
}

impl Attr {
	pub fn new(id: AttrId, value: Value) -> Self {
		Self { id, value }
	}

	pub fn str(id: AttrId, s: impl Into<String>) -> Self {
		Self::new(id, Value::Str(s.into()))
	}

	pub fn int(id: AttrId, v: i64) -> Self {
		Self::new(id, Value::Int(v))
	}

	pub fn bool(id: AttrId, v: bool) -> Self {
		Self::new(id, Value::Bool(v))
	}

	pub fn bytes(id: AttrId, b: impl Into<Bytes>) -> Self {
		Self::new(id, Value::Bytes(b.into()))
	}

	pub fn entity_ref(id: AttrId, target: EntityId) -> Self {
		Self::new(id, Value::Ref(target))
	}
}

/// How an attribute participates in secondary indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
	None,
	/// At most one entity per value.
	Unique,
	/// A set of entities per value.
	Multi,
}

/// Declared value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
	Str,
	Int,
	Bool,
	Bytes,
	Ref,
	/// Enum with the given group name and allowed members.
	Sym(&'static str, &'static [&'static str]),
}

/// Declaration of a named typed attribute slot.
#[derive(Debug, Clone)]
pub struct AttrDef {
	pub id: AttrId,
	pub name: &'static str,
	pub ty: ValueType,
	pub index: IndexMode,
	/// String values are lowercased before storage and lookup. Hostnames are
	/// the only current user; the index must be case-insensitive.
	pub lowercase: bool,
}

const KIND_GROUP: &str = "kind";
pub const KNOWN_KINDS: &[&str] = &["app", "app_version", "http_route", "sandbox"];

pub const SANDBOX_STATUS_GROUP: &str = "sandbox_status";
pub const SANDBOX_STATUSES: &[&str] = &["PENDING", "RUNNING", "STOPPED", "DEAD"];

const DEFS: &[AttrDef] = &[
	AttrDef {
		id: KIND,
		name: "kind",
		ty: ValueType::Sym(KIND_GROUP, KNOWN_KINDS),
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: METADATA_NAME,
		name: "metadata.name",
		ty: ValueType::Str,
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: APP_ACTIVE_VERSION,
		name: "app.active_version",
		ty: ValueType::Ref,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: APP_PROJECT,
		name: "app.project",
		ty: ValueType::Ref,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: VERSION_APP,
		name: "app_version.app",
		ty: ValueType::Ref,
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: VERSION_IMAGE_URL,
		name: "app_version.image_url",
		ty: ValueType::Str,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: VERSION_SERVICE,
		name: "app_version.service",
		ty: ValueType::Bytes,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: ROUTE_HOST,
		name: "http_route.host",
		ty: ValueType::Str,
		index: IndexMode::Unique,
		lowercase: true,
	},
	AttrDef {
		id: ROUTE_APP,
		name: "http_route.app",
		ty: ValueType::Ref,
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: ROUTE_DEFAULT,
		name: "http_route.default",
		ty: ValueType::Bool,
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_CONTAINER,
		name: "sandbox.container",
		ty: ValueType::Bytes,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_NETWORK,
		name: "sandbox.network",
		ty: ValueType::Bytes,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_STATUS,
		name: "sandbox.status",
		ty: ValueType::Sym(SANDBOX_STATUS_GROUP, SANDBOX_STATUSES),
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_POOL,
		name: "sandbox.pool",
		ty: ValueType::Str,
		index: IndexMode::Multi,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_APP,
		name: "sandbox.app",
		ty: ValueType::Ref,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_VERSION,
		name: "sandbox.version",
		ty: ValueType::Ref,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: SANDBOX_SERVICE,
		name: "sandbox.service",
		ty: ValueType::Str,
		index: IndexMode::None,
		lowercase: false,
	},
	AttrDef {
		id: MANIFEST_EXTRA,
		name: "manifest.extra",
		ty: ValueType::Bytes,
		index: IndexMode::None,
		lowercase: false,
	},
];

/// The attribute schema: declarations of every known attribute, keyed both by
/// id and by name.
#[derive(Debug)]
pub struct Schema {
	by_id: HashMap<AttrId, &'static AttrDef>,
	by_name: HashMap<&'static str, &'static AttrDef>,
}

impl Schema {
	/// The built-in schema shared by the whole runtime.
	pub fn builtin() -> &'static Schema {
		static SCHEMA: OnceLock<Schema> = OnceLock::new();
		SCHEMA.get_or_init(|| {
			let mut by_id = HashMap::new();
			let mut by_name = HashMap::new();
			for def in DEFS {
				by_id.insert(def.id, def);
				by_name.insert(def.name, def);
			}
			Schema { by_id, by_name }
		})
	}

	pub fn def(&self, id: AttrId) -> Option<&'static AttrDef> {
		self.by_id.get(&id).copied()
	}

	pub fn by_name(&self, name: &str) -> Option<&'static AttrDef> {
		self.by_name.get(name).copied()
	}

	pub fn index_mode(&self, id: AttrId) -> IndexMode {
		self.def(id).map(|d| d.index).unwrap_or(IndexMode::None)
	}

	/// Constructs a typed attribute from an attribute name and a string
	/// value, parsing the value according to the declared type.
	pub fn make_attr(&self, name: &str, value: &str) -> Result<Attr> {
		let def = self
			.by_name(name)
			.ok_or_else(|| Error::UnknownAttr(name.to_owned()))?;
		let value = match def.ty {
			ValueType::Str => {
				if def.lowercase {
					Value::Str(value.to_lowercase())
				} else {
					Value::Str(value.to_owned())
				}
			}
			ValueType::Int => Value::Int(value.parse::<i64>().map_err(|_| {
				Error::Invalid(format!("{name}: not an integer: {value}"))
			})?),
			ValueType::Bool => match value {
				"true" => Value::Bool(true),
				"false" => Value::Bool(false),
				_ => {
					return Err(Error::Invalid(format!(
						"{name}: not a bool: {value}"
					)))
				}
			},
			ValueType::Bytes => Value::Bytes(Bytes::from(value.as_bytes().to_vec())),
			ValueType::Ref => Value::Ref(EntityId::from(value)),
			ValueType::Sym(group, members) => {
				if !members.contains(&value) {
					return Err(Error::Invalid(format!(
						"{name}: unknown {group} member: {value}"
					)));
				}
				Value::sym(group, value)
			}
		};
		Ok(Attr::new(def.id, value))
	}

	/// The attribute instance that lists all entities of `kind`.
	pub fn lookup_kind(&self, kind: &str) -> Result<Attr> {
		if !KNOWN_KINDS.contains(&kind) {
			return Err(Error::UnknownKind(kind.to_owned()));
		}
		Ok(Attr::new(KIND, Value::sym(KIND_GROUP, kind)))
	}

	/// The kind attribute for an entity being written, without the known-kind
	/// check. Unknown kinds are storable (manifests flag them instead).
	pub fn kind_attr(&self, kind: &str) -> Attr {
		Attr::new(KIND, Value::sym(KIND_GROUP, kind))
	}

	/// Applies declared normalization (lowercasing) to an attribute value.
	pub fn normalize(&self, mut attr: Attr) -> Attr {
		if let Some(def) = self.def(attr.id) {
			if def.lowercase {
				if let Value::Str(s) = &attr.value {
					attr.value = Value::Str(s.to_lowercase());
				}
			}
		}
		attr
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn make_attr_lowercases_hosts() {
		let schema = Schema::builtin();
		let attr = schema.make_attr("http_route.host", "Example.Com").unwrap();
		assert_eq!(attr.value.as_str(), Some("example.com"));
	}

	#[test]
	fn make_attr_rejects_unknown_names() {
		let schema = Schema::builtin();
		let err = schema.make_attr("nope", "x").unwrap_err();
		assert!(matches!(err, Error::UnknownAttr(_)));
	}

	#[test]
	fn make_attr_validates_sym_members() {
		let schema = Schema::builtin();
		assert!(schema.make_attr("sandbox.status", "RUNNING").is_ok());
		assert!(schema.make_attr("sandbox.status", "running").is_err());
	}

	#[test]
	fn lookup_kind_rejects_unknown_kinds() {
		let schema = Schema::builtin();
		assert!(schema.lookup_kind("app").is_ok());
		let err = schema.lookup_kind("gadget").unwrap_err();
		assert!(matches!(err, Error::UnknownKind(_)));
	}

	#[test]
	fn index_keys_are_type_prefixed() {
		assert_ne!(
			Value::Int(1).index_key(),
			Value::Str("1".into()).index_key()
		);
	}
}
