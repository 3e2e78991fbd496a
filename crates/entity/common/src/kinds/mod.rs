//! Typed views over entities.
//!
//! The store itself is schemaless; these codecs are the only place that knows
//! how `app`, `app_version`, `http_route` and `sandbox` entities are shaped.
//! Attributes a codec does not recognize are kept in an `extras` bag and
//! written back verbatim on encode, so round-tripping an entity through its
//! typed view never loses fields added by a newer peer.

mod app;
mod route;
mod sandbox;
mod version;

pub use self::app::App;
pub use self::route::HttpRoute;
pub use self::sandbox::{
	pool_key, ContainerSpec, NetworkSpec, PortSpec, Sandbox, SandboxStatus,
};
pub use self::version::{AppVersion, Concurrency, Disk, Resources, ServiceSpec};

use crate::attr::{Attr, KIND};
use crate::entity::{Entity, EntityId};
use crate::error::Error;
use crate::Result;

/// Encode/decode between a typed domain value and a flat attribute list.
pub trait Codec: Sized {
	const KIND: &'static str;

	fn encode_attrs(&self) -> Result<Vec<Attr>>;
	fn decode_attrs(attrs: &[Attr]) -> Result<Self>;

	/// Builds a storable entity: the kind attribute plus the encoded attrs.
	fn to_entity(&self, id: EntityId) -> Result<Entity> {
		let mut entity = Entity::new(id);
		entity.push(crate::attr::Schema::builtin().kind_attr(Self::KIND));
		entity.attrs.extend(self.encode_attrs()?);
		Ok(entity)
	}

	/// Decodes an entity, verifying its kind attribute first.
	fn from_entity(entity: &Entity) -> Result<Self> {
		match entity.first(KIND).and_then(|v| v.as_sym()) {
			Some(kind) if kind == Self::KIND => {}
			Some(kind) => {
				return Err(Error::Invalid(format!(
					"expected kind {}, got {kind}",
					Self::KIND
				)))
			}
			None => {
				return Err(Error::Invalid(format!(
					"entity {} has no kind",
					entity.id
				)))
			}
		}
		Self::decode_attrs(&entity.attrs)
	}
}

/// Serializes a nested spec struct into a bytes attribute payload.
pub(crate) fn spec_bytes<T: serde::Serialize>(spec: &T) -> Result<bytes::Bytes> {
	let raw = serde_json::to_vec(spec)
		.map_err(|err| Error::Invalid(format!("spec encode: {err}")))?;
	Ok(bytes::Bytes::from(raw))
}

pub(crate) fn spec_from_bytes<T: serde::de::DeserializeOwned>(
	raw: &bytes::Bytes,
) -> Result<T> {
	serde_json::from_slice(raw)
		.map_err(|err| Error::Invalid(format!("spec decode: {err}")))
}
