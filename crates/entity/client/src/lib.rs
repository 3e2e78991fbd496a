//! Typed convenience clients over the `EntityAccess` RPC surface.
//!
//! [`EntityClient`] wraps a [`caprpc::Connection`] with decoded requests and
//! responses; [`IngressClient`] and [`AppsClient`] layer the domain helpers
//! the ingress and the activator actually use (host lookup, default-route
//! convergence, sandbox lifecycle nudges).

mod apps;
mod ingress;

pub use self::apps::AppsClient;
pub use self::ingress::{IngressClient, RouteEntry};

use std::marker::PhantomData;

use caprpc::{
	CapDescriptor, Connection, Record, RecordValue, RpcError, SinkStream, Target,
	DEFAULT_STREAM_CREDIT,
};
use entity_common::api::{self, field, method};
use entity_common::attr::Attr;
use entity_common::entity::{Entity, EntityId, EntityOp};
use entity_common::kinds::Codec;
use entity_common::manifest::Format;
use entity_common::record::{
	decode_attr, decode_entity, decode_op, encode_attr, encode_entity,
};
use entity_common::{Error, Result};

/// Maps transport-level failures into the shared error taxonomy.
fn rpc_err(err: RpcError) -> Error {
	match err {
		RpcError::Call(wire) => wire.into(),
		RpcError::Cancelled | RpcError::StreamClosed(_) => Error::Cancelled,
		RpcError::Disconnected | RpcError::Protocol(_) => Error::Disconnected,
	}
}

/// Acknowledgement of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAck {
	pub id: EntityId,
	pub revision: u64,
}

/// Client for the generic entity surface.
#[derive(Clone)]
pub struct EntityClient {
	conn: Connection,
}

impl EntityClient {
	pub fn new(conn: Connection) -> Self {
		Self { conn }
	}

	pub fn connection(&self) -> &Connection {
		&self.conn
	}

	async fn call(
		&self,
		method: &str,
		args: Record,
		caps: Vec<CapDescriptor>,
	) -> Result<Record> {
		self.conn
			.call(Target::Interface(api::INTERFACE.into()), method, args, caps)
			.await
			.map_err(rpc_err)
	}

	pub async fn get(&self, id: &EntityId) -> Result<Entity> {
		let mut args = Record::new();
		args.set(field::ID, RecordValue::Str(id.to_string()));
		let result = self.call(method::GET, args, vec![]).await?;
		decode_entity(
			result
				.rec(field::ENTITY)
				.ok_or_else(|| Error::Invalid("Get response without entity".into()))?,
		)
	}

	pub async fn put(&self, entity: &Entity) -> Result<PutAck> {
		let mut args = Record::new();
		args.set(field::ENTITY, RecordValue::Rec(encode_entity(entity)));
		let result = self.call(method::PUT, args, vec![]).await?;
		Ok(PutAck {
			id: EntityId::from(result.str(field::ID).ok_or_else(|| {
				Error::Invalid("Put response without id".into())
			})?),
			revision: result.int(field::REVISION).unwrap_or(0) as u64,
		})
	}

	pub async fn delete(&self, id: &EntityId) -> Result<u64> {
		let mut args = Record::new();
		args.set(field::ID, RecordValue::Str(id.to_string()));
		let result = self.call(method::DELETE, args, vec![]).await?;
		Ok(result.int(field::REVISION).unwrap_or(0) as u64)
	}

	/// Raw snapshots matching an indexed attribute, ordered by id.
	pub async fn list_raw(&self, attr: &Attr) -> Result<Vec<Entity>> {
		let mut args = Record::new();
		args.set(field::ATTR, RecordValue::Rec(encode_attr(attr)));
		let result = self.call(method::LIST, args, vec![]).await?;
		let mut entities = Vec::new();
		for value in result.list(field::ENTITIES).unwrap_or(&[]) {
			match value {
				RecordValue::Rec(rec) => entities.push(decode_entity(rec)?),
				other => {
					return Err(Error::Invalid(format!(
						"List response is not records: {other:?}"
					)))
				}
			}
		}
		Ok(entities)
	}

	/// Decoded listing with `next()`/`read(&mut out)` semantics.
	pub async fn list<T: Codec>(&self, attr: &Attr) -> Result<ListCursor<T>> {
		Ok(ListCursor::new(self.list_raw(attr).await?))
	}

	pub async fn make_attr(&self, name: &str, value: &str) -> Result<Attr> {
		let mut args = Record::new();
		args.set(field::NAME, RecordValue::Str(name.into()));
		args.set(field::VALUE, RecordValue::Str(value.into()));
		let result = self.call(method::MAKE_ATTR, args, vec![]).await?;
		decode_attr(result.rec(field::ATTR).ok_or_else(|| {
			Error::Invalid("MakeAttr response without attribute".into())
		})?)
	}

	pub async fn lookup_kind(&self, kind: &str) -> Result<Attr> {
		let mut args = Record::new();
		args.set(field::NAME, RecordValue::Str(kind.into()));
		let result = self.call(method::LOOKUP_KIND, args, vec![]).await?;
		decode_attr(result.rec(field::ATTR).ok_or_else(|| {
			Error::Invalid("LookupKind response without attribute".into())
		})?)
	}

	pub async fn parse(&self, bytes: &[u8]) -> Result<(Vec<(Entity, bool)>, Format)> {
		let mut args = Record::new();
		args.set(field::BYTES, RecordValue::Bytes(bytes.to_vec().into()));
		let result = self.call(method::PARSE, args, vec![]).await?;
		let format = result
			.str(field::FORMAT)
			.and_then(api::format_from_tag)
			.ok_or_else(|| Error::Invalid("Parse response without format".into()))?;
		let mut docs = Vec::new();
		for value in result.list(field::DOCS).unwrap_or(&[]) {
			let RecordValue::Rec(rec) = value else {
				return Err(Error::Invalid("Parse doc is not a record".into()));
			};
			let entity = decode_entity(rec.rec(field::DOC_ENTITY).ok_or_else(
				|| Error::Invalid("Parse doc without entity".into()),
			)?)?;
			let known = matches!(
				rec.get(field::DOC_KNOWN_KIND),
				Some(RecordValue::Bool(true))
			);
			docs.push((entity, known));
		}
		Ok((docs, format))
	}

	pub async fn format(&self, entity: &Entity, format: Format) -> Result<Vec<u8>> {
		let mut args = Record::new();
		args.set(field::ENTITY, RecordValue::Rec(encode_entity(entity)));
		args.set(
			field::FORMAT,
			RecordValue::Str(api::format_tag(format).into()),
		);
		let result = self.call(method::FORMAT, args, vec![]).await?;
		match result.get(field::BYTES) {
			Some(RecordValue::Bytes(b)) => Ok(b.to_vec()),
			_ => Err(Error::Invalid("Format response without bytes".into())),
		}
	}

	/// Subscribes to one entity's ops. Dropping the watch cancels the
	/// server-side forwarder.
	pub async fn watch_entity(&self, id: &EntityId) -> Result<Watch> {
		let mut args = Record::new();
		args.set(field::ID, RecordValue::Str(id.to_string()));
		self.watch(method::WATCH_ENTITY, args).await
	}

	/// Subscribes to an index value: initial CREATE burst, then live ops.
	pub async fn watch_index(&self, attr: &Attr) -> Result<Watch> {
		let mut args = Record::new();
		args.set(field::ATTR, RecordValue::Rec(encode_attr(attr)));
		self.watch(method::WATCH_INDEX, args).await
	}

	async fn watch(&self, method: &'static str, args: Record) -> Result<Watch> {
		let (cap, stream) = self.conn.new_sink(DEFAULT_STREAM_CREDIT);
		let conn = self.conn.clone();
		let call = tokio::spawn(async move {
			let _ = conn
				.call(Target::Interface(api::INTERFACE.into()), method, args, vec![cap])
				.await;
		});
		Ok(Watch { stream, call })
	}

	/// Gets and decodes in one step.
	pub async fn get_as<T: Codec>(&self, id: &EntityId) -> Result<T> {
		T::from_entity(&self.get(id).await?)
	}

	/// The single entity at an indexed value.
	///
	/// Distinguished `not-found` when the index is empty; when several
	/// entities match, the one with the smallest id wins so callers behave
	/// deterministically.
	pub async fn one_at_index<T: Codec>(&self, attr: &Attr) -> Result<(EntityId, T)> {
		let entities = self.list_raw(attr).await?;
		match entities.first() {
			Some(entity) => Ok((entity.id.clone(), T::from_entity(entity)?)),
			None => Err(Error::NotFound(EntityId::from(format!(
				"index:{}",
				attr.value.index_key()
			)))),
		}
	}

	/// Updates `id` preserving its revision when it exists, otherwise
	/// creates it with that id.
	pub async fn create_or_update<T: Codec>(
		&self,
		id: &EntityId,
		value: &T,
	) -> Result<PutAck> {
		let mut entity = value.to_entity(id.clone())?;
		match self.get(id).await {
			Ok(current) => {
				entity.revision = current.revision;
				self.put(&entity).await
			}
			Err(err) if err.is_not_found() => self.put(&entity).await,
			Err(err) => Err(err),
		}
	}
}

/// A live watch subscription.
pub struct Watch {
	stream: SinkStream,
	call: tokio::task::JoinHandle<()>,
}

impl Watch {
	/// Next op, in commit order. `None` when the subscription ended cleanly.
	pub async fn next(&mut self) -> Option<Result<EntityOp>> {
		match self.stream.next().await? {
			Ok(record) => Some(decode_op(&record)),
			Err(err) => Some(Err(rpc_err(err))),
		}
	}
}

impl Drop for Watch {
	fn drop(&mut self) {
		// Dropping the in-flight call sends the cancel frame.
		self.call.abort();
	}
}

/// Decoded listing cursor: `next()` advances, `read` decodes the current
/// entity into a caller-supplied value.
pub struct ListCursor<T> {
	entities: Vec<Entity>,
	pos: Option<usize>,
	_decoded: PhantomData<T>,
}

impl<T: Codec> ListCursor<T> {
	fn new(entities: Vec<Entity>) -> Self {
		Self {
			entities,
			pos: None,
			_decoded: PhantomData,
		}
	}

	pub fn next(&mut self) -> bool {
		let next = self.pos.map(|p| p + 1).unwrap_or(0);
		if next < self.entities.len() {
			self.pos = Some(next);
			true
		} else {
			false
		}
	}

	pub fn read(&self, out: &mut T) -> Result<()> {
		let entity = self
			.entity()
			.ok_or_else(|| Error::Invalid("cursor is not on an entity".into()))?;
		*out = T::from_entity(entity)?;
		Ok(())
	}

	pub fn entity(&self) -> Option<&Entity> {
		self.pos.and_then(|p| self.entities.get(p))
	}

	pub fn len(&self) -> usize {
		self.entities.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entities.is_empty()
	}
}
