use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use caprpc::{CallCtx, Connection, Handler, Record, RecordValue, RemoteSink, WireError};
use entity_common::api::{self, field, method};
use entity_common::attr::Schema;
use entity_common::entity::{EntityId, EntityOp};
use entity_common::manifest::{self, Format};
use entity_common::record::{decode_attr, decode_entity, encode_attr, encode_entity, encode_op};
use entity_common::{Error, Result};

use crate::store::EntityStore;

/// The `EntityAccess` interface over an [`EntityStore`].
pub struct EntityService {
	store: EntityStore,
	schema: &'static Schema,
}

impl EntityService {
	pub fn new(store: EntityStore) -> Self {
		Self {
			store,
			schema: Schema::builtin(),
		}
	}

	async fn get(&self, args: Record) -> Result<Record> {
		let id = arg_id(&args)?;
		let entity = self.store.get(&id).await?;
		let mut out = Record::new();
		out.set(field::ENTITY, RecordValue::Rec(encode_entity(&entity)));
		Ok(out)
	}

	async fn put(&self, args: Record) -> Result<Record> {
		let rec = args
			.rec(field::ENTITY)
			.ok_or_else(|| Error::Invalid("Put without entity".into()))?;
		let mut entity = decode_entity(rec)?;
		if entity.id.as_str().is_empty() {
			entity.id = EntityId::random();
		}
		let outcome = self.store.put(entity).await?;
		let mut out = Record::new();
		out.set(field::ID, RecordValue::Str(outcome.id.to_string()));
		out.set(field::REVISION, RecordValue::Int(outcome.revision as i64));
		Ok(out)
	}

	async fn delete(&self, args: Record) -> Result<Record> {
		let id = arg_id(&args)?;
		let revision = self.store.delete(&id, None).await?;
		let mut out = Record::new();
		out.set(field::REVISION, RecordValue::Int(revision as i64));
		Ok(out)
	}

	async fn list(&self, args: Record) -> Result<Record> {
		let attr = args
			.rec(field::ATTR)
			.ok_or_else(|| Error::Invalid("List without attribute".into()))?;
		let attr = decode_attr(attr)?;
		let entities = self.store.list(&attr).await?;
		let mut out = Record::new();
		out.set(
			field::ENTITIES,
			RecordValue::List(
				entities
					.iter()
					.map(|e| RecordValue::Rec(encode_entity(e)))
					.collect(),
			),
		);
		Ok(out)
	}

	async fn make_attr(&self, args: Record) -> Result<Record> {
		let name = args
			.str(field::NAME)
			.ok_or_else(|| Error::Invalid("MakeAttr without name".into()))?;
		let value = args
			.str(field::VALUE)
			.ok_or_else(|| Error::Invalid("MakeAttr without value".into()))?;
		let attr = self.schema.make_attr(name, value)?;
		let mut out = Record::new();
		out.set(field::ATTR, RecordValue::Rec(encode_attr(&attr)));
		Ok(out)
	}

	async fn lookup_kind(&self, args: Record) -> Result<Record> {
		let kind = args
			.str(field::NAME)
			.ok_or_else(|| Error::Invalid("LookupKind without kind".into()))?;
		let attr = self.schema.lookup_kind(kind)?;
		let mut out = Record::new();
		out.set(field::ATTR, RecordValue::Rec(encode_attr(&attr)));
		Ok(out)
	}

	async fn parse(&self, args: Record) -> Result<Record> {
		let bytes = match args.get(field::BYTES) {
			Some(RecordValue::Bytes(b)) => b,
			_ => return Err(Error::Invalid("Parse without bytes".into())),
		};
		let parsed = manifest::parse(bytes)?;
		let docs = parsed
			.docs
			.iter()
			.map(|doc| {
				let mut rec = Record::new();
				rec.set(
					field::DOC_ENTITY,
					RecordValue::Rec(encode_entity(&doc.entity)),
				);
				rec.set(field::DOC_KNOWN_KIND, RecordValue::Bool(doc.known_kind));
				RecordValue::Rec(rec)
			})
			.collect();
		let mut out = Record::new();
		out.set(field::DOCS, RecordValue::List(docs));
		out.set(
			field::FORMAT,
			RecordValue::Str(api::format_tag(parsed.format).to_owned()),
		);
		Ok(out)
	}

	async fn format(&self, args: Record) -> Result<Record> {
		let rec = args
			.rec(field::ENTITY)
			.ok_or_else(|| Error::Invalid("Format without entity".into()))?;
		let entity = decode_entity(rec)?;
		let format = match args.str(field::FORMAT) {
			Some(tag) => api::format_from_tag(tag)
				.ok_or_else(|| Error::Format(format!("unknown dialect: {tag}")))?,
			None => Format::Yaml,
		};
		let bytes = manifest::format(&entity, format)?;
		let mut out = Record::new();
		out.set(field::BYTES, RecordValue::Bytes(bytes.into()));
		Ok(out)
	}

	/// Runs until the entity stops mutating interest: the watcher going away
	/// (push failure / cancellation) or the store shutting down.
	async fn watch_entity(&self, ctx: &CallCtx, args: Record) -> Result<Record> {
		let id = arg_id(&args)?;
		let sink = sink_arg(ctx)?;
		let (initial, mut rx) = self.store.watch_entity(&id).await?;
		if let Some(op) = initial {
			if push_op(&sink, &op).await.is_err() {
				return Ok(Record::new());
			}
		}
		while let Some(op) = rx.recv().await {
			if push_op(&sink, &op).await.is_err() {
				return Ok(Record::new());
			}
		}
		let _ = sink.close(None).await;
		Ok(Record::new())
	}

	async fn watch_index(&self, ctx: &CallCtx, args: Record) -> Result<Record> {
		let attr = args
			.rec(field::ATTR)
			.ok_or_else(|| Error::Invalid("WatchIndex without attribute".into()))?;
		let attr = decode_attr(attr)?;
		let sink = sink_arg(ctx)?;
		let (initial, mut rx) = self.store.watch_index(&attr).await?;
		for op in &initial {
			if push_op(&sink, op).await.is_err() {
				return Ok(Record::new());
			}
		}
		while let Some(op) = rx.recv().await {
			if push_op(&sink, &op).await.is_err() {
				return Ok(Record::new());
			}
		}
		let _ = sink.close(None).await;
		Ok(Record::new())
	}
}

fn arg_id(args: &Record) -> Result<EntityId> {
	args.str(field::ID)
		.map(EntityId::from)
		.ok_or_else(|| Error::Invalid("missing entity id".into()))
}

fn sink_arg(ctx: &CallCtx) -> Result<RemoteSink> {
	ctx.sink(0).map_err(|err| Error::Invalid(err.message))
}

async fn push_op(sink: &RemoteSink, op: &EntityOp) -> std::result::Result<(), ()> {
	match sink.push(encode_op(op)).await {
		Ok(()) => Ok(()),
		Err(err) => {
			debug!("watch sink went away: {err}");
			Err(())
		}
	}
}

#[async_trait::async_trait]
impl Handler for EntityService {
	async fn call(
		&self,
		ctx: CallCtx,
		method: &str,
		args: Record,
	) -> std::result::Result<Record, WireError> {
		let result = match method {
			method::GET => self.get(args).await,
			method::PUT => self.put(args).await,
			method::DELETE => self.delete(args).await,
			method::LIST => self.list(args).await,
			method::MAKE_ATTR => self.make_attr(args).await,
			method::LOOKUP_KIND => self.lookup_kind(args).await,
			method::PARSE => self.parse(args).await,
			method::FORMAT => self.format(args).await,
			method::WATCH_ENTITY => self.watch_entity(&ctx, args).await,
			method::WATCH_INDEX => self.watch_index(&ctx, args).await,
			other => {
				return Err(WireError {
					code: 0,
					message: format!("unknown method: {other}"),
				})
			}
		};
		result.map_err(WireError::from)
	}
}

fn interfaces(service: Arc<EntityService>) -> HashMap<String, Arc<dyn Handler>> {
	let mut map: HashMap<String, Arc<dyn Handler>> = HashMap::new();
	map.insert(api::INTERFACE.to_owned(), service);
	map
}

/// Serves the store on a TCP listener, one connection per client, until the
/// listener fails.
pub async fn listen(listener: TcpListener, store: EntityStore) -> std::io::Result<()> {
	info!(
		"entity store listening on {}",
		listener.local_addr()?
	);
	let service = Arc::new(EntityService::new(store));
	loop {
		let (socket, peer) = listener.accept().await?;
		debug!(%peer, "entity client connected");
		let _conn =
			Connection::spawn(caprpc::cbor_framed(socket), interfaces(service.clone()));
	}
}

/// Wires a client connection to the store through an in-memory pipe. Used by
/// the daemon's own components and by tests.
pub fn connect_in_process(store: &EntityStore) -> Connection {
	let (a, b) = tokio::io::duplex(64 * 1024);
	let service = Arc::new(EntityService::new(store.clone()));
	let _server = Connection::spawn(caprpc::cbor_framed(a), interfaces(service));
	Connection::spawn(caprpc::cbor_framed(b), HashMap::new())
}
