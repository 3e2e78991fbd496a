use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;

use entity_common::attr::{self, Attr, AttrId, IndexMode, Schema};
use entity_common::entity::{now_ms, Entity, EntityId, EntityOp};
use entity_common::kinds::SandboxStatus;
use entity_common::{Error, Result};

/// Ops buffered per watcher before the committer blocks on it.
const WATCH_BUFFER: usize = 64;

type IndexKey = (AttrId, String);

/// Result of an accepted `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
	pub id: EntityId,
	pub revision: u64,
}

#[derive(Default)]
struct State {
	entities: HashMap<EntityId, Entity>,
	indexes: HashMap<IndexKey, BTreeSet<EntityId>>,
}

/// Everything one commit needs to tell the watchers: the entity op plus the
/// per-index-key view of it (an entity moving out of a key is a DELETE for
/// that key's watchers, moving in is a CREATE).
#[derive(Default)]
struct Notice {
	op: Option<EntityOp>,
	index_ops: Vec<(IndexKey, EntityOp)>,
}

enum Command {
	Put {
		entity: Entity,
		reply: oneshot::Sender<Result<PutOutcome>>,
	},
	Delete {
		id: EntityId,
		expected: Option<u64>,
		reply: oneshot::Sender<Result<u64>>,
	},
	WatchEntity {
		id: EntityId,
		reply: oneshot::Sender<(Option<EntityOp>, mpsc::Receiver<EntityOp>)>,
	},
	WatchIndex {
		attr: Attr,
		reply: oneshot::Sender<Result<(Vec<EntityOp>, mpsc::Receiver<EntityOp>)>>,
	},
}

#[derive(Default)]
struct Watchers {
	by_entity: HashMap<EntityId, Vec<mpsc::Sender<EntityOp>>>,
	by_index: HashMap<IndexKey, Vec<mpsc::Sender<EntityOp>>>,
}

/// In-memory entity store.
///
/// Writes and watch registrations go through one committer task, which is
/// what makes a commit (state mutation, index deltas, watcher notification)
/// atomic and totally ordered. Reads take the lock directly and observe the
/// last committed state.
#[derive(Clone)]
pub struct EntityStore {
	cmd_tx: mpsc::Sender<Command>,
	state: Arc<RwLock<State>>,
	schema: &'static Schema,
}

impl EntityStore {
	pub fn new() -> Self {
		let (cmd_tx, cmd_rx) = mpsc::channel(64);
		let state = Arc::new(RwLock::new(State::default()));
		tokio::spawn(run_committer(state.clone(), cmd_rx));
		Self {
			cmd_tx,
			state,
			schema: Schema::builtin(),
		}
	}

	pub async fn get(&self, id: &EntityId) -> Result<Entity> {
		self.state
			.read()
			.await
			.entities
			.get(id)
			.cloned()
			.ok_or_else(|| Error::NotFound(id.clone()))
	}

	/// Entities matching an indexed attribute value, ordered by id. Empty
	/// when nothing matches.
	pub async fn list(&self, attr: &Attr) -> Result<Vec<Entity>> {
		let attr = self.indexed(attr)?;
		let key = (attr.id, attr.value.index_key());
		let state = self.state.read().await;
		let mut out = Vec::new();
		if let Some(ids) = state.indexes.get(&key) {
			for id in ids {
				if let Some(entity) = state.entities.get(id) {
					out.push(entity.clone());
				}
			}
		}
		Ok(out)
	}

	/// Creates or updates. A revision of 0 means create; anything else is
	/// the expected current revision (optimistic concurrency).
	pub async fn put(&self, entity: Entity) -> Result<PutOutcome> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(Command::Put { entity, reply })
			.await
			.map_err(|_| Error::Disconnected)?;
		rx.await.map_err(|_| Error::Disconnected)?
	}

	pub async fn delete(&self, id: &EntityId, expected: Option<u64>) -> Result<u64> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(Command::Delete {
				id: id.clone(),
				expected,
				reply,
			})
			.await
			.map_err(|_| Error::Disconnected)?;
		rx.await.map_err(|_| Error::Disconnected)?
	}

	/// Subscribes to one entity. The current snapshot (if the entity exists)
	/// comes back as the initial op; afterwards every accepted mutation
	/// arrives in commit order. Watching a nonexistent id is fine: the next
	/// create is the first op.
	pub async fn watch_entity(
		&self,
		id: &EntityId,
	) -> Result<(Option<EntityOp>, mpsc::Receiver<EntityOp>)> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(Command::WatchEntity {
				id: id.clone(),
				reply,
			})
			.await
			.map_err(|_| Error::Disconnected)?;
		rx.await.map_err(|_| Error::Disconnected)
	}

	/// Subscribes to an index value: an initial CREATE per matching entity,
	/// then live ops. Mutations moving an entity across the index boundary
	/// arrive as CREATE/DELETE for this key.
	pub async fn watch_index(
		&self,
		attr: &Attr,
	) -> Result<(Vec<EntityOp>, mpsc::Receiver<EntityOp>)> {
		let attr = self.indexed(attr)?;
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(Command::WatchIndex { attr, reply })
			.await
			.map_err(|_| Error::Disconnected)?;
		rx.await.map_err(|_| Error::Disconnected)?
	}

	fn indexed(&self, attr: &Attr) -> Result<Attr> {
		if self.schema.index_mode(attr.id) == IndexMode::None {
			let name = self
				.schema
				.def(attr.id)
				.map(|d| d.name.to_owned())
				.unwrap_or_else(|| attr.id.to_string());
			return Err(Error::UnknownIndex(name));
		}
		Ok(self.schema.normalize(attr.clone()))
	}
}

impl Default for EntityStore {
	fn default() -> Self {
		Self::new()
	}
}

async fn run_committer(state: Arc<RwLock<State>>, mut cmd_rx: mpsc::Receiver<Command>) {
	let schema = Schema::builtin();
	let mut watchers = Watchers::default();
	while let Some(cmd) = cmd_rx.recv().await {
		match cmd {
			Command::Put { entity, reply } => {
				let result = apply_put(&state, schema, entity).await;
				match result {
					Ok((outcome, notice)) => {
						let _ = reply.send(Ok(outcome));
						deliver(&mut watchers, notice).await;
					}
					Err(err) => {
						let _ = reply.send(Err(err));
					}
				}
			}
			Command::Delete { id, expected, reply } => {
				match apply_delete(&state, schema, &id, expected).await {
					Ok((revision, notice)) => {
						let _ = reply.send(Ok(revision));
						deliver(&mut watchers, notice).await;
					}
					Err(err) => {
						let _ = reply.send(Err(err));
					}
				}
			}
			Command::WatchEntity { id, reply } => {
				let initial = state
					.read()
					.await
					.entities
					.get(&id)
					.cloned()
					.map(EntityOp::create);
				let (tx, rx) = mpsc::channel(WATCH_BUFFER);
				watchers.by_entity.entry(id).or_default().push(tx);
				let _ = reply.send((initial, rx));
			}
			Command::WatchIndex { attr, reply } => {
				let key = (attr.id, attr.value.index_key());
				let initial: Vec<EntityOp> = {
					let state = state.read().await;
					state
						.indexes
						.get(&key)
						.into_iter()
						.flatten()
						.filter_map(|id| state.entities.get(id).cloned())
						.map(EntityOp::create)
						.collect()
				};
				let (tx, rx) = mpsc::channel(WATCH_BUFFER);
				watchers.by_index.entry(key).or_default().push(tx);
				let _ = reply.send(Ok((initial, rx)));
			}
		}
	}
	debug!("entity store committer stopped");
}

/// Index keys reachable from an attribute list.
fn index_keys(schema: &Schema, attrs: &[Attr]) -> BTreeSet<IndexKey> {
	attrs
		.iter()
		.filter(|a| schema.index_mode(a.id) != IndexMode::None)
		.map(|a| (a.id, a.value.index_key()))
		.collect()
}

fn sandbox_status(entity: &Entity) -> Option<SandboxStatus> {
	entity
		.first(attr::SANDBOX_STATUS)
		.and_then(|v| v.as_sym())
		.and_then(SandboxStatus::from_sym)
}

fn is_sandbox(entity: &Entity) -> bool {
	entity.first(attr::KIND).and_then(|v| v.as_sym()) == Some("sandbox")
}

/// Domain guard: sandbox status never moves backwards.
fn check_transition(old: &Entity, new: &Entity) -> Result<()> {
	if !is_sandbox(new) {
		return Ok(());
	}
	if let (Some(from), Some(to)) = (sandbox_status(old), sandbox_status(new)) {
		if !from.can_become(to) {
			return Err(Error::Precondition(format!(
				"sandbox {} cannot move from {from} to {to}",
				new.id
			)));
		}
	}
	Ok(())
}

fn check_unique(
	state: &State,
	schema: &Schema,
	id: &EntityId,
	keys: &BTreeSet<IndexKey>,
) -> Result<()> {
	for key in keys {
		if schema.index_mode(key.0) != IndexMode::Unique {
			continue;
		}
		if let Some(ids) = state.indexes.get(key) {
			if let Some(existing) = ids.iter().find(|other| *other != id) {
				return Err(Error::AlreadyExists(existing.clone()));
			}
		}
	}
	Ok(())
}

async fn apply_put(
	state: &RwLock<State>,
	schema: &Schema,
	mut entity: Entity,
) -> Result<(PutOutcome, Notice)> {
	for a in &mut entity.attrs {
		*a = schema.normalize(a.clone());
	}
	let now = now_ms();
	let mut state = state.write().await;

	match state.entities.get(&entity.id).cloned() {
		None => {
			if entity.revision != 0 {
				// An expected revision against a missing entity.
				return Err(Error::NotFound(entity.id.clone()));
			}
			let keys = index_keys(schema, &entity.attrs);
			check_unique(&state, schema, &entity.id, &keys)?;
			entity.revision = 1;
			entity.created_at = now;
			entity.updated_at = now;
			for key in &keys {
				state
					.indexes
					.entry(key.clone())
					.or_default()
					.insert(entity.id.clone());
			}
			state.entities.insert(entity.id.clone(), entity.clone());
			let outcome = PutOutcome {
				id: entity.id.clone(),
				revision: 1,
			};
			let index_ops = keys
				.into_iter()
				.map(|key| (key, EntityOp::create(entity.clone())))
				.collect();
			Ok((
				outcome,
				Notice {
					op: Some(EntityOp::create(entity)),
					index_ops,
				},
			))
		}
		Some(old) => {
			if entity.revision == 0 {
				// A create racing an existing entity, not an update.
				return Err(Error::AlreadyExists(entity.id.clone()));
			}
			if entity.revision != old.revision {
				return Err(Error::Conflict {
					id: entity.id.clone(),
					expected: entity.revision,
					current: old.revision,
				});
			}
			if entity.attrs == old.attrs {
				// Content-identical write: revision untouched, no op.
				return Ok((
					PutOutcome {
						id: entity.id.clone(),
						revision: old.revision,
					},
					Notice::default(),
				));
			}
			check_transition(&old, &entity)?;

			let old_keys = index_keys(schema, &old.attrs);
			let new_keys = index_keys(schema, &entity.attrs);
			let added: BTreeSet<_> =
				new_keys.difference(&old_keys).cloned().collect();
			check_unique(&state, schema, &entity.id, &added)?;

			let previous = old.revision;
			entity.revision = previous + 1;
			entity.created_at = old.created_at;
			entity.updated_at = now.max(old.updated_at);

			for key in old_keys.difference(&new_keys) {
				if let Some(ids) = state.indexes.get_mut(key) {
					ids.remove(&entity.id);
					if ids.is_empty() {
						state.indexes.remove(key);
					}
				}
			}
			for key in &added {
				state
					.indexes
					.entry(key.clone())
					.or_default()
					.insert(entity.id.clone());
			}
			state.entities.insert(entity.id.clone(), entity.clone());

			let mut index_ops = Vec::new();
			for key in old_keys.difference(&new_keys) {
				index_ops.push((
					key.clone(),
					EntityOp::delete(entity.id.clone(), previous),
				));
			}
			for key in new_keys.intersection(&old_keys) {
				index_ops.push((
					key.clone(),
					EntityOp::update(entity.clone(), previous),
				));
			}
			for key in added {
				index_ops.push((key, EntityOp::create(entity.clone())));
			}

			let outcome = PutOutcome {
				id: entity.id.clone(),
				revision: entity.revision,
			};
			Ok((
				outcome,
				Notice {
					op: Some(EntityOp::update(entity, previous)),
					index_ops,
				},
			))
		}
	}
}

async fn apply_delete(
	state: &RwLock<State>,
	schema: &Schema,
	id: &EntityId,
	expected: Option<u64>,
) -> Result<(u64, Notice)> {
	let mut state = state.write().await;
	let old = state
		.entities
		.get(id)
		.cloned()
		.ok_or_else(|| Error::NotFound(id.clone()))?;
	if let Some(expected) = expected {
		if expected != old.revision {
			return Err(Error::Conflict {
				id: id.clone(),
				expected,
				current: old.revision,
			});
		}
	}
	if is_sandbox(&old) && sandbox_status(&old) != Some(SandboxStatus::Dead) {
		return Err(Error::Precondition(format!(
			"sandbox {id} must be DEAD before delete"
		)));
	}

	let keys = index_keys(schema, &old.attrs);
	for key in &keys {
		if let Some(ids) = state.indexes.get_mut(key) {
			ids.remove(id);
			if ids.is_empty() {
				state.indexes.remove(key);
			}
		}
	}
	state.entities.remove(id);

	let previous = old.revision;
	let index_ops = keys
		.into_iter()
		.map(|key| (key, EntityOp::delete(id.clone(), previous)))
		.collect();
	Ok((
		previous,
		Notice {
			op: Some(EntityOp::delete(id.clone(), previous)),
			index_ops,
		},
	))
}

/// Fans a committed op out to its watchers, in commit order. A full watcher
/// channel blocks the committer; a closed one is dropped from the set.
async fn deliver(watchers: &mut Watchers, notice: Notice) {
	let Some(op) = notice.op else {
		return;
	};
	if let Some(list) = watchers.by_entity.get_mut(&op.entity_id) {
		send_all(list, &op).await;
	}
	for (key, op) in notice.index_ops {
		if let Some(list) = watchers.by_index.get_mut(&key) {
			send_all(list, &op).await;
		}
	}
}

async fn send_all(list: &mut Vec<mpsc::Sender<EntityOp>>, op: &EntityOp) {
	let mut dead = Vec::new();
	for (i, tx) in list.iter().enumerate() {
		if tx.send(op.clone()).await.is_err() {
			dead.push(i);
		}
	}
	for i in dead.into_iter().rev() {
		list.remove(i);
	}
}
