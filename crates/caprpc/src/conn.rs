use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use entity_common::record::Record;

use crate::error::RpcError;
use crate::frame::{CallId, CapDescriptor, CapKind, Frame, Oid, Target, WireError};
use crate::stream::{RemoteSink, SinkEvent, SinkStream};

/// An object callable from the peer: the bootstrap interfaces and every
/// exported `Object` capability implement this.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
	async fn call(
		&self,
		ctx: CallCtx,
		method: &str,
		args: Record,
	) -> Result<Record, WireError>;
}

/// Per-call context handed to a [`Handler`]: the connection plus the
/// capabilities the caller attached.
pub struct CallCtx {
	conn: Connection,
	caps: Vec<CapDescriptor>,
}

impl CallCtx {
	pub fn conn(&self) -> &Connection {
		&self.conn
	}

	pub fn caps(&self) -> &[CapDescriptor] {
		&self.caps
	}

	/// Resolves the `index`th attached capability as a streaming sink.
	pub fn sink(&self, index: usize) -> Result<RemoteSink, WireError> {
		match self.caps.get(index) {
			Some(CapDescriptor {
				oid,
				kind: CapKind::Sink { credit },
			}) => Ok(RemoteSink::new(self.conn.clone(), *oid, *credit)),
			Some(_) => Err(WireError {
				code: 0,
				message: format!("cap {index} is not a sink"),
			}),
			None => Err(WireError {
				code: 0,
				message: format!("missing cap {index}"),
			}),
		}
	}

	/// Resolves the `index`th attached capability as a callable object.
	pub fn object(&self, index: usize) -> Result<RemoteCap, WireError> {
		match self.caps.get(index) {
			Some(CapDescriptor {
				oid,
				kind: CapKind::Object,
			}) => Ok(RemoteCap {
				conn: self.conn.clone(),
				oid: *oid,
			}),
			Some(_) => Err(WireError {
				code: 0,
				message: format!("cap {index} is not an object"),
			}),
			None => Err(WireError {
				code: 0,
				message: format!("missing cap {index}"),
			}),
		}
	}
}

/// A handle to an object living in the peer's export table. Dropping it
/// releases one reference on the peer.
pub struct RemoteCap {
	conn: Connection,
	oid: Oid,
}

impl RemoteCap {
	pub async fn call(
		&self,
		method: impl Into<String>,
		args: Record,
		caps: Vec<CapDescriptor>,
	) -> Result<Record, RpcError> {
		self.conn.call(Target::Cap(self.oid), method, args, caps).await
	}
}

impl Drop for RemoteCap {
	fn drop(&mut self) {
		let _ = self
			.conn
			.inner
			.out_tx
			.try_send(Frame::CapRelease { oid: self.oid });
	}
}

pub(crate) enum Pending {
	Call(oneshot::Sender<Result<Record, RpcError>>),
	/// An unacked stream push. Dropping the permit hands the credit back to
	/// the producer; `failed` flips when the ack is an error so the producer
	/// stops pushing.
	PushAck {
		permit: OwnedSemaphorePermit,
		failed: Arc<AtomicBool>,
	},
}

pub(crate) enum Export {
	Object {
		handler: Arc<dyn Handler>,
		refs: u32,
	},
	Sink {
		tx: mpsc::Sender<SinkEvent>,
		refs: u32,
	},
}

pub(crate) struct ConnInner {
	pub(crate) out_tx: mpsc::Sender<Frame>,
	pub(crate) pending: DashMap<CallId, Pending>,
	exports: DashMap<Oid, Export>,
	active: DashMap<CallId, AbortHandle>,
	interfaces: HashMap<String, Arc<dyn Handler>>,
	next_call_id: AtomicU64,
	next_oid: AtomicU64,
	shutdown: CancellationToken,
}

/// One end of an RPC connection. Cheap to clone; all clones share the same
/// transport, call table and export table.
#[derive(Clone)]
pub struct Connection {
	pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
	/// Drives `transport` with a reader and a writer task and returns the
	/// handle used to make calls. `interfaces` are the bootstrap objects the
	/// peer may target by name.
	pub fn spawn<T>(
		transport: T,
		interfaces: HashMap<String, Arc<dyn Handler>>,
	) -> Connection
	where
		T: Stream<Item = std::io::Result<Frame>>
			+ Sink<Frame, Error = std::io::Error>
			+ Send
			+ Unpin
			+ 'static,
	{
		let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
		let inner = Arc::new(ConnInner {
			out_tx,
			pending: DashMap::new(),
			exports: DashMap::new(),
			active: DashMap::new(),
			interfaces,
			next_call_id: AtomicU64::new(1),
			next_oid: AtomicU64::new(1),
			shutdown: CancellationToken::new(),
		});
		let conn = Connection { inner };

		let (mut sink, mut stream) = transport.split();

		let writer_token = conn.inner.shutdown.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = writer_token.cancelled() => break,
					frame = out_rx.recv() => match frame {
						Some(frame) => {
							trace!(?frame, "send");
							if let Err(err) = sink.send(frame).await {
								debug!("transport write failed: {err}");
								writer_token.cancel();
								break;
							}
						}
						None => break,
					},
				}
			}
			let _ = sink.close().await;
		});

		let reader = conn.clone();
		tokio::spawn(async move {
			let token = reader.inner.shutdown.clone();
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					item = stream.next() => match item {
						Some(Ok(frame)) => reader.dispatch(frame).await,
						Some(Err(err)) => {
							debug!("transport read failed: {err}");
							break;
						}
						None => break,
					},
				}
			}
			reader.shutdown();
		});

		conn
	}

	/// Makes a call and waits for its return. Dropping the returned future
	/// before completion sends a `Cancel` frame so the peer stops working.
	pub async fn call(
		&self,
		target: Target,
		method: impl Into<String>,
		args: Record,
		caps: Vec<CapDescriptor>,
	) -> Result<Record, RpcError> {
		if self.is_closed() {
			return Err(RpcError::Disconnected);
		}
		let id = self.next_call_id();
		let (tx, rx) = oneshot::channel();
		self.inner.pending.insert(id, Pending::Call(tx));
		let guard = CancelGuard {
			conn: self.clone(),
			id,
			armed: true,
		};
		self.send_frame(Frame::Call {
			id,
			target,
			method: method.into(),
			args,
			caps,
		})
		.await?;
		let result = rx.await.map_err(|_| RpcError::Disconnected)?;
		guard.disarm();
		result
	}

	/// Registers a sink object and returns the descriptor to attach to a
	/// call together with the stream of pushed elements.
	pub fn new_sink(&self, credit: u32) -> (CapDescriptor, SinkStream) {
		let (tx, rx) = mpsc::channel(credit as usize + 2);
		let oid = self.inner.next_oid.fetch_add(1, Ordering::Relaxed);
		self.inner.exports.insert(oid, Export::Sink { tx, refs: 1 });
		(
			CapDescriptor {
				oid,
				kind: CapKind::Sink { credit },
			},
			SinkStream::new(self.clone(), rx),
		)
	}

	/// Registers a callable object and returns its descriptor.
	pub fn export_object(&self, handler: Arc<dyn Handler>) -> CapDescriptor {
		let oid = self.inner.next_oid.fetch_add(1, Ordering::Relaxed);
		self.inner
			.exports
			.insert(oid, Export::Object { handler, refs: 1 });
		CapDescriptor {
			oid,
			kind: CapKind::Object,
		}
	}

	/// Tears the connection down: fails in-flight calls, closes local sinks,
	/// aborts handler tasks and revokes every capability this end issued.
	pub fn close(&self) {
		self.shutdown();
	}

	pub fn is_closed(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	/// Resolves when the connection has shut down.
	pub async fn closed(&self) {
		self.inner.shutdown.cancelled().await;
	}

	pub(crate) fn next_call_id(&self) -> CallId {
		self.inner.next_call_id.fetch_add(1, Ordering::Relaxed)
	}

	pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
		self.inner
			.out_tx
			.send(frame)
			.await
			.map_err(|_| RpcError::Disconnected)
	}

	async fn dispatch(&self, frame: Frame) {
		trace!(?frame, "recv");
		match frame {
			Frame::Call {
				id,
				target,
				method,
				args,
				caps,
			} => self.handle_call(id, target, method, args, caps),
			Frame::Return { id, result } => {
				if let Some((_, pending)) = self.inner.pending.remove(&id) {
					match pending {
						Pending::Call(tx) => {
							let _ = tx.send(result.map_err(RpcError::Call));
						}
						Pending::PushAck { permit, failed } => {
							if result.is_err() {
								failed.store(true, Ordering::Relaxed);
							}
							drop(permit);
						}
					}
				}
			}
			Frame::Cancel { id } => {
				if let Some((_, handle)) = self.inner.active.remove(&id) {
					handle.abort();
				}
			}
			Frame::CapRelease { oid } => self.release_export(oid),
			Frame::Push { id, oid, payload } => self.handle_push(id, oid, payload),
			Frame::PushClose { oid, reason } => {
				let is_sink = self
					.inner
					.exports
					.get(&oid)
					.map(|e| matches!(e.value(), Export::Sink { .. }))
					.unwrap_or(false);
				if is_sink {
					if let Some((_, Export::Sink { tx, .. })) =
						self.inner.exports.remove(&oid)
					{
						let _ = tx.try_send(SinkEvent::Closed(reason));
					}
				}
			}
		}
	}

	fn handle_call(
		&self,
		id: CallId,
		target: Target,
		method: String,
		args: Record,
		caps: Vec<CapDescriptor>,
	) {
		let handler = match &target {
			Target::Interface(name) => self.inner.interfaces.get(name).cloned(),
			Target::Cap(oid) => self.inner.exports.get(oid).and_then(|e| {
				match e.value() {
					Export::Object { handler, .. } => Some(handler.clone()),
					Export::Sink { .. } => None,
				}
			}),
		};
		let Some(handler) = handler else {
			warn!(?target, "call to unknown target");
			let _ = self.inner.out_tx.try_send(Frame::Return {
				id,
				result: Err(WireError {
					code: 0,
					message: format!("unknown call target: {target:?}"),
				}),
			});
			return;
		};

		let ctx = CallCtx {
			conn: self.clone(),
			caps,
		};
		let conn = self.clone();
		let task = tokio::spawn(async move {
			let result = handler.call(ctx, &method, args).await;
			conn.inner.active.remove(&id);
			let _ = conn.send_frame(Frame::Return { id, result }).await;
		});
		let handle = task.abort_handle();
		self.inner.active.insert(id, handle);
		if task.is_finished() {
			// Completed before the insert; its own cleanup already ran.
			self.inner.active.remove(&id);
		}
	}

	fn handle_push(&self, id: CallId, oid: Oid, payload: Record) {
		let delivered = match self.inner.exports.get(&oid) {
			Some(export) => match export.value() {
				Export::Sink { tx, .. } => {
					tx.try_send(SinkEvent::Item { payload, ack: id }).is_ok()
				}
				Export::Object { .. } => false,
			},
			None => false,
		};
		if !delivered {
			// Either the sink is gone or the peer overran its credit.
			let _ = self.inner.out_tx.try_send(Frame::Return {
				id,
				result: Err(WireError {
					code: 0,
					message: format!("push to unavailable sink {oid}"),
				}),
			});
		}
	}

	fn release_export(&self, oid: Oid) {
		if let dashmap::mapref::entry::Entry::Occupied(mut entry) =
			self.inner.exports.entry(oid)
		{
			let refs = match entry.get_mut() {
				Export::Object { refs, .. } => refs,
				Export::Sink { refs, .. } => refs,
			};
			*refs -= 1;
			if *refs == 0 {
				entry.remove();
			}
		}
	}

	fn shutdown(&self) {
		if self.inner.shutdown.is_cancelled() {
			return;
		}
		self.inner.shutdown.cancel();

		let pending: Vec<CallId> =
			self.inner.pending.iter().map(|e| *e.key()).collect();
		for id in pending {
			match self.inner.pending.remove(&id) {
				Some((_, Pending::Call(tx))) => {
					let _ = tx.send(Err(RpcError::Disconnected));
				}
				// Push acks: dropping the entry returns the permit.
				_ => {}
			}
		}

		let exports: Vec<Oid> = self.inner.exports.iter().map(|e| *e.key()).collect();
		for oid in exports {
			if let Some((_, Export::Sink { tx, .. })) =
				self.inner.exports.remove(&oid)
			{
				let _ = tx.try_send(SinkEvent::Error(RpcError::Disconnected));
			}
		}

		let active: Vec<CallId> = self.inner.active.iter().map(|e| *e.key()).collect();
		for id in active {
			if let Some((_, handle)) = self.inner.active.remove(&id) {
				handle.abort();
			}
		}
	}
}

struct CancelGuard {
	conn: Connection,
	id: CallId,
	armed: bool,
}

impl CancelGuard {
	fn disarm(mut self) {
		self.armed = false;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		if self.conn.inner.pending.remove(&self.id).is_some() {
			let _ = self
				.conn
				.inner
				.out_tx
				.try_send(Frame::Cancel { id: self.id });
		}
	}
}
