use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use entity_common::record::Record;

use crate::conn::Connection;
use crate::error::RpcError;
use crate::frame::{CallId, Frame, Oid};

/// What the export table delivers to a local sink.
pub enum SinkEvent {
	Item { payload: Record, ack: CallId },
	Closed(Option<String>),
	Error(RpcError),
}

/// Consumer half of a streaming sink: the elements the peer pushed, in wire
/// order.
///
/// Credit accounting is tied to consumption: each element is acked (handing
/// one credit back to the producer) when `next` yields it, not when it
/// arrives. A consumer that stops reading therefore stalls the producer once
/// the credit window is full; nothing is dropped.
pub struct SinkStream {
	conn: Connection,
	rx: mpsc::Receiver<SinkEvent>,
	terminated: bool,
}

impl SinkStream {
	pub(crate) fn new(conn: Connection, rx: mpsc::Receiver<SinkEvent>) -> Self {
		Self {
			conn,
			rx,
			terminated: false,
		}
	}

	/// Next pushed element. `None` after a clean close; a terminal error
	/// after cancellation, a reasoned close, or transport loss.
	pub async fn next(&mut self) -> Option<Result<Record, RpcError>> {
		if self.terminated {
			return None;
		}
		match self.rx.recv().await {
			Some(SinkEvent::Item { payload, ack }) => {
				let _ = self
					.conn
					.send_frame(Frame::Return {
						id: ack,
						result: Ok(Record::new()),
					})
					.await;
				Some(Ok(payload))
			}
			Some(SinkEvent::Closed(None)) => {
				self.terminated = true;
				None
			}
			Some(SinkEvent::Closed(Some(reason))) => {
				self.terminated = true;
				if reason == "cancelled" {
					Some(Err(RpcError::Cancelled))
				} else {
					Some(Err(RpcError::StreamClosed(reason)))
				}
			}
			Some(SinkEvent::Error(err)) => {
				self.terminated = true;
				Some(Err(err))
			}
			// Export revoked without a close frame: the producer vanished.
			None => {
				self.terminated = true;
				Some(Err(RpcError::Cancelled))
			}
		}
	}
}

/// Producer half of a streaming sink, backed by a capability the peer
/// attached to a call.
///
/// `push` consumes one credit per element and waits when the window is
/// exhausted; credits come back as the consumer reads. Dropping the producer
/// without `close` releases the capability, which the consumer observes as a
/// cancelled stream.
pub struct RemoteSink {
	conn: Connection,
	oid: Oid,
	credits: Arc<Semaphore>,
	failed: Arc<AtomicBool>,
	closed: bool,
}

impl RemoteSink {
	pub(crate) fn new(conn: Connection, oid: Oid, credit: u32) -> Self {
		Self {
			conn,
			oid,
			credits: Arc::new(Semaphore::new(credit.max(1) as usize)),
			failed: Arc::new(AtomicBool::new(false)),
			closed: false,
		}
	}

	/// Pushes one element, waiting for credit if the window is exhausted.
	pub async fn push(&self, payload: Record) -> Result<(), RpcError> {
		if self.failed.load(Ordering::Relaxed) {
			return Err(RpcError::Cancelled);
		}
		let permit = self
			.credits
			.clone()
			.acquire_owned()
			.await
			.map_err(|_| RpcError::Cancelled)?;
		let id = self.conn.next_call_id();
		self.conn.inner.pending.insert(
			id,
			crate::conn::Pending::PushAck {
				permit,
				failed: self.failed.clone(),
			},
		);
		self.conn
			.send_frame(Frame::Push {
				id,
				oid: self.oid,
				payload,
			})
			.await
	}

	/// Terminates the stream. `reason` of `None` is a clean end-of-stream;
	/// anything else surfaces as an error on the consumer side.
	pub async fn close(mut self, reason: Option<String>) -> Result<(), RpcError> {
		self.closed = true;
		self.conn
			.send_frame(Frame::PushClose {
				oid: self.oid,
				reason,
			})
			.await?;
		self.release();
		Ok(())
	}

	fn release(&self) {
		let _ = self
			.conn
			.inner
			.out_tx
			.try_send(Frame::CapRelease { oid: self.oid });
	}
}

impl Drop for RemoteSink {
	fn drop(&mut self) {
		if !self.closed {
			self.release();
		}
	}
}
