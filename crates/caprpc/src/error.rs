use crate::frame::WireError;

/// Errors surfaced by the RPC runtime itself.
///
/// Application-level failures travel as [`WireError`]s inside `Call`; the
/// other variants describe the fate of the call, not of the callee.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
	/// The transport is gone. All in-flight calls on a connection fail with
	/// this at once, and every capability it issued is revoked.
	#[error("disconnected")]
	Disconnected,
	/// The call (or the stream it fed) was cancelled.
	#[error("cancelled")]
	Cancelled,
	/// The producer ended the stream with a reason.
	#[error("stream closed: {0}")]
	StreamClosed(String),
	/// The peer answered with an application error.
	#[error(transparent)]
	Call(#[from] WireError),
	/// The peer violated the protocol (unknown target, credit overrun, ...).
	#[error("protocol error: {0}")]
	Protocol(String),
}

impl RpcError {
	/// The application error, when there is one.
	pub fn as_wire(&self) -> Option<&WireError> {
		match self {
			RpcError::Call(err) => Some(err),
			_ => None,
		}
	}
}
