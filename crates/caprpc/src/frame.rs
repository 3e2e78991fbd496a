use serde::{Deserialize, Serialize};

use entity_common::record::Record;

/// Correlates calls with returns. Allocated by the sending side; the two
/// directions use independent id spaces.
pub type CallId = u64;

/// Short handle for an object registered in a connection's export table.
pub type Oid = u64;

/// What a call is aimed at: a named bootstrap interface, or a capability the
/// peer handed us earlier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
	Interface(String),
	Cap(Oid),
}

/// What kind of object a capability descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapKind {
	/// A callable object; invoke with `Target::Cap`.
	Object,
	/// A streaming sink accepting `Push` frames. `credit` is the number of
	/// outstanding pushes the receiver grants before the producer must wait
	/// for acks.
	Sink { credit: u32 },
}

/// A live object reference attached to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapDescriptor {
	pub oid: Oid,
	pub kind: CapKind,
}

/// An application-level error crossing the wire: a stable numeric code plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("remote error {code}: {message}")]
pub struct WireError {
	pub code: u32,
	pub message: String,
}

impl From<entity_common::Error> for WireError {
	fn from(err: entity_common::Error) -> Self {
		WireError {
			code: err.code(),
			message: err.wire_message(),
		}
	}
}

impl From<WireError> for entity_common::Error {
	fn from(err: WireError) -> Self {
		entity_common::Error::from_wire(err.code, err.message)
	}
}

/// The frame vocabulary. Field layout is stable; additions append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
	Call {
		id: CallId,
		target: Target,
		method: String,
		args: Record,
		caps: Vec<CapDescriptor>,
	},
	Return {
		id: CallId,
		result: Result<Record, WireError>,
	},
	/// The caller lost interest; the callee should stop work and release any
	/// capabilities dedicated to the call. Also acks pushes never made.
	Cancel { id: CallId },
	/// Drops one reference to an exported object.
	CapRelease { oid: Oid },
	/// One element on a streaming sink. Acked by a `Return` with the same id,
	/// which hands one credit back to the producer.
	Push {
		id: CallId,
		oid: Oid,
		payload: Record,
	},
	/// Terminal frame of a stream. `reason` is `None` for a clean close.
	PushClose {
		oid: Oid,
		reason: Option<String>,
	},
}

#[cfg(test)]
mod test {
	use super::*;
	use entity_common::record::RecordValue;

	#[test]
	fn frames_round_trip_through_json() {
		let mut args = Record::new();
		args.set(0, RecordValue::Str("e-1".into()));
		let frame = Frame::Call {
			id: 7,
			target: Target::Interface("miren.dev/EntityAccess".into()),
			method: "Get".into(),
			args,
			caps: vec![CapDescriptor {
				oid: 3,
				kind: CapKind::Sink { credit: 32 },
			}],
		};
		let json = serde_json::to_string(&frame).unwrap();
		let back: Frame = serde_json::from_str(&json).unwrap();
		assert_eq!(back, frame);
	}

	#[test]
	fn error_returns_round_trip() {
		let frame = Frame::Return {
			id: 9,
			result: Err(WireError {
				code: 1,
				message: "entity not found".into(),
			}),
		};
		let json = serde_json::to_string(&frame).unwrap();
		assert_eq!(serde_json::from_str::<Frame>(&json).unwrap(), frame);
	}
}
