use crate::entity::EntityId;

/// Error taxonomy shared by the store, the RPC surface and the clients.
///
/// Every variant has a stable numeric code so that errors survive a trip
/// through the RPC layer without losing their kind. Messages are carried as
/// plain strings; only the code participates in matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	#[error("entity not found: {0}")]
	NotFound(EntityId),
	#[error("entity already exists: {0}")]
	AlreadyExists(EntityId),
	#[error("revision conflict on {id}: expected {expected}, current {current}")]
	Conflict {
		id: EntityId,
		expected: u64,
		current: u64,
	},
	#[error("precondition failed: {0}")]
	Precondition(String),
	#[error("attribute is not indexed: {0}")]
	UnknownIndex(String),
	#[error("unknown kind: {0}")]
	UnknownKind(String),
	#[error("unknown attribute: {0}")]
	UnknownAttr(String),
	#[error("invalid entity: {0}")]
	Invalid(String),
	#[error("parse error: {0}")]
	Parse(String),
	#[error("format error: {0}")]
	Format(String),
	#[error("cancelled")]
	Cancelled,
	#[error("deadline exceeded")]
	DeadlineExceeded,
	#[error("disconnected")]
	Disconnected,
	#[error("unauthorized")]
	Unauthorized,
}

impl Error {
	/// Stable wire code for this error kind.
	pub fn code(&self) -> u32 {
		match self {
			Error::NotFound(_) => 1,
			Error::AlreadyExists(_) => 2,
			Error::Conflict { .. } => 3,
			Error::Precondition(_) => 4,
			Error::UnknownIndex(_) => 5,
			Error::UnknownKind(_) => 6,
			Error::UnknownAttr(_) => 7,
			Error::Invalid(_) => 8,
			Error::Parse(_) => 9,
			Error::Format(_) => 10,
			Error::Cancelled => 11,
			Error::DeadlineExceeded => 12,
			Error::Disconnected => 13,
			Error::Unauthorized => 14,
		}
	}

	/// Message carried next to the wire code. Id-shaped variants send just
	/// the id so [`Error::from_wire`] can rebuild them.
	pub fn wire_message(&self) -> String {
		match self {
			Error::NotFound(id) | Error::AlreadyExists(id) => id.to_string(),
			Error::Conflict { id, .. } => id.to_string(),
			other => other.to_string(),
		}
	}

	/// Reconstructs an error from its wire code and message.
	///
	/// Structured fields (conflict revisions, ids) are flattened into the
	/// message on the way out, so the round trip preserves the kind but not
	/// the structure. Matching is always on the kind.
	pub fn from_wire(code: u32, message: String) -> Self {
		match code {
			1 => Error::NotFound(EntityId::from(message)),
			2 => Error::AlreadyExists(EntityId::from(message)),
			3 => Error::Conflict {
				id: EntityId::from(message),
				expected: 0,
				current: 0,
			},
			4 => Error::Precondition(message),
			5 => Error::UnknownIndex(message),
			6 => Error::UnknownKind(message),
			7 => Error::UnknownAttr(message),
			8 => Error::Invalid(message),
			9 => Error::Parse(message),
			10 => Error::Format(message),
			11 => Error::Cancelled,
			12 => Error::DeadlineExceeded,
			14 => Error::Unauthorized,
			_ => Error::Disconnected,
		}
	}

	pub fn is_not_found(&self) -> bool {
		matches!(self, Error::NotFound(_))
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, Error::Conflict { .. })
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn conflict_kind_survives_wire() {
		let err = Error::Conflict {
			id: EntityId::from("e-1"),
			expected: 3,
			current: 4,
		};
		let back = Error::from_wire(err.code(), "e-1".into());
		assert!(back.is_conflict());
	}

	#[test]
	fn not_found_round_trips() {
		let err = Error::NotFound(EntityId::from("e-404"));
		let back = Error::from_wire(err.code(), "e-404".into());
		assert!(back.is_not_found());
	}
}
