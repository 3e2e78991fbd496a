/// Failures of lease acquisition and sandbox activation.
#[derive(Debug, thiserror::Error)]
pub enum ActivatorError {
	/// The sandbox reached DEAD before ever RUNNING. The ingress surfaces
	/// this as a 408 with a user-facing hint.
	#[error("sandbox died while starting")]
	SandboxDiedEarly,
	/// No sandbox can take another lease within the pool's limits.
	#[error("no lease capacity in pool")]
	NoCapacity,
	/// The boot wait exceeded its budget.
	#[error("timed out waiting for sandbox boot")]
	DeadlineExceeded,
	/// The entity store said no.
	#[error(transparent)]
	Store(#[from] entity_common::Error),
}

impl ActivatorError {
	pub fn is_sandbox_died_early(&self) -> bool {
		matches!(self, ActivatorError::SandboxDiedEarly)
	}
}
