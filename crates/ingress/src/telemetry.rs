use std::time::Duration;

use entity_common::entity::now_ms;
use tracing::info;

/// One completed (or timed-out) request.
///
/// Emitted on a non-cancellable path: the record is produced when the
/// response body finishes *or is dropped*, so cancelled and timed-out
/// requests still show up, with the status the client actually observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
	pub timestamp_ms: u64,
	/// Name of the app that served the request; empty when resolution
	/// never got that far.
	pub app: String,
	pub method: String,
	pub path: String,
	pub status: u16,
	pub bytes: u64,
	pub duration: Duration,
}

impl RequestRecord {
	pub fn new(app: String, method: String, path: String) -> Self {
		Self {
			timestamp_ms: now_ms(),
			app,
			method,
			path,
			status: 0,
			bytes: 0,
			duration: Duration::ZERO,
		}
	}
}

/// Sink for request records. Implementations must not block.
pub trait Telemetry: Send + Sync + 'static {
	fn record(&self, record: RequestRecord);
}

/// Default sink: structured request logs.
#[derive(Debug, Default)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
	fn record(&self, r: RequestRecord) {
		info!(
			target: "ingress::requests",
			app = %r.app,
			method = %r.method,
			path = %r.path,
			status = r.status,
			bytes = r.bytes,
			duration_ms = r.duration.as_millis() as u64,
			"request"
		);
	}
}
