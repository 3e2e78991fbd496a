use tokio::time::Instant;
use url::Url;

use entity_common::entity::EntityId;

/// A retained right to send up to `size` concurrent requests to a sandbox's
/// URL until `deadline`. Renewing pushes the deadline forward one TTL.
#[derive(Debug, Clone)]
pub struct Lease {
	pub url: Url,
	pub size: u32,
	pub deadline: Instant,
	pub pool_key: String,
	pub sandbox_id: EntityId,
}
