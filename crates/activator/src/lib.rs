//! The sandbox activator: lazily boots sandboxes for `(app, version,
//! service)` pools and hands out bounded leases over their URLs.
//!
//! The activator never effects boot or teardown itself. It writes sandbox
//! entities (desired shape, stop/kill nudges) and observes what the external
//! sandbox controller does through the pool's index watch; status is owned by
//! the controller. One reconcile task per pool trues up desired instance
//! counts, expires unrenewed leases and scales idle sandboxes down,
//! least-recently-used first.

mod error;
mod lease;
mod pool;

pub use self::error::ActivatorError;
pub use self::lease::Lease;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use entity_client::AppsClient;
use entity_common::entity::EntityId;
use entity_common::kinds::{pool_key, AppVersion};
use entity_common::Error;

use self::pool::Pool;

#[derive(Debug, Clone)]
pub struct ActivatorConfig {
	/// How long a handed-out lease stays valid without a renew.
	pub lease_ttl: Duration,
	/// Cap on waiting for a sandbox to reach RUNNING.
	pub boot_timeout: Duration,
	/// Hard cap on sandboxes per pool.
	pub max_pool_size: u32,
	pub reconcile_interval: Duration,
}

impl Default for ActivatorConfig {
	fn default() -> Self {
		Self {
			lease_ttl: Duration::from_secs(60),
			boot_timeout: Duration::from_secs(120),
			max_pool_size: 100,
			reconcile_interval: Duration::from_secs(1),
		}
	}
}

struct Inner {
	apps: AppsClient,
	cfg: ActivatorConfig,
	pools: Mutex<HashMap<String, Arc<Pool>>>,
	shutdown: CancellationToken,
}

/// Handle to the activator. Cheap to clone.
#[derive(Clone)]
pub struct Activator {
	inner: Arc<Inner>,
}

impl Activator {
	pub fn new(apps: AppsClient, cfg: ActivatorConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				apps,
				cfg,
				pools: Mutex::new(HashMap::new()),
				shutdown: CancellationToken::new(),
			}),
		}
	}

	/// Acquires a lease on a RUNNING sandbox of the pool, booting one if the
	/// pool scales on demand. Retries of transient store errors happen
	/// underneath; a sandbox observed DEAD before RUNNING is never retried
	/// and surfaces as [`ActivatorError::SandboxDiedEarly`].
	pub async fn acquire_lease(
		&self,
		version_id: &EntityId,
		version: &AppVersion,
		service: &str,
	) -> Result<Lease, ActivatorError> {
		let pool = self.pool(version_id, version, service).await?;
		pool.acquire().await
	}

	/// Pushes the lease deadline forward one TTL.
	pub async fn renew_lease(&self, lease: &Lease) -> Result<Lease, ActivatorError> {
		let pool = self.existing_pool(&lease.pool_key).await?;
		pool.renew(lease).await
	}

	/// Returns a lease to the pool. Idempotent.
	pub async fn release_lease(&self, lease: &Lease) {
		if let Ok(pool) = self.existing_pool(&lease.pool_key).await {
			pool.release(lease).await;
		}
	}

	/// Stops the pool tasks. In-flight acquires fail promptly.
	pub fn shutdown(&self) {
		self.inner.shutdown.cancel();
	}

	async fn pool(
		&self,
		version_id: &EntityId,
		version: &AppVersion,
		service: &str,
	) -> Result<Arc<Pool>, ActivatorError> {
		let spec = version.service(service).ok_or_else(|| {
			ActivatorError::Store(Error::Invalid(format!(
				"version {version_id} has no service {service}"
			)))
		})?;
		let key = pool_key(&version.app, version_id, service);
		let mut pools = self.inner.pools.lock().await;
		if let Some(pool) = pools.get(&key) {
			return Ok(pool.clone());
		}
		let pool = Pool::start(
			key.clone(),
			version_id.clone(),
			version.clone(),
			spec.clone(),
			self.inner.apps.clone(),
			self.inner.cfg.clone(),
			self.inner.shutdown.child_token(),
		);
		pools.insert(key, pool.clone());
		Ok(pool)
	}

	async fn existing_pool(&self, key: &str) -> Result<Arc<Pool>, ActivatorError> {
		self.inner
			.pools
			.lock()
			.await
			.get(key)
			.cloned()
			.ok_or_else(|| {
				ActivatorError::Store(Error::NotFound(EntityId::from(key)))
			})
	}
}
