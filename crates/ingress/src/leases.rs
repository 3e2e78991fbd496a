use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use activator::{Activator, Lease};
use entity_common::entity::EntityId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One cached lease plus the ingress-local use count multiplexed over it.
struct CachedLease {
	entry: u64,
	lease: Lease,
	uses: u32,
}

struct CacheInner {
	by_app: HashMap<EntityId, Vec<CachedLease>>,
	next_entry: u64,
}

/// The `app → leases` cache in front of the activator.
///
/// One mutex guards the whole map; every mutation (retain, use, release,
/// invalidate, expire) takes it, and it is never held across I/O. The
/// per-request fast path is `use_lease`; the activator is only consulted
/// when every cached lease is at capacity.
#[derive(Clone)]
pub struct LeaseCache {
	inner: Arc<Mutex<CacheInner>>,
}

/// A checked-out use of a cached lease. Dropping it returns the use.
pub struct LeaseUse {
	cache: LeaseCache,
	app: EntityId,
	entry: u64,
	pub lease: Lease,
}

impl LeaseUse {
	/// Pulls this lease out of the cache (dead backend). Idempotent across
	/// guards: the first caller gets the lease to hand back to the
	/// activator, later ones get `None`. The guard's own release then
	/// becomes a no-op.
	pub fn invalidate(&self) -> Option<Lease> {
		self.cache.invalidate(&self.app, self.entry)
	}
}

impl Drop for LeaseUse {
	fn drop(&mut self) {
		self.cache.release(&self.app, self.entry);
	}
}

impl LeaseCache {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(CacheInner {
				by_app: HashMap::new(),
				next_entry: 1,
			})),
		}
	}

	/// Fast path: a cached lease with spare capacity, if any.
	pub fn use_lease(&self, app: &EntityId) -> Option<LeaseUse> {
		let mut inner = self.inner.lock().expect("lease cache poisoned");
		let leases = inner.by_app.get_mut(app)?;
		let cached = leases.iter_mut().find(|c| c.uses < c.lease.size)?;
		cached.uses += 1;
		Some(LeaseUse {
			cache: self.clone(),
			app: app.clone(),
			entry: cached.entry,
			lease: cached.lease.clone(),
		})
	}

	/// Caches a freshly acquired lease with one use checked out.
	pub fn retain(&self, app: &EntityId, lease: Lease) -> LeaseUse {
		let mut inner = self.inner.lock().expect("lease cache poisoned");
		let entry = inner.next_entry;
		inner.next_entry += 1;
		inner.by_app.entry(app.clone()).or_default().push(CachedLease {
			entry,
			lease: lease.clone(),
			uses: 1,
		});
		LeaseUse {
			cache: self.clone(),
			app: app.clone(),
			entry,
			lease,
		}
	}

	fn release(&self, app: &EntityId, entry: u64) {
		let mut inner = self.inner.lock().expect("lease cache poisoned");
		if let Some(leases) = inner.by_app.get_mut(app) {
			if let Some(cached) = leases.iter_mut().find(|c| c.entry == entry) {
				cached.uses = cached.uses.saturating_sub(1);
			}
		}
	}

	/// Removes a lease observed pointing at a dead backend. Idempotent: a
	/// second invalidation of the same entry returns `None`. The caller
	/// releases the returned lease back to the activator.
	pub fn invalidate(&self, app: &EntityId, entry: u64) -> Option<Lease> {
		let mut inner = self.inner.lock().expect("lease cache poisoned");
		let leases = inner.by_app.get_mut(app)?;
		let index = leases.iter().position(|c| c.entry == entry)?;
		let cached = leases.remove(index);
		if leases.is_empty() {
			inner.by_app.remove(app);
		}
		Some(cached.lease)
	}

	/// Drains everything, for shutdown.
	pub fn drain(&self) -> Vec<Lease> {
		let mut inner = self.inner.lock().expect("lease cache poisoned");
		inner
			.by_app
			.drain()
			.flat_map(|(_, leases)| leases.into_iter().map(|c| c.lease))
			.collect()
	}

	/// The expiry loop: idle leases go back to the activator, busy ones get
	/// renewed, leases that fail renewal are dropped. One task mutates the
	/// cache; the snapshot/renew split keeps the mutex away from I/O.
	pub async fn run_expiry(
		&self,
		activator: Activator,
		interval: Duration,
		shutdown: CancellationToken,
	) {
		let mut tick = tokio::time::interval(interval);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = tick.tick() => {}
			}

			// Snapshot under the lock, then do lease I/O without it.
			let snapshot: Vec<(EntityId, u64, Lease, u32)> = {
				let inner = self.inner.lock().expect("lease cache poisoned");
				inner
					.by_app
					.iter()
					.flat_map(|(app, leases)| {
						leases.iter().map(|c| {
							(app.clone(), c.entry, c.lease.clone(), c.uses)
						})
					})
					.collect()
			};

			for (app, entry, lease, uses) in snapshot {
				if uses == 0 {
					if let Some(lease) = self.invalidate(&app, entry) {
						debug!(sandbox = %lease.sandbox_id, "releasing idle lease");
						activator.release_lease(&lease).await;
					}
					continue;
				}
				match activator.renew_lease(&lease).await {
					Ok(renewed) => {
						let mut inner =
							self.inner.lock().expect("lease cache poisoned");
						if let Some(leases) = inner.by_app.get_mut(&app) {
							if let Some(cached) =
								leases.iter_mut().find(|c| c.entry == entry)
							{
								cached.lease = renewed;
							}
						}
					}
					Err(err) => {
						info!(sandbox = %lease.sandbox_id, "dropping lease that failed renewal: {err}");
						let _ = self.invalidate(&app, entry);
					}
				}
			}
		}
	}
}

impl Default for LeaseCache {
	fn default() -> Self {
		Self::new()
	}
}
