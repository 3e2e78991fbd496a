use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use entity_client::AppsClient;
use entity_common::entity::{EntityId, EntityOp, OpKind};
use entity_common::kinds::{
	AppVersion, Codec, Concurrency, ContainerSpec, PortSpec, Sandbox,
	SandboxStatus, ServiceSpec,
};
use entity_common::Error;

use crate::error::ActivatorError;
use crate::lease::Lease;
use crate::ActivatorConfig;

/// What the pool knows about one live sandbox, fed by the index watch.
struct Live {
	status: SandboxStatus,
	address: Option<String>,
	port: Option<u16>,
	/// Whether its lease is currently handed out. A delegated lease owns all
	/// `size` slots of the sandbox until released or expired.
	delegated: bool,
	lease_deadline: Option<Instant>,
	idle_since: Instant,
	since: Instant,
}

#[derive(Default)]
struct PoolState {
	// BTreeMap so the smallest id wins ties deterministically.
	sandboxes: BTreeMap<EntityId, Live>,
	/// Boots that reached DEAD before RUNNING, so a waiting acquire can tell
	/// "died early" apart from "deleted".
	dead_boots: HashSet<EntityId>,
}

impl PoolState {
	fn free_running(&self) -> Option<EntityId> {
		self.sandboxes
			.iter()
			.find(|(_, l)| {
				l.status == SandboxStatus::Running
					&& !l.delegated && l.address.is_some()
					&& l.port.is_some()
			})
			.map(|(id, _)| id.clone())
	}

	fn pending_count(&self) -> usize {
		self.sandboxes
			.values()
			.filter(|l| l.status == SandboxStatus::Pending)
			.count()
	}

	fn live_count(&self) -> usize {
		self.sandboxes
			.values()
			.filter(|l| {
				matches!(l.status, SandboxStatus::Pending | SandboxStatus::Running)
			})
			.count()
	}
}

/// One `(app, version, service)` pool: the live set, the lease table and the
/// reconcile loop that trues desired instances up against it.
pub(crate) struct Pool {
	pub(crate) key: String,
	app_id: EntityId,
	version_id: EntityId,
	version: AppVersion,
	service: ServiceSpec,
	cfg: ActivatorConfig,
	apps: AppsClient,
	state: Mutex<PoolState>,
	changed: Notify,
	shutdown: CancellationToken,
}

impl Pool {
	pub(crate) fn start(
		key: String,
		version_id: EntityId,
		version: AppVersion,
		service: ServiceSpec,
		apps: AppsClient,
		cfg: ActivatorConfig,
		shutdown: CancellationToken,
	) -> Arc<Pool> {
		let pool = Arc::new(Pool {
			key,
			app_id: version.app.clone(),
			version_id,
			version,
			service,
			cfg,
			apps,
			state: Mutex::new(PoolState::default()),
			changed: Notify::new(),
			shutdown,
		});
		tokio::spawn(pool.clone().run_watcher());
		tokio::spawn(pool.clone().run_reconciler());
		pool
	}

	/// Acquires a lease: a free RUNNING sandbox if one exists, otherwise (in
	/// auto mode) a fresh boot. The boot itself is not tied to the caller:
	/// cancelling this future leaves the sandbox coming up for the next
	/// acquire, watched and reaped through the pool state.
	pub(crate) async fn acquire(&self) -> Result<Lease, ActivatorError> {
		let deadline = Instant::now() + self.cfg.boot_timeout;
		let mut boot_target: Option<EntityId> = None;
		loop {
			let boot_now = {
				let mut state = self.state.lock().await;
				if let Some(id) = state.free_running() {
					let live = state.sandboxes.get_mut(&id).expect("just found");
					live.delegated = true;
					live.lease_deadline =
						Some(Instant::now() + self.cfg.lease_ttl);
					return self.lease_for(&id, live);
				}
				if let Some(id) = &boot_target {
					if state.dead_boots.remove(id) {
						state.sandboxes.remove(id);
						return Err(ActivatorError::SandboxDiedEarly);
					}
				}
				match self.service.concurrency {
					Concurrency::Fixed { .. } => false,
					Concurrency::Auto { .. } => {
						boot_target.is_none()
							&& state.pending_count() == 0
							&& state.live_count()
								< self.cfg.max_pool_size as usize
					}
				}
			};

			if boot_now {
				let id = EntityId::random();
				self.insert_placeholder(&id).await;
				if let Err(err) = self.create_sandbox(&id).await {
					self.state.lock().await.sandboxes.remove(&id);
					return Err(err);
				}
				boot_target = Some(id);
				continue;
			}

			if Instant::now() >= deadline {
				return Err(match self.service.concurrency {
					Concurrency::Fixed { .. } => ActivatorError::NoCapacity,
					Concurrency::Auto { .. } => ActivatorError::DeadlineExceeded,
				});
			}
			tokio::select! {
				_ = self.changed.notified() => {}
				_ = sleep(Duration::from_millis(100)) => {}
				_ = self.shutdown.cancelled() => {
					return Err(ActivatorError::Store(Error::Cancelled));
				}
			}
		}
	}

	pub(crate) async fn renew(&self, lease: &Lease) -> Result<Lease, ActivatorError> {
		let mut state = self.state.lock().await;
		let live = state
			.sandboxes
			.get_mut(&lease.sandbox_id)
			.filter(|l| l.status == SandboxStatus::Running)
			.ok_or_else(|| {
				ActivatorError::Store(Error::NotFound(lease.sandbox_id.clone()))
			})?;
		let deadline = Instant::now() + self.cfg.lease_ttl;
		live.delegated = true;
		live.lease_deadline = Some(deadline);
		Ok(Lease {
			deadline,
			..lease.clone()
		})
	}

	/// Idempotent: releasing a lease twice, or after the sandbox died, is a
	/// no-op.
	pub(crate) async fn release(&self, lease: &Lease) {
		{
			let mut state = self.state.lock().await;
			if let Some(live) = state.sandboxes.get_mut(&lease.sandbox_id) {
				if live.delegated {
					live.delegated = false;
					live.lease_deadline = None;
					live.idle_since = Instant::now();
				}
			}
		}
		self.changed.notify_waiters();
	}

	fn lease_for(&self, id: &EntityId, live: &Live) -> Result<Lease, ActivatorError> {
		let address = live.address.clone().ok_or_else(|| {
			ActivatorError::Store(Error::Invalid(format!(
				"sandbox {id} is RUNNING without a network address"
			)))
		})?;
		let port = live.port.ok_or_else(|| {
			ActivatorError::Store(Error::Invalid(format!(
				"sandbox {id} declares no port for service {}",
				self.service.name
			)))
		})?;
		let url = Url::parse(&format!("http://{address}:{port}/"))
			.map_err(|err| {
				ActivatorError::Store(Error::Invalid(format!(
					"sandbox {id} address: {err}"
				)))
			})?;
		Ok(Lease {
			url,
			size: self.service.lease_size,
			deadline: live.lease_deadline.unwrap_or_else(Instant::now),
			pool_key: self.key.clone(),
			sandbox_id: id.clone(),
		})
	}

	async fn insert_placeholder(&self, id: &EntityId) {
		let now = Instant::now();
		self.state.lock().await.sandboxes.insert(
			id.clone(),
			Live {
				status: SandboxStatus::Pending,
				address: None,
				port: None,
				delegated: false,
				lease_deadline: None,
				idle_since: now,
				since: now,
			},
		);
	}

	async fn create_sandbox(&self, id: &EntityId) -> Result<(), ActivatorError> {
		let sandbox = Sandbox {
			containers: vec![ContainerSpec {
				image: self.version.image_url.clone(),
				env: self.service.env.clone(),
				ports: vec![PortSpec {
					name: self.service.name.clone(),
					port: self.service.port,
				}],
				resources: self.service.resources,
			}],
			networks: Vec::new(),
			status: SandboxStatus::Pending,
			app: self.app_id.clone(),
			version: self.version_id.clone(),
			service: self.service.name.clone(),
			extras: Vec::new(),
		};
		let entity = sandbox.to_entity(id.clone())?;
		info!(pool = %self.key, sandbox = %id, "booting sandbox");
		self.apps.entities().put(&entity).await?;
		Ok(())
	}

	async fn run_watcher(self: Arc<Self>) {
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			match self.apps.watch_pool(&self.key).await {
				Ok(mut watch) => loop {
					tokio::select! {
						_ = self.shutdown.cancelled() => return,
						op = watch.next() => match op {
							Some(Ok(op)) => self.apply_op(op).await,
							Some(Err(err)) => {
								warn!(pool = %self.key, "pool watch failed, resyncing: {err}");
								break;
							}
							None => break,
						},
					}
				},
				Err(err) => {
					warn!(pool = %self.key, "pool watch unavailable: {err}");
				}
			}
			// The watch history is not contiguous across reconnects; start
			// from scratch and let the initial burst resync the live set.
			self.state.lock().await.sandboxes.clear();
			sleep(Duration::from_millis(500)).await;
		}
	}

	async fn apply_op(&self, op: EntityOp) {
		{
			let mut state = self.state.lock().await;
			match op.op {
				OpKind::Delete => {
					state.sandboxes.remove(&op.entity_id);
				}
				OpKind::Create | OpKind::Update => {
					let Some(entity) = &op.entity else { return };
					let sandbox = match Sandbox::from_entity(entity) {
						Ok(sandbox) => sandbox,
						Err(err) => {
							warn!(pool = %self.key, id = %op.entity_id, "undecodable sandbox: {err}");
							return;
						}
					};
					if sandbox.status == SandboxStatus::Dead {
						debug!(pool = %self.key, id = %op.entity_id, "sandbox died");
						state.sandboxes.remove(&op.entity_id);
						state.dead_boots.insert(op.entity_id.clone());
						// Reap the record; DEAD is the only deletable state.
						let apps = self.apps.clone();
						let id = op.entity_id.clone();
						tokio::spawn(async move {
							let _ = apps.delete_sandbox(&id).await;
						});
					} else {
						let now = Instant::now();
						let entry = state
							.sandboxes
							.entry(op.entity_id.clone())
							.or_insert_with(|| Live {
								status: sandbox.status,
								address: None,
								port: None,
								delegated: false,
								lease_deadline: None,
								idle_since: now,
								since: now,
							});
						if entry.status != sandbox.status {
							entry.idle_since = now;
						}
						entry.status = sandbox.status;
						entry.address =
							sandbox.address().map(str::to_owned);
						entry.port = sandbox.service_port();
					}
				}
			}
		}
		self.changed.notify_waiters();
	}

	async fn run_reconciler(self: Arc<Self>) {
		let mut tick = tokio::time::interval(self.cfg.reconcile_interval);
		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => return,
				_ = tick.tick() => {}
			}
			self.reconcile_once().await;
		}
	}

	async fn reconcile_once(&self) {
		let now = Instant::now();
		let mut to_create = 0usize;
		let mut to_stop: Vec<EntityId> = Vec::new();
		let mut to_kill: Vec<EntityId> = Vec::new();
		{
			let mut state = self.state.lock().await;

			// Leases nobody renewed fall back into the pool.
			for live in state.sandboxes.values_mut() {
				if live.delegated
					&& live.lease_deadline.map(|d| d <= now).unwrap_or(true)
				{
					live.delegated = false;
					live.lease_deadline = None;
					live.idle_since = now;
				}
			}

			// Boots that never came up get killed; the watcher reaps the
			// DEAD record afterwards.
			for (id, live) in state.sandboxes.iter() {
				if live.status == SandboxStatus::Pending
					&& now.duration_since(live.since) > self.cfg.boot_timeout
				{
					to_kill.push(id.clone());
				}
			}

			match self.service.concurrency {
				Concurrency::Fixed { num_instances } => {
					let live_count = state.live_count();
					let desired = num_instances as usize;
					if live_count < desired {
						to_create = desired - live_count;
					} else if live_count > desired {
						let mut idle: Vec<(Instant, EntityId)> = state
							.sandboxes
							.iter()
							.filter(|(_, l)| {
								l.status == SandboxStatus::Running
									&& !l.delegated
							})
							.map(|(id, l)| (l.idle_since, id.clone()))
							.collect();
						idle.sort();
						to_stop = idle
							.into_iter()
							.take(live_count - desired)
							.map(|(_, id)| id)
							.collect();
					}
				}
				Concurrency::Auto {
					scale_down_delay_ms, ..
				} => {
					let delay = Duration::from_millis(scale_down_delay_ms);
					let mut idle: Vec<(Instant, EntityId)> = state
						.sandboxes
						.iter()
						.filter(|(_, l)| {
							l.status == SandboxStatus::Running
								&& !l.delegated && now
								.duration_since(l.idle_since)
								>= delay
						})
						.map(|(id, l)| (l.idle_since, id.clone()))
						.collect();
					// Least-recently-used first.
					idle.sort();
					to_stop = idle.into_iter().map(|(_, id)| id).collect();
				}
			}
		}

		for _ in 0..to_create {
			let id = EntityId::random();
			self.insert_placeholder(&id).await;
			if let Err(err) = self.create_sandbox(&id).await {
				warn!(pool = %self.key, "failed to create sandbox: {err}");
				self.state.lock().await.sandboxes.remove(&id);
			}
		}
		for id in to_stop {
			info!(pool = %self.key, sandbox = %id, "scaling down idle sandbox");
			if let Err(err) = self.apps.stop_sandbox(&id).await {
				debug!(pool = %self.key, sandbox = %id, "stop failed: {err}");
			}
		}
		for id in to_kill {
			warn!(pool = %self.key, sandbox = %id, "boot never completed, killing");
			if let Err(err) = self
				.apps
				.set_sandbox_status(&id, SandboxStatus::Dead)
				.await
			{
				debug!(pool = %self.key, sandbox = %id, "kill failed: {err}");
			}
		}
	}
}
