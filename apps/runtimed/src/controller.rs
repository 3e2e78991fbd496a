//! The built-in development sandbox controller.
//!
//! Production clusters run real controllers (microVM / containerd) against
//! the same sandbox entities. This one exists so a bare `runtimed` serves
//! traffic: it "boots" each PENDING sandbox by binding a placeholder HTTP
//! server on a local port, reports RUNNING with that address, and winds
//! STOPPED sandboxes down to DEAD.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use entity_client::EntityClient;
use entity_common::entity::{EntityId, OpKind};
use entity_common::kinds::{Codec, NetworkSpec, Sandbox, SandboxStatus};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct StubServer {
	stop: CancellationToken,
}

pub struct DevController {
	client: EntityClient,
	servers: Mutex<HashMap<EntityId, StubServer>>,
	shutdown: CancellationToken,
}

impl DevController {
	pub fn spawn(client: EntityClient, shutdown: CancellationToken) {
		let controller = Arc::new(DevController {
			client,
			servers: Mutex::new(HashMap::new()),
			shutdown,
		});
		tokio::spawn(controller.run());
	}

	async fn run(self: Arc<Self>) {
		loop {
			if self.shutdown.is_cancelled() {
				return;
			}
			let watch = async {
				let kind = self.client.lookup_kind("sandbox").await?;
				self.client.watch_index(&kind).await
			};
			match watch.await {
				Ok(mut watch) => loop {
					tokio::select! {
						_ = self.shutdown.cancelled() => return,
						op = watch.next() => match op {
							Some(Ok(op)) => self.apply(op).await,
							Some(Err(err)) => {
								warn!("sandbox watch failed, resyncing: {err}");
								break;
							}
							None => break,
						},
					}
				},
				Err(err) => warn!("sandbox watch unavailable: {err}"),
			}
			tokio::time::sleep(Duration::from_millis(500)).await;
		}
	}

	async fn apply(&self, op: entity_common::entity::EntityOp) {
		if op.op == OpKind::Delete {
			self.stop_stub(&op.entity_id).await;
			return;
		}
		let Some(entity) = &op.entity else { return };
		let sandbox = match Sandbox::from_entity(entity) {
			Ok(sandbox) => sandbox,
			Err(err) => {
				warn!(id = %op.entity_id, "undecodable sandbox: {err}");
				return;
			}
		};
		match sandbox.status {
			SandboxStatus::Pending => {
				if let Err(err) = self.boot(&op.entity_id).await {
					warn!(id = %op.entity_id, "dev boot failed: {err}");
					let _ = self.transition(&op.entity_id, SandboxStatus::Dead).await;
				}
			}
			SandboxStatus::Stopped => {
				self.stop_stub(&op.entity_id).await;
				if let Err(err) =
					self.transition(&op.entity_id, SandboxStatus::Dead).await
				{
					debug!(id = %op.entity_id, "teardown write failed: {err}");
				}
			}
			SandboxStatus::Dead => self.stop_stub(&op.entity_id).await,
			SandboxStatus::Running => {}
		}
	}

	/// Binds the placeholder app and reports the sandbox RUNNING at its
	/// address.
	async fn boot(&self, id: &EntityId) -> entity_common::Result<()> {
		{
			let servers = self.servers.lock().await;
			if servers.contains_key(id) {
				return Ok(());
			}
		}

		let current = self.client.get(id).await?;
		let sandbox = Sandbox::from_entity(&current)?;
		let body = format!(
			"miren dev sandbox for {}/{} ({})\n",
			sandbox.app, sandbox.service, id
		);
		let app = Router::new().fallback(move || {
			let body = body.clone();
			async move { body }
		});

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
			.await
			.map_err(|err| entity_common::Error::Invalid(err.to_string()))?;
		let port = listener
			.local_addr()
			.map_err(|err| entity_common::Error::Invalid(err.to_string()))?
			.port();
		let stop = CancellationToken::new();
		{
			let stop = stop.clone();
			tokio::spawn(async move {
				let _ = axum::serve(listener, app)
					.with_graceful_shutdown(stop.cancelled_owned())
					.await;
			});
		}
		self.servers
			.lock()
			.await
			.insert(id.clone(), StubServer { stop });
		info!(sandbox = %id, port, "dev sandbox up");

		let mut sandbox = sandbox;
		sandbox.status = SandboxStatus::Running;
		sandbox.networks = vec![NetworkSpec {
			address: "127.0.0.1".into(),
		}];
		for container in &mut sandbox.containers {
			for p in &mut container.ports {
				p.port = port;
			}
		}
		let mut updated = sandbox.to_entity(id.clone())?;
		updated.revision = current.revision;
		self.client.put(&updated).await?;
		Ok(())
	}

	async fn stop_stub(&self, id: &EntityId) {
		if let Some(server) = self.servers.lock().await.remove(id) {
			info!(sandbox = %id, "dev sandbox down");
			server.stop.cancel();
		}
	}

	async fn transition(
		&self,
		id: &EntityId,
		status: SandboxStatus,
	) -> entity_common::Result<()> {
		let current = self.client.get(id).await?;
		let mut sandbox = Sandbox::from_entity(&current)?;
		sandbox.status = status;
		let mut updated = sandbox.to_entity(id.clone())?;
		updated.revision = current.revision;
		self.client.put(&updated).await?;
		Ok(())
	}
}
