use entity_common::attr::{self, Attr};
use entity_common::entity::EntityId;
use entity_common::kinds::{App, AppVersion, Codec, Sandbox, SandboxStatus};
use entity_common::{Error, Result};

use crate::{EntityClient, Watch};

/// App, version and sandbox operations for the activator and the daemon.
#[derive(Clone)]
pub struct AppsClient {
	client: EntityClient,
}

impl AppsClient {
	pub fn new(client: EntityClient) -> Self {
		Self { client }
	}

	pub fn entities(&self) -> &EntityClient {
		&self.client
	}

	pub async fn app_by_name(&self, name: &str) -> Result<(EntityId, App)> {
		self.client
			.one_at_index(&Attr::str(attr::METADATA_NAME, name))
			.await
	}

	pub async fn app(&self, id: &EntityId) -> Result<App> {
		self.client.get_as(id).await
	}

	/// Follows `app.active_version`. An app without one is unreachable,
	/// which callers surface as not-found.
	pub async fn active_version(
		&self,
		app_id: &EntityId,
	) -> Result<(EntityId, AppVersion)> {
		let app: App = self.client.get_as(app_id).await?;
		let version_id = app
			.active_version
			.ok_or_else(|| Error::NotFound(app_id.clone()))?;
		let version = self.client.get_as(&version_id).await?;
		Ok((version_id, version))
	}

	pub async fn sandbox(&self, id: &EntityId) -> Result<Sandbox> {
		self.client.get_as(id).await
	}

	/// Sandboxes currently in one `(app, version, service)` pool.
	pub async fn sandboxes_in_pool(
		&self,
		pool_key: &str,
	) -> Result<Vec<(EntityId, Sandbox)>> {
		let entities = self
			.client
			.list_raw(&Attr::str(attr::SANDBOX_POOL, pool_key))
			.await?;
		let mut out = Vec::with_capacity(entities.len());
		for entity in &entities {
			out.push((entity.id.clone(), Sandbox::from_entity(entity)?));
		}
		Ok(out)
	}

	pub async fn watch_pool(&self, pool_key: &str) -> Result<Watch> {
		self.client
			.watch_index(&Attr::str(attr::SANDBOX_POOL, pool_key))
			.await
	}

	pub async fn watch_sandbox(&self, id: &EntityId) -> Result<Watch> {
		self.client.watch_entity(id).await
	}

	/// Writes the sandbox back with a new status, preserving the revision so
	/// concurrent writers conflict instead of clobbering.
	pub async fn set_sandbox_status(
		&self,
		id: &EntityId,
		status: SandboxStatus,
	) -> Result<()> {
		let current = self.client.get(id).await?;
		let mut sandbox = Sandbox::from_entity(&current)?;
		if sandbox.status == status {
			return Ok(());
		}
		sandbox.status = status;
		let mut entity = sandbox.to_entity(id.clone())?;
		entity.revision = current.revision;
		self.client.put(&entity).await?;
		Ok(())
	}

	/// Asks the controller to wind the sandbox down.
	pub async fn stop_sandbox(&self, id: &EntityId) -> Result<()> {
		self.set_sandbox_status(id, SandboxStatus::Stopped).await
	}

	/// Removes a sandbox record. Rejected with a precondition error unless
	/// the sandbox is DEAD.
	pub async fn delete_sandbox(&self, id: &EntityId) -> Result<()> {
		self.client.delete(id).await?;
		Ok(())
	}
}
