use entity_common::attr::{self, Attr};
use entity_common::entity::EntityId;
use entity_common::kinds::{Codec, HttpRoute};
use entity_common::Result;
use tracing::debug;

use crate::EntityClient;

/// A decoded route plus its entity identity.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
	pub id: EntityId,
	pub route: HttpRoute,
}

/// Route operations for the HTTP ingress.
#[derive(Clone)]
pub struct IngressClient {
	client: EntityClient,
}

impl IngressClient {
	pub fn new(client: EntityClient) -> Self {
		Self { client }
	}

	pub fn entities(&self) -> &EntityClient {
		&self.client
	}

	/// Resolves a hostname to its route. Host matching is case-insensitive;
	/// a miss is `Ok(None)`, never an error.
	pub async fn lookup(&self, host: &str) -> Result<Option<RouteEntry>> {
		let attr = Attr::str(attr::ROUTE_HOST, host.to_lowercase());
		match self.client.one_at_index::<HttpRoute>(&attr).await {
			Ok((id, route)) => Ok(Some(RouteEntry { id, route })),
			Err(err) if err.is_not_found() => Ok(None),
			Err(err) => Err(err),
		}
	}

	/// The route marked `default=true`, if any. With several markers the
	/// smallest id wins until [`ensure_single_default`] converges them.
	///
	/// [`ensure_single_default`]: IngressClient::ensure_single_default
	pub async fn default_route(&self) -> Result<Option<RouteEntry>> {
		let attr = Attr::bool(attr::ROUTE_DEFAULT, true);
		match self.client.one_at_index::<HttpRoute>(&attr).await {
			Ok((id, route)) => Ok(Some(RouteEntry { id, route })),
			Err(err) if err.is_not_found() => Ok(None),
			Err(err) => Err(err),
		}
	}

	/// Creates or repoints the route for `host`.
	pub async fn set_route(&self, host: &str, app: &EntityId) -> Result<EntityId> {
		match self.lookup(host).await? {
			Some(entry) => {
				let mut route = entry.route;
				route.app = app.clone();
				self.client.create_or_update(&entry.id, &route).await?;
				Ok(entry.id)
			}
			None => {
				let route = HttpRoute::new(host, app.clone());
				let entity = route.to_entity(EntityId::random())?;
				let ack = self.client.put(&entity).await?;
				Ok(ack.id)
			}
		}
	}

	/// Converges on exactly one default route.
	///
	/// Concurrent producers may briefly leave several routes marked
	/// `default=true`; this deletes every marker except `keep` and makes
	/// sure `keep` itself carries the flag.
	pub async fn ensure_single_default(&self, keep: &EntityId) -> Result<()> {
		let marked = self
			.client
			.list_raw(&Attr::bool(attr::ROUTE_DEFAULT, true))
			.await?;
		for entity in marked {
			if entity.id == *keep {
				continue;
			}
			debug!(id = %entity.id, "deleting extra default route");
			match self.client.delete(&entity.id).await {
				Ok(_) => {}
				// Someone else already converged it.
				Err(err) if err.is_not_found() => {}
				Err(err) => return Err(err),
			}
		}

		let current = self.client.get(keep).await?;
		let mut route = HttpRoute::from_entity(&current)?;
		if !route.default {
			route.default = true;
			let mut entity = route.to_entity(keep.clone())?;
			entity.revision = current.revision;
			self.client.put(&entity).await?;
		}
		Ok(())
	}

	/// Deletes the route for `host` if it exists.
	pub async fn remove_route(&self, host: &str) -> Result<()> {
		if let Some(entry) = self.lookup(host).await? {
			match self.client.delete(&entry.id).await {
				Ok(_) => {}
				Err(err) if err.is_not_found() => {}
				Err(err) => return Err(err),
			}
		}
		Ok(())
	}
}
