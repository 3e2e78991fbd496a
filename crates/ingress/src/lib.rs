//! The HTTP ingress: resolves `host → route → app → active version`, borrows
//! a lease on a running sandbox (asking the activator to boot one when the
//! cache is dry) and reverse-proxies the request to it.
//!
//! Request outcomes feed back into the lease table: connection-level
//! failures classify the backend as dead and invalidate the lease; everything
//! else just returns the borrowed use. A single expiry task renews busy
//! leases and hands idle ones back every 30 seconds.

mod health;
mod leases;
mod proxy;
mod telemetry;

pub use self::health::{Check, Health, HEALTH_PATH};
pub use self::leases::{LeaseCache, LeaseUse};
pub use self::telemetry::{LogTelemetry, RequestRecord, Telemetry};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use activator::{Activator, ActivatorError};
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use entity_client::{AppsClient, IngressClient};
use http::header::{CONNECTION, HOST};
use http::{Request, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct IngressConfig {
	/// Deadline wrapped around non-upgrade requests. Upgrades bypass it:
	/// the wrapper would hide the response writer's hijack capability.
	pub request_timeout: Duration,
	/// Cadence of the lease renew/release loop.
	pub lease_expiry_interval: Duration,
	/// Value written into `X-Forwarded-Proto`.
	pub forwarded_proto: String,
}

impl Default for IngressConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(60),
			lease_expiry_interval: Duration::from_secs(30),
			forwarded_proto: "http".into(),
		}
	}
}

struct Inner {
	routes: IngressClient,
	apps: AppsClient,
	activator: Activator,
	cache: LeaseCache,
	http: reqwest::Client,
	telemetry: Arc<dyn Telemetry>,
	cfg: IngressConfig,
}

/// The ingress service. Cheap to clone; shares the lease cache.
#[derive(Clone)]
pub struct Ingress {
	inner: Arc<Inner>,
}

impl Ingress {
	pub fn new(
		routes: IngressClient,
		apps: AppsClient,
		activator: Activator,
		telemetry: Arc<dyn Telemetry>,
		cfg: IngressConfig,
	) -> Self {
		// Sandbox addresses are cluster-internal; never send them through an
		// environment proxy.
		let http = reqwest::Client::builder()
			.connect_timeout(Duration::from_secs(5))
			.no_proxy()
			.build()
			.expect("reqwest client construction cannot fail");
		Self {
			inner: Arc::new(Inner {
				routes,
				apps,
				activator,
				cache: LeaseCache::new(),
				http,
				telemetry,
				cfg,
			}),
		}
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route(HEALTH_PATH, get(health))
			.fallback(forward)
			.layer(TraceLayer::new_for_http())
			.with_state(self.clone())
	}

	/// Serves until `shutdown` fires, then stops accepting, releases every
	/// cached lease and lets in-flight proxies drain.
	pub async fn serve(
		&self,
		listener: TcpListener,
		shutdown: CancellationToken,
	) -> std::io::Result<()> {
		self.spawn_expiry(shutdown.clone());
		let result = axum::serve(listener, self.router())
			.with_graceful_shutdown(shutdown.clone().cancelled_owned())
			.await;
		self.release_all().await;
		result
	}

	pub fn spawn_expiry(&self, shutdown: CancellationToken) {
		let cache = self.inner.cache.clone();
		let activator = self.inner.activator.clone();
		let interval = self.inner.cfg.lease_expiry_interval;
		tokio::spawn(async move {
			cache.run_expiry(activator, interval, shutdown).await;
		});
	}

	async fn release_all(&self) {
		for lease in self.inner.cache.drain() {
			self.inner.activator.release_lease(&lease).await;
		}
	}

	async fn handle(&self, req: Request<Body>) -> Response {
		let started = tokio::time::Instant::now();
		let method = req.method().to_string();
		let path = req.uri().path().to_owned();
		let host = request_host(&req);

		if wants_upgrade(&req) {
			// No deadline around upgrades; the stream lives as long as the
			// tunnel does.
			return self.proxy(req, host, method, path, started).await;
		}

		let deadline = self.inner.cfg.request_timeout;
		match tokio::time::timeout(
			deadline,
			self.proxy(req, host, method.clone(), path.clone(), started),
		)
		.await
		{
			Ok(response) => response,
			Err(_) => {
				// The handler future is gone; record the status the client
				// actually sees.
				let mut record = RequestRecord::new(String::new(), method, path);
				record.status = StatusCode::SERVICE_UNAVAILABLE.as_u16();
				record.duration = started.elapsed();
				self.inner.telemetry.record(record);
				plain(StatusCode::SERVICE_UNAVAILABLE, "Request timeout")
			}
		}
	}

	async fn proxy(
		&self,
		req: Request<Body>,
		host: Option<String>,
		method: String,
		path: String,
		started: tokio::time::Instant,
	) -> Response {
		let mut record = RequestRecord::new(String::new(), method, path);

		let Some(host) = host else {
			return self.finish(record, started, StatusCode::BAD_REQUEST, "missing host");
		};

		// Route by host, falling back to the default route.
		let entry = match self.inner.routes.lookup(&host).await {
			Ok(Some(entry)) => Some(entry),
			Ok(None) => match self.inner.routes.default_route().await {
				Ok(entry) => entry,
				Err(err) => {
					warn!("default route lookup failed: {err}");
					return self.finish(
						record,
						started,
						StatusCode::INTERNAL_SERVER_ERROR,
						"route lookup failed",
					);
				}
			},
			Err(err) => {
				warn!("route lookup failed: {err}");
				return self.finish(
					record,
					started,
					StatusCode::INTERNAL_SERVER_ERROR,
					"route lookup failed",
				);
			}
		};
		let Some(entry) = entry else {
			return self.finish(record, started, StatusCode::NOT_FOUND, "no route for host");
		};

		let app_id = entry.route.app.clone();
		let app = match self.inner.apps.app(&app_id).await {
			Ok(app) => app,
			Err(err) if err.is_not_found() => {
				return self.finish(record, started, StatusCode::NOT_FOUND, "app not found")
			}
			Err(err) => {
				warn!(%app_id, "app fetch failed: {err}");
				return self.finish(
					record,
					started,
					StatusCode::INTERNAL_SERVER_ERROR,
					"app fetch failed",
				);
			}
		};
		record.app = app.name.clone();

		let (version_id, version) = match self.inner.apps.active_version(&app_id).await
		{
			Ok(found) => found,
			Err(err) if err.is_not_found() => {
				return self.finish(
					record,
					started,
					StatusCode::NOT_FOUND,
					"app has no active version",
				)
			}
			Err(err) => {
				warn!(%app_id, "active version fetch failed: {err}");
				return self.finish(
					record,
					started,
					StatusCode::INTERNAL_SERVER_ERROR,
					"version fetch failed",
				);
			}
		};
		// HTTP traffic lands on the version's first declared service.
		let Some(service) = version.services.first().map(|s| s.name.clone()) else {
			return self.finish(
				record,
				started,
				StatusCode::NOT_FOUND,
				"version declares no services",
			);
		};

		// Lease: cached capacity first, then the activator.
		let lease_use = match self.inner.cache.use_lease(&app_id) {
			Some(found) => found,
			None => {
				match self
					.inner
					.activator
					.acquire_lease(&version_id, &version, &service)
					.await
				{
					Ok(lease) => self.inner.cache.retain(&app_id, lease),
					Err(ActivatorError::SandboxDiedEarly) => {
						return self.finish(
							record,
							started,
							StatusCode::REQUEST_TIMEOUT,
							"the application exited while starting; check its logs and retry",
						)
					}
					Err(
						err @ (ActivatorError::NoCapacity
						| ActivatorError::DeadlineExceeded),
					) => {
						debug!(app = %record.app, "no lease capacity: {err}");
						return self.finish(
							record,
							started,
							StatusCode::SERVICE_UNAVAILABLE,
							"no capacity, retry shortly",
						);
					}
					Err(err) => {
						warn!(app = %record.app, "lease acquisition failed: {err}");
						return self.finish(
							record,
							started,
							StatusCode::INTERNAL_SERVER_ERROR,
							"lease acquisition failed",
						);
					}
				}
			}
		};

		let outbound = proxy::outbound(
			&self.inner.http,
			&lease_use.lease.url,
			req,
			&host,
			&self.inner.cfg.forwarded_proto,
		);
		match outbound.send().await {
			Ok(resp) => proxy::into_response(
				resp,
				record,
				self.inner.telemetry.clone(),
				started,
				lease_use,
			),
			Err(err) if proxy::is_dead_backend(&err) => {
				debug!(sandbox = %lease_use.lease.sandbox_id, "dead backend: {err}");
				if let Some(lease) = lease_use.invalidate() {
					self.inner.activator.release_lease(&lease).await;
				}
				self.finish(
					record,
					started,
					StatusCode::BAD_GATEWAY,
					"backend unreachable",
				)
			}
			Err(err) => {
				warn!(app = %record.app, "proxy failed: {err}");
				self.finish(
					record,
					started,
					StatusCode::INTERNAL_SERVER_ERROR,
					"proxy failed",
				)
			}
		}
	}

	fn finish(
		&self,
		mut record: RequestRecord,
		started: tokio::time::Instant,
		status: StatusCode,
		body: &'static str,
	) -> Response {
		record.status = status.as_u16();
		record.bytes = body.len() as u64;
		record.duration = started.elapsed();
		self.inner.telemetry.record(record);
		plain(status, body)
	}
}

fn plain(status: StatusCode, body: &'static str) -> Response {
	(status, body).into_response()
}

async fn forward(State(ingress): State<Ingress>, req: Request<Body>) -> Response {
	ingress.handle(req).await
}

async fn health(State(ingress): State<Ingress>) -> Response {
	let mut checks = BTreeMap::new();

	let store = match tokio::time::timeout(
		Duration::from_secs(2),
		ingress.inner.routes.entities().lookup_kind("app"),
	)
	.await
	{
		Ok(Ok(_)) => Check::ok(),
		Ok(Err(err)) => Check::failed(err),
		Err(_) => Check::failed("timed out"),
	};
	checks.insert("entity_store", store);
	checks.insert("activator", Check::ok());

	let healthy = checks.values().all(Check::is_ok);
	let health = Health {
		status: if healthy { "ok" } else { "degraded" },
		checks,
	};
	let status = if healthy {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(status, Json(health)).into_response()
}

/// Host the request was addressed to: `Host` header first, then the URI
/// authority; `:port` stripped; lowercased.
fn request_host(req: &Request<Body>) -> Option<String> {
	let raw = req
		.headers()
		.get(HOST)
		.and_then(|v| v.to_str().ok())
		.map(str::to_owned)
		.or_else(|| req.uri().host().map(str::to_owned))?;
	Some(strip_port(&raw).to_lowercase())
}

fn strip_port(host: &str) -> &str {
	if let Some(rest) = host.strip_prefix('[') {
		// Bracketed IPv6, e.g. `[::1]:8080`.
		if let Some(end) = rest.find(']') {
			return &rest[..end];
		}
	}
	match host.rfind(':') {
		Some(i) if host[i + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..i],
		_ => host,
	}
}

fn wants_upgrade(req: &Request<Body>) -> bool {
	req.headers()
		.get_all(CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn strip_port_handles_the_usual_shapes() {
		assert_eq!(strip_port("example.com"), "example.com");
		assert_eq!(strip_port("example.com:8080"), "example.com");
		assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
		assert_eq!(strip_port("[::1]:8080"), "::1");
		assert_eq!(strip_port("weird:host"), "weird:host");
	}

	#[test]
	fn upgrade_detection_is_token_based() {
		let req = Request::builder()
			.header(CONNECTION, "keep-alive, Upgrade")
			.body(Body::empty())
			.unwrap();
		assert!(wants_upgrade(&req));

		let req = Request::builder()
			.header(CONNECTION, "keep-alive")
			.body(Body::empty())
			.unwrap();
		assert!(!wants_upgrade(&req));
	}
}
