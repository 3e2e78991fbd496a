//! Ingress end-to-end: real sockets, a real store, and a fake sandbox
//! controller that points sandboxes at test backends.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use activator::{Activator, ActivatorConfig};
use axum::routing::get;
use axum::Router;
use entity_client::{AppsClient, EntityClient, IngressClient};
use entity_common::entity::EntityId;
use entity_common::kinds::{
	App, AppVersion, Codec, NetworkSpec, Sandbox, SandboxStatus, ServiceSpec,
};
use entity_server::{connect_in_process, EntityStore};
use http::HeaderMap;
use ingress::{Ingress, IngressConfig, RequestRecord, Telemetry, HEALTH_PATH};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct TestTelemetry {
	records: Mutex<Vec<RequestRecord>>,
}

impl Telemetry for TestTelemetry {
	fn record(&self, record: RequestRecord) {
		self.records.lock().unwrap().push(record);
	}
}

impl TestTelemetry {
	fn snapshot(&self) -> Vec<RequestRecord> {
		self.records.lock().unwrap().clone()
	}
}

/// Ports handed to sandboxes as the controller "boots" them, in order.
type PortQueue = Arc<Mutex<VecDeque<u16>>>;

fn spawn_controller(client: EntityClient, ports: PortQueue, boot_delay: Duration) {
	tokio::spawn(async move {
		let Ok(kind) = client.lookup_kind("sandbox").await else {
			return;
		};
		let Ok(mut watch) = client.watch_index(&kind).await else {
			return;
		};
		while let Some(Ok(op)) = watch.next().await {
			let Some(entity) = &op.entity else { continue };
			let Ok(sandbox) = Sandbox::from_entity(entity) else {
				continue;
			};
			let next = match sandbox.status {
				SandboxStatus::Pending => {
					tokio::time::sleep(boot_delay).await;
					SandboxStatus::Running
				}
				SandboxStatus::Stopped => SandboxStatus::Dead,
				_ => continue,
			};
			let Ok(current) = client.get(&entity.id).await else {
				continue;
			};
			let Ok(mut sandbox) = Sandbox::from_entity(&current) else {
				continue;
			};
			sandbox.status = next;
			if next == SandboxStatus::Running {
				let Some(port) = ports.lock().unwrap().pop_front() else {
					continue;
				};
				sandbox.networks = vec![NetworkSpec {
					address: "127.0.0.1".into(),
				}];
				for container in &mut sandbox.containers {
					for p in &mut container.ports {
						p.port = port;
					}
				}
			}
			let Ok(mut updated) = sandbox.to_entity(current.id.clone()) else {
				continue;
			};
			updated.revision = current.revision;
			let _ = client.put(&updated).await;
		}
	});
}

async fn backend_handler_headers(headers: HeaderMap) -> String {
	headers
		.get("x-forwarded-host")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_owned()
}

/// A live test backend; returns its port.
async fn spawn_backend() -> u16 {
	let app = Router::new()
		.route("/", get(|| async { "hello" }))
		.route("/slow", get(|| async {
			tokio::time::sleep(Duration::from_millis(500)).await;
			"late"
		}))
		.route("/verylong", get(|| async {
			tokio::time::sleep(Duration::from_secs(30)).await;
			"too late"
		}))
		.route("/headers", get(backend_handler_headers));
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		let _ = axum::serve(listener, app).await;
	});
	port
}

/// A port that refuses connections.
async fn dead_port() -> u16 {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);
	port
}

struct Env {
	apps: AppsClient,
	ports: PortQueue,
	base: String,
	telemetry: Arc<TestTelemetry>,
	shutdown: CancellationToken,
	http: reqwest::Client,
}

impl Drop for Env {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

enum RouteKind {
	/// `127.0.0.1 → app`, matching the literal request host.
	Host,
	/// Only a default route with an unrelated host.
	Default,
	/// No routes at all.
	None,
}

async fn start_env(cfg: IngressConfig, route: RouteKind) -> Env {
	start_env_with_boot_delay(cfg, route, Duration::ZERO).await
}

async fn start_env_with_boot_delay(
	cfg: IngressConfig,
	route: RouteKind,
	boot_delay: Duration,
) -> Env {
	let store = EntityStore::new();
	let client = EntityClient::new(connect_in_process(&store));
	let ports: PortQueue = Arc::new(Mutex::new(VecDeque::new()));
	spawn_controller(client.clone(), ports.clone(), boot_delay);

	// One app with one active version and a single web service.
	let app_id = EntityId::from("app-1");
	let version_id = EntityId::from("av-1");
	let mut app = App::named("demo-app");
	app.active_version = Some(version_id.clone());
	client.put(&app.to_entity(app_id.clone()).unwrap()).await.unwrap();

	let mut version = AppVersion::new(app_id.clone(), "registry/demo:v1");
	version.services.push(ServiceSpec::new("web", 8080));
	client
		.put(&version.to_entity(version_id.clone()).unwrap())
		.await
		.unwrap();

	let routes = IngressClient::new(client.clone());
	match route {
		RouteKind::Host => {
			routes.set_route("127.0.0.1", &app_id).await.unwrap();
		}
		RouteKind::Default => {
			let id = routes.set_route("fallback.example", &app_id).await.unwrap();
			routes.ensure_single_default(&id).await.unwrap();
		}
		RouteKind::None => {}
	}

	let apps = AppsClient::new(client.clone());
	let activator = Activator::new(
		apps.clone(),
		ActivatorConfig {
			boot_timeout: Duration::from_secs(5),
			reconcile_interval: Duration::from_millis(50),
			..ActivatorConfig::default()
		},
	);
	let telemetry = Arc::new(TestTelemetry::default());
	let ingress = Ingress::new(
		IngressClient::new(client.clone()),
		apps.clone(),
		activator,
		telemetry.clone(),
		cfg,
	);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let base = format!("http://{}", listener.local_addr().unwrap());
	let shutdown = CancellationToken::new();
	{
		let ingress = ingress.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			let _ = ingress.serve(listener, shutdown).await;
		});
	}

	Env {
		apps,
		ports,
		base,
		telemetry,
		shutdown,
		http: reqwest::Client::builder().no_proxy().build().unwrap(),
	}
}

#[tokio::test]
async fn proxies_to_a_lazily_booted_sandbox() {
	let env = start_env(IngressConfig::default(), RouteKind::Host).await;
	env.ports.lock().unwrap().push_back(spawn_backend().await);

	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "hello");

	// Exactly one sandbox got booted for it.
	let pool = env.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);

	// And telemetry saw the request.
	let records = env.telemetry.snapshot();
	let record = records.iter().find(|r| r.path == "/").unwrap();
	assert_eq!(record.app, "demo-app");
	assert_eq!(record.method, "GET");
	assert_eq!(record.status, 200);
	assert_eq!(record.bytes, 5);
}

#[tokio::test]
async fn forwarded_host_header_is_set() {
	let env = start_env(IngressConfig::default(), RouteKind::Host).await;
	env.ports.lock().unwrap().push_back(spawn_backend().await);

	let resp = env
		.http
		.get(format!("{}/headers", env.base))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.text().await.unwrap(), "127.0.0.1");
}

#[tokio::test]
async fn unrouted_host_is_404() {
	let env = start_env(IngressConfig::default(), RouteKind::None).await;
	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn default_route_catches_unmatched_hosts() {
	let env = start_env(IngressConfig::default(), RouteKind::Default).await;
	env.ports.lock().unwrap().push_back(spawn_backend().await);

	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn health_is_served_directly() {
	let env = start_env(IngressConfig::default(), RouteKind::None).await;
	let resp = env
		.http
		.get(format!("{}{}", env.base, HEALTH_PATH))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let health: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(health["status"], "ok");
	assert_eq!(health["checks"]["entity_store"]["status"], "ok");
}

#[tokio::test]
async fn slow_backends_hit_the_request_timeout() {
	let cfg = IngressConfig {
		request_timeout: Duration::from_millis(400),
		..IngressConfig::default()
	};
	let env = start_env(cfg, RouteKind::Host).await;
	env.ports.lock().unwrap().push_back(spawn_backend().await);

	// Warm up so the timeout measures the backend, not the boot.
	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 200);

	let resp = env
		.http
		.get(format!("{}/verylong", env.base))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 503);
	assert_eq!(resp.text().await.unwrap(), "Request timeout");

	// The 503 is what telemetry records, not whatever the backend was going
	// to say.
	let records = env.telemetry.snapshot();
	let record = records.iter().find(|r| r.path == "/verylong").unwrap();
	assert_eq!(record.status, 503);
}

#[tokio::test]
async fn boot_slower_than_the_request_timeout_still_completes() {
	let cfg = IngressConfig {
		request_timeout: Duration::from_millis(300),
		..IngressConfig::default()
	};
	let env =
		start_env_with_boot_delay(cfg, RouteKind::Host, Duration::from_secs(1)).await;
	env.ports.lock().unwrap().push_back(spawn_backend().await);

	// The first request times out while the sandbox is still booting.
	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 503);
	assert_eq!(resp.text().await.unwrap(), "Request timeout");

	// The boot was not cancelled with the request; once it lands, traffic
	// reuses the now-running sandbox instead of booting another.
	let mut served = None;
	for _ in 0..50 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
		if resp.status() == 200 {
			served = Some(resp.text().await.unwrap());
			break;
		}
	}
	assert_eq!(served.as_deref(), Some("hello"));

	let pool = env.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn dead_backend_invalidates_the_lease_and_recovers() {
	let env = start_env(IngressConfig::default(), RouteKind::Host).await;
	env.ports.lock().unwrap().push_back(dead_port().await);

	// First request reaches a sandbox whose backend refuses connections.
	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 502);

	let pool = env.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);
	let (first_id, _) = pool.into_iter().next().unwrap();

	// The controller notices the crash; a live backend takes the next boot.
	env.apps
		.set_sandbox_status(&first_id, SandboxStatus::Dead)
		.await
		.unwrap();
	env.ports.lock().unwrap().push_back(spawn_backend().await);

	let mut recovered = None;
	for _ in 0..50 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
		if resp.status() == 200 {
			recovered = Some(resp.text().await.unwrap());
			break;
		}
	}
	assert_eq!(recovered.as_deref(), Some("hello"));

	let pool = env.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);
	assert_ne!(pool[0].0, first_id);
}

#[tokio::test]
async fn concurrent_requests_share_one_lease() {
	let env = start_env(IngressConfig::default(), RouteKind::Host).await;
	let port = spawn_backend().await;
	env.ports.lock().unwrap().push_back(port);

	// Warm up: boot the sandbox and cache its lease.
	let resp = env.http.get(format!("{}/", env.base)).send().await.unwrap();
	assert_eq!(resp.status(), 200);

	// Ten concurrent requests fit the lease size of 10: all served by the
	// single sandbox.
	let mut handles = Vec::new();
	for _ in 0..10 {
		let http = env.http.clone();
		let url = format!("{}/slow", env.base);
		handles.push(tokio::spawn(async move {
			http.get(url).send().await.unwrap().status()
		}));
	}
	for handle in handles {
		assert_eq!(handle.await.unwrap(), 200);
	}
	let pool = env.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);

	// Saturating the lease makes the next request trigger a second boot.
	env.ports.lock().unwrap().push_back(port);
	let mut held = Vec::new();
	for _ in 0..10 {
		let http = env.http.clone();
		let url = format!("{}/slow", env.base);
		held.push(tokio::spawn(async move {
			http.get(url).send().await.unwrap().status()
		}));
	}
	// Let the ten take their slots before the eleventh arrives.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let eleventh = env
		.http
		.get(format!("{}/", env.base))
		.send()
		.await
		.unwrap();
	assert_eq!(eleventh.status(), 200);
	for handle in held {
		assert_eq!(handle.await.unwrap(), 200);
	}

	let pool = env.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 2);
}
