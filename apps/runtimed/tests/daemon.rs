//! Whole-daemon tests: manifests in, proxied traffic out.

use clap::Parser;
use entity_client::IngressClient;
use runtimed::Args;

fn test_args() -> Args {
	Args::parse_from([
		"runtimed",
		"--bind",
		"127.0.0.1",
		"--port",
		"0",
		"--store-port",
		"0",
	])
}

const MANIFESTS: &str = "\
kind: app
metadata:
  id: app-1
  name: demo
spec:
  active_version: av-1
---
kind: app_version
metadata:
  id: av-1
spec:
  app: app-1
  image_url: registry/demo:v1
  services:
    - name: web
      port: 8080
---
kind: http_route
metadata:
  id: r-1
spec:
  host: 127.0.0.1
  app: app-1
";

#[tokio::test]
async fn applied_manifests_serve_traffic_end_to_end() {
	let dir = std::env::temp_dir().join(format!("miren-test-{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	let manifest = dir.join("demo.yaml");
	std::fs::write(&manifest, MANIFESTS).unwrap();

	let mut args = test_args();
	args.apply = vec![manifest];
	let runtime = runtimed::start(args).await.unwrap();

	// The route resolves through the store the daemon serves.
	let routes = IngressClient::new(runtime.client().clone());
	let entry = routes.lookup("127.0.0.1").await.unwrap().unwrap();
	assert_eq!(entry.route.app, entity_common::EntityId::from("app-1"));

	// First request lazily boots a dev sandbox and proxies to it.
	let http = reqwest::Client::builder().no_proxy().build().unwrap();
	let body = http
		.get(format!("http://{}/", runtime.ingress_addr))
		.send()
		.await
		.unwrap()
		.text()
		.await
		.unwrap();
	assert!(body.contains("miren dev sandbox"), "got: {body}");

	// Health never proxies.
	let health: serde_json::Value = http
		.get(format!(
			"http://{}{}",
			runtime.ingress_addr,
			ingress::HEALTH_PATH
		))
		.send()
		.await
		.unwrap()
		.json()
		.await
		.unwrap();
	assert_eq!(health["status"], "ok");

	runtime.stop().await;
}

#[tokio::test]
async fn store_rpc_listener_accepts_external_clients() {
	let runtime = runtimed::start(test_args()).await.unwrap();

	// Connect the way external tooling would: over TCP.
	let socket = tokio::net::TcpStream::connect(runtime.store_addr)
		.await
		.unwrap();
	let conn = caprpc::Connection::spawn(
		caprpc::cbor_framed(socket),
		Default::default(),
	);
	let client = entity_client::EntityClient::new(conn);
	let attr = client.lookup_kind("app").await.unwrap();
	let cursor = client
		.list::<entity_common::kinds::App>(&attr)
		.await
		.unwrap();
	assert!(cursor.is_empty());

	runtime.stop().await;
}
