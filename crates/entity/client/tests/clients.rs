//! Typed-client behavior against a real in-process store.

use entity_client::{AppsClient, EntityClient, IngressClient};
use entity_common::attr::{self, Attr};
use entity_common::entity::{EntityId, OpKind};
use entity_common::kinds::{App, Codec, HttpRoute, SandboxStatus};
use entity_server::{connect_in_process, EntityStore};

fn clients() -> (EntityStore, EntityClient) {
	let store = EntityStore::new();
	let client = EntityClient::new(connect_in_process(&store));
	(store, client)
}

#[tokio::test]
async fn route_lookup_is_case_insensitive() {
	let (_store, client) = clients();
	let ingress = IngressClient::new(client);

	ingress
		.set_route("Example.Com", &EntityId::from("test-app-123"))
		.await
		.unwrap();

	let entry = ingress.lookup("EXAMPLE.COM").await.unwrap().unwrap();
	assert_eq!(entry.route.app, EntityId::from("test-app-123"));

	// A miss is a clean None, not an error.
	assert!(ingress.lookup("does-not-exist.com").await.unwrap().is_none());
}

#[tokio::test]
async fn set_route_repoints_existing_hosts() {
	let (_store, client) = clients();
	let ingress = IngressClient::new(client);

	let first = ingress
		.set_route("a.com", &EntityId::from("app-1"))
		.await
		.unwrap();
	let second = ingress
		.set_route("A.COM", &EntityId::from("app-2"))
		.await
		.unwrap();
	assert_eq!(first, second);

	let entry = ingress.lookup("a.com").await.unwrap().unwrap();
	assert_eq!(entry.route.app, EntityId::from("app-2"));
}

#[tokio::test]
async fn ensure_single_default_converges() {
	let (_store, client) = clients();
	let ingress = IngressClient::new(client.clone());

	let mut ids = Vec::new();
	for (i, host) in ["a.com", "b.com", "c.com"].iter().enumerate() {
		let mut route =
			HttpRoute::new(*host, EntityId::from(format!("app-{i}").as_str()));
		route.default = true;
		let entity = route
			.to_entity(EntityId::from(format!("r-{i}").as_str()))
			.unwrap();
		ids.push(client.put(&entity).await.unwrap().id);
	}
	let keep = ids[1].clone();

	ingress.ensure_single_default(&keep).await.unwrap();

	let defaults = client
		.list_raw(&Attr::bool(attr::ROUTE_DEFAULT, true))
		.await
		.unwrap();
	assert_eq!(defaults.len(), 1);
	assert_eq!(defaults[0].id, keep);

	// The two losers are gone entirely.
	assert!(client.get(&ids[0]).await.unwrap_err().is_not_found());
	assert!(client.get(&ids[2]).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn one_at_index_prefers_smallest_id() {
	let (_store, client) = clients();
	for id in ["app-b", "app-a", "app-c"] {
		let app = App::named("shared-name");
		client
			.put(&app.to_entity(EntityId::from(id)).unwrap())
			.await
			.unwrap();
	}
	let (id, _app): (EntityId, App) = client
		.one_at_index(&Attr::str(attr::METADATA_NAME, "shared-name"))
		.await
		.unwrap();
	assert_eq!(id, EntityId::from("app-a"));
}

#[tokio::test]
async fn one_at_index_miss_is_not_found() {
	let (_store, client) = clients();
	let err = client
		.one_at_index::<App>(&Attr::str(attr::METADATA_NAME, "ghost"))
		.await
		.unwrap_err();
	assert!(err.is_not_found());
}

#[tokio::test]
async fn create_or_update_preserves_revision() {
	let (_store, client) = clients();
	let id = EntityId::from("app-1");

	let mut app = App::named("demo");
	let first = client.create_or_update(&id, &app).await.unwrap();
	assert_eq!(first.revision, 1);

	app.active_version = Some(EntityId::from("av-1"));
	let second = client.create_or_update(&id, &app).await.unwrap();
	assert_eq!(second.revision, 2);

	let got: App = client.get_as(&id).await.unwrap();
	assert_eq!(got.active_version, Some(EntityId::from("av-1")));
}

#[tokio::test]
async fn list_cursor_reads_decoded_entities() {
	let (_store, client) = clients();
	for host in ["a.com", "b.com"] {
		let route = HttpRoute::new(host, EntityId::from("app-1"));
		client
			.put(&route.to_entity(EntityId::random()).unwrap())
			.await
			.unwrap();
	}

	let kind = client.lookup_kind("http_route").await.unwrap();
	let mut cursor = client.list::<HttpRoute>(&kind).await.unwrap();
	assert_eq!(cursor.len(), 2);

	let mut out = HttpRoute::new("", EntityId::from(""));
	let mut hosts = Vec::new();
	while cursor.next() {
		cursor.read(&mut out).unwrap();
		hosts.push(out.host.clone());
	}
	hosts.sort();
	assert_eq!(hosts, ["a.com", "b.com"]);
}

#[tokio::test]
async fn watch_index_over_rpc_sees_live_ops() {
	let (_store, client) = clients();
	let apps = AppsClient::new(client.clone());

	let mut watch = apps.watch_pool("app-1/av-1/web").await.unwrap();

	let sandbox = entity_common::kinds::Sandbox {
		containers: vec![entity_common::kinds::ContainerSpec {
			image: "img:v1".into(),
			env: Default::default(),
			ports: vec![entity_common::kinds::PortSpec {
				name: "web".into(),
				port: 8080,
			}],
			resources: Default::default(),
		}],
		networks: vec![],
		status: SandboxStatus::Pending,
		app: EntityId::from("app-1"),
		version: EntityId::from("av-1"),
		service: "web".into(),
		extras: vec![],
	};
	client
		.put(&sandbox.to_entity(EntityId::from("sb-1")).unwrap())
		.await
		.unwrap();

	let op = watch.next().await.unwrap().unwrap();
	assert_eq!(op.op, OpKind::Create);
	assert_eq!(op.entity_id, EntityId::from("sb-1"));

	apps.set_sandbox_status(&EntityId::from("sb-1"), SandboxStatus::Running)
		.await
		.unwrap();
	let op = watch.next().await.unwrap().unwrap();
	assert_eq!(op.op, OpKind::Update);
}

#[tokio::test]
async fn sandbox_lifecycle_through_apps_client() {
	let (_store, client) = clients();
	let apps = AppsClient::new(client.clone());

	let sandbox = entity_common::kinds::Sandbox {
		containers: vec![entity_common::kinds::ContainerSpec {
			image: "img:v1".into(),
			env: Default::default(),
			ports: vec![],
			resources: Default::default(),
		}],
		networks: vec![],
		status: SandboxStatus::Running,
		app: EntityId::from("app-1"),
		version: EntityId::from("av-1"),
		service: "web".into(),
		extras: vec![],
	};
	let id = EntityId::from("sb-1");
	client.put(&sandbox.to_entity(id.clone()).unwrap()).await.unwrap();

	apps.stop_sandbox(&id).await.unwrap();
	assert_eq!(
		apps.sandbox(&id).await.unwrap().status,
		SandboxStatus::Stopped
	);

	// Deleting a merely-stopped sandbox is a precondition failure.
	let err = apps.delete_sandbox(&id).await.unwrap_err();
	assert!(matches!(err, entity_common::Error::Precondition(_)));

	apps.set_sandbox_status(&id, SandboxStatus::Dead).await.unwrap();
	apps.delete_sandbox(&id).await.unwrap();
	assert!(apps.sandbox(&id).await.unwrap_err().is_not_found());
}
