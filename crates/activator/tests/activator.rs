//! Activator behavior against a real in-process store, with the test playing
//! the part of the external sandbox controller.

use std::time::Duration;

use activator::{Activator, ActivatorConfig, ActivatorError};
use entity_client::{AppsClient, EntityClient};
use entity_common::entity::EntityId;
use entity_common::kinds::{
	AppVersion, Codec, Concurrency, NetworkSpec, Sandbox, SandboxStatus,
	ServiceSpec,
};
use entity_server::{connect_in_process, EntityStore};

/// How the fake controller treats fresh sandboxes.
#[derive(Clone, Copy)]
enum Controller {
	/// Attach an address and report RUNNING.
	Boot,
	/// Report DEAD before ever running.
	Die,
}

/// Plays the external sandbox controller: drives PENDING sandboxes to
/// RUNNING (or straight to DEAD) and winds STOPPED ones down to DEAD.
fn spawn_controller(client: EntityClient, behavior: Controller) {
	tokio::spawn(async move {
		let kind = match client.lookup_kind("sandbox").await {
			Ok(kind) => kind,
			Err(_) => return,
		};
		let Ok(mut watch) = client.watch_index(&kind).await else {
			return;
		};
		while let Some(Ok(op)) = watch.next().await {
			let Some(entity) = &op.entity else { continue };
			let Ok(sandbox) = Sandbox::from_entity(entity) else {
				continue;
			};
			let next = match (sandbox.status, behavior) {
				(SandboxStatus::Pending, Controller::Boot) => {
					SandboxStatus::Running
				}
				(SandboxStatus::Pending, Controller::Die) => SandboxStatus::Dead,
				(SandboxStatus::Stopped, _) => SandboxStatus::Dead,
				_ => continue,
			};
			// Re-read for the current revision; the op snapshot may be stale
			// by the time we write.
			let Ok(current) = client.get(&entity.id).await else {
				continue;
			};
			let Ok(mut sandbox) = Sandbox::from_entity(&current) else {
				continue;
			};
			sandbox.status = next;
			if next == SandboxStatus::Running {
				sandbox.networks = vec![NetworkSpec {
					address: "127.0.0.1".into(),
				}];
			}
			let Ok(mut updated) = sandbox.to_entity(current.id.clone()) else {
				continue;
			};
			updated.revision = current.revision;
			let _ = client.put(&updated).await;
		}
	});
}

fn test_version(concurrency: Concurrency) -> AppVersion {
	let mut version = AppVersion::new(EntityId::from("app-1"), "registry/app:v1");
	let mut web = ServiceSpec::new("web", 8080);
	web.concurrency = concurrency;
	version.services.push(web);
	version
}

fn test_config() -> ActivatorConfig {
	ActivatorConfig {
		lease_ttl: Duration::from_secs(60),
		boot_timeout: Duration::from_secs(5),
		max_pool_size: 100,
		reconcile_interval: Duration::from_millis(50),
	}
}

struct Harness {
	client: EntityClient,
	apps: AppsClient,
	activator: Activator,
	version: AppVersion,
	version_id: EntityId,
}

fn harness(concurrency: Concurrency, behavior: Controller, cfg: ActivatorConfig) -> Harness {
	let store = EntityStore::new();
	let client = EntityClient::new(connect_in_process(&store));
	spawn_controller(client.clone(), behavior);
	let apps = AppsClient::new(client.clone());
	let activator = Activator::new(apps.clone(), cfg);
	Harness {
		client,
		apps,
		activator,
		version: test_version(concurrency),
		version_id: EntityId::from("av-1"),
	}
}

#[tokio::test]
async fn acquire_boots_then_reuses_the_sandbox() {
	let h = harness(
		Concurrency::default(),
		Controller::Boot,
		test_config(),
	);

	let lease = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
	assert_eq!(lease.url.as_str(), "http://127.0.0.1:8080/");
	assert_eq!(lease.size, 10);
	assert_eq!(lease.pool_key, "app-1/av-1/web");

	let pool = h.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);

	// Released capacity is reused, not re-booted.
	h.activator.release_lease(&lease).await;
	let again = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
	assert_eq!(again.sandbox_id, lease.sandbox_id);
	let pool = h.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn exhausted_auto_pool_boots_a_second_sandbox() {
	let h = harness(
		Concurrency::Auto {
			requests_per_instance: 10,
			scale_down_delay_ms: 60_000,
		},
		Controller::Boot,
		test_config(),
	);

	let first = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
	// Still held, so the next acquire cannot share it.
	let second = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
	assert_ne!(first.sandbox_id, second.sandbox_id);

	let pool = h.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 2);
}

#[tokio::test]
async fn dead_boot_is_sandbox_died_early() {
	let h = harness(Concurrency::default(), Controller::Die, test_config());

	let err = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap_err();
	assert!(err.is_sandbox_died_early());
}

#[tokio::test]
async fn fixed_pool_makes_the_eleventh_wait() {
	let mut cfg = test_config();
	cfg.boot_timeout = Duration::from_millis(800);
	let h = harness(
		Concurrency::Fixed { num_instances: 1 },
		Controller::Boot,
		cfg,
	);

	// The reconciler brings up the fixed instance on first use of the pool.
	let lease = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();

	// With the only lease delegated, a second acquire waits out its budget
	// instead of booting.
	let err = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap_err();
	assert!(matches!(err, ActivatorError::NoCapacity));

	let pool = h.apps.sandboxes_in_pool("app-1/av-1/web").await.unwrap();
	assert_eq!(pool.len(), 1);

	// Releasing frees the slot for the next acquire.
	h.activator.release_lease(&lease).await;
	h.activator.release_lease(&lease).await; // idempotent
	h.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
}

#[tokio::test]
async fn renew_pushes_the_deadline_forward() {
	let h = harness(Concurrency::default(), Controller::Boot, test_config());

	let lease = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
	tokio::time::sleep(Duration::from_millis(50)).await;
	let renewed = h.activator.renew_lease(&lease).await.unwrap();
	assert!(renewed.deadline > lease.deadline);
	assert_eq!(renewed.sandbox_id, lease.sandbox_id);
}

#[tokio::test]
async fn idle_sandboxes_scale_down_and_get_reaped() {
	let h = harness(
		Concurrency::Auto {
			requests_per_instance: 10,
			scale_down_delay_ms: 100,
		},
		Controller::Boot,
		test_config(),
	);

	let lease = h
		.activator
		.acquire_lease(&h.version_id, &h.version, "web")
		.await
		.unwrap();
	h.activator.release_lease(&lease).await;

	// Reconciler stops it after the idle delay, the controller winds it to
	// DEAD, the watcher reaps the record.
	let mut reaped = false;
	for _ in 0..100 {
		tokio::time::sleep(Duration::from_millis(50)).await;
		match h.client.get(&lease.sandbox_id).await {
			Err(err) if err.is_not_found() => {
				reaped = true;
				break;
			}
			_ => {}
		}
	}
	assert!(reaped, "sandbox was never scaled down and reaped");
}
