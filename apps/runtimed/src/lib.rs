//! The miren runtime daemon.
//!
//! One process hosts the three core services: the entity store (served over
//! RPC for external tooling and wired in-process for the daemon's own
//! components), the activator, and the HTTP ingress. A dev sandbox
//! controller is included so a fresh checkout serves traffic end to end;
//! production controllers (microVM, containerd) live outside this crate and
//! drive the same sandbox entities.

mod cache;
mod controller;

pub use self::cache::{cache_dir, load_token};
pub use self::controller::DevController;

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use activator::{Activator, ActivatorConfig};
use entity_client::{AppsClient, EntityClient, IngressClient};
use entity_server::EntityStore;
use eyre::WrapErr;
use ingress::{Ingress, IngressConfig, LogTelemetry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(clap::Parser, Debug, Clone)]
pub struct Args {
	/// Ingress port; 0 picks an ephemeral one.
	#[clap(long, short, env = "MIREN_PORT", default_value = "80")]
	pub port: u16,
	/// Entity store RPC port; 0 picks an ephemeral one.
	#[clap(long, env = "MIREN_STORE_PORT", default_value = "4700")]
	pub store_port: u16,
	/// Address both listeners bind on.
	#[clap(long, default_value_t = IpAddr::from(Ipv6Addr::UNSPECIFIED))]
	pub bind: IpAddr,
	/// Per-request proxy deadline, in seconds.
	#[clap(long, default_value = "60")]
	pub request_timeout_secs: u64,
	/// How long leases live without a renewal, in seconds.
	#[clap(long, default_value = "60")]
	pub lease_ttl_secs: u64,
	/// Budget for a sandbox to reach RUNNING, in seconds.
	#[clap(long, default_value = "120")]
	pub boot_timeout_secs: u64,
	/// Cluster name; scopes cached credentials.
	#[clap(long, env = "MIREN_CLUSTER", default_value = "local")]
	pub cluster: String,
	/// Manifest files to apply at startup (repeatable).
	#[clap(long = "apply")]
	pub apply: Vec<PathBuf>,
	/// Rely on an external sandbox controller instead of the built-in dev
	/// one.
	#[clap(long)]
	pub external_controller: bool,
}

/// A started daemon, for embedding and tests.
pub struct Runtime {
	pub ingress_addr: SocketAddr,
	pub store_addr: SocketAddr,
	client: EntityClient,
	activator: Activator,
	shutdown: CancellationToken,
	ingress_task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Runtime {
	pub fn client(&self) -> &EntityClient {
		&self.client
	}

	/// Graceful shutdown: stop accepting, cancel the workers, wait for the
	/// ingress to drain.
	pub async fn stop(self) {
		self.shutdown.cancel();
		self.activator.shutdown();
		if let Err(err) = self.ingress_task.await {
			warn!("ingress task ended badly: {err}");
		}
	}
}

pub async fn start(args: Args) -> eyre::Result<Runtime> {
	let store = EntityStore::new();
	let store_listener = TcpListener::bind((args.bind, args.store_port))
		.await
		.wrap_err("failed to bind the entity store listener")?;
	let store_addr = store_listener.local_addr()?;
	{
		let store = store.clone();
		tokio::spawn(async move {
			if let Err(err) = entity_server::listen(store_listener, store).await {
				warn!("entity store listener failed: {err}");
			}
		});
	}

	let client = EntityClient::new(entity_server::connect_in_process(&store));

	match load_token(&args.cluster) {
		Some(_) => info!(cluster = %args.cluster, "using cached credentials"),
		None => info!(cluster = %args.cluster, "no cached credentials"),
	}

	for path in &args.apply {
		apply_manifest(&client, path)
			.await
			.wrap_err_with(|| format!("failed to apply {}", path.display()))?;
	}

	let shutdown = CancellationToken::new();
	if !args.external_controller {
		DevController::spawn(client.clone(), shutdown.clone());
	}

	let apps = AppsClient::new(client.clone());
	let activator = Activator::new(
		apps.clone(),
		ActivatorConfig {
			lease_ttl: Duration::from_secs(args.lease_ttl_secs),
			boot_timeout: Duration::from_secs(args.boot_timeout_secs),
			..ActivatorConfig::default()
		},
	);
	let ingress = Ingress::new(
		IngressClient::new(client.clone()),
		apps,
		activator.clone(),
		Arc::new(LogTelemetry),
		IngressConfig {
			request_timeout: Duration::from_secs(args.request_timeout_secs),
			..IngressConfig::default()
		},
	);

	let ingress_listener = TcpListener::bind((args.bind, args.port))
		.await
		.wrap_err("failed to bind the ingress listener")?;
	let ingress_addr = ingress_listener.local_addr()?;
	info!(%ingress_addr, %store_addr, "miren runtime up");

	let ingress_task = {
		let ingress = ingress.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move { ingress.serve(ingress_listener, shutdown).await })
	};

	Ok(Runtime {
		ingress_addr,
		store_addr,
		client,
		activator,
		shutdown,
		ingress_task,
	})
}

pub async fn main(args: Args) -> color_eyre::Result<()> {
	color_eyre::install()?;
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or("info".into()))
		.with(tracing_subscriber::fmt::layer())
		.init();

	let runtime = start(args).await?;
	tokio::signal::ctrl_c()
		.await
		.wrap_err("failed to wait for ctrl-c")?;
	info!("shutting down");
	runtime.stop().await;
	Ok(())
}

/// Applies every document of a manifest file, preserving revisions of
/// entities that already exist.
async fn apply_manifest(client: &EntityClient, path: &std::path::Path) -> eyre::Result<()> {
	let bytes = tokio::fs::read(path).await?;
	let (docs, _) = client.parse(&bytes).await?;
	for (mut entity, known_kind) in docs {
		if !known_kind {
			warn!(id = %entity.id, "applying entity of unknown kind");
		}
		match client.get(&entity.id).await {
			Ok(current) => entity.revision = current.revision,
			Err(err) if err.is_not_found() => {}
			Err(err) => return Err(err.into()),
		}
		client.put(&entity).await?;
		info!(id = %entity.id, "applied manifest entity");
	}
	Ok(())
}
