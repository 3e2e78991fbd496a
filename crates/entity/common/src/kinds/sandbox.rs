use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attr::{self, Attr, Value, SANDBOX_STATUS_GROUP};
use crate::entity::EntityId;
use crate::error::Error;
use crate::kinds::{spec_bytes, spec_from_bytes, Codec, Resources};
use crate::Result;

/// Lifecycle status of a sandbox. Transitions only move forward:
/// `PENDING → RUNNING → STOPPED → DEAD`, with an early jump to `DEAD`
/// allowed from anywhere. `DEAD` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
	Pending,
	Running,
	Stopped,
	Dead,
}

impl SandboxStatus {
	pub fn as_sym(self) -> &'static str {
		match self {
			SandboxStatus::Pending => "PENDING",
			SandboxStatus::Running => "RUNNING",
			SandboxStatus::Stopped => "STOPPED",
			SandboxStatus::Dead => "DEAD",
		}
	}

	pub fn from_sym(name: &str) -> Option<Self> {
		match name {
			"PENDING" => Some(SandboxStatus::Pending),
			"RUNNING" => Some(SandboxStatus::Running),
			"STOPPED" => Some(SandboxStatus::Stopped),
			"DEAD" => Some(SandboxStatus::Dead),
			_ => None,
		}
	}

	fn rank(self) -> u8 {
		match self {
			SandboxStatus::Pending => 0,
			SandboxStatus::Running => 1,
			SandboxStatus::Stopped => 2,
			SandboxStatus::Dead => 3,
		}
	}

	/// Whether a write may move a sandbox from `self` to `next`.
	pub fn can_become(self, next: SandboxStatus) -> bool {
		next.rank() >= self.rank()
	}
}

impl std::fmt::Display for SandboxStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_sym())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
	pub name: String,
	pub port: u16,
}

/// One container of a sandbox: image plus its runtime parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
	pub image: String,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	#[serde(default)]
	pub ports: Vec<PortSpec>,
	#[serde(default)]
	pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
	/// Reachable address of the sandbox, e.g. `10.0.3.7` or `127.0.0.1`.
	pub address: String,
}

/// An isolated runtime executing one app version's service.
///
/// The activator writes the desired shape (containers, pool membership); the
/// sandbox controller effects boot/teardown and reports progress through the
/// status attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Sandbox {
	pub containers: Vec<ContainerSpec>,
	pub networks: Vec<NetworkSpec>,
	pub status: SandboxStatus,
	pub app: EntityId,
	pub version: EntityId,
	pub service: String,
	pub extras: Vec<Attr>,
}

/// Index key grouping sandboxes into one `(app, version, service)` pool.
pub fn pool_key(app: &EntityId, version: &EntityId, service: &str) -> String {
	format!("{app}/{version}/{service}")
}

impl Sandbox {
	pub fn pool_key(&self) -> String {
		pool_key(&self.app, &self.version, &self.service)
	}

	/// Port declared for this sandbox's service, taken from the first
	/// container that names one.
	pub fn service_port(&self) -> Option<u16> {
		self.containers
			.iter()
			.flat_map(|c| c.ports.iter())
			.find(|p| p.name == self.service)
			.map(|p| p.port)
	}

	/// First reachable address, if the controller has attached networking.
	pub fn address(&self) -> Option<&str> {
		self.networks.first().map(|n| n.address.as_str())
	}
}

impl Codec for Sandbox {
	const KIND: &'static str = "sandbox";

	fn encode_attrs(&self) -> Result<Vec<Attr>> {
		if self.containers.is_empty() {
			return Err(Error::Invalid("sandbox without containers".into()));
		}
		let mut attrs = Vec::new();
		for c in &self.containers {
			attrs.push(Attr::bytes(attr::SANDBOX_CONTAINER, spec_bytes(c)?));
		}
		for n in &self.networks {
			attrs.push(Attr::bytes(attr::SANDBOX_NETWORK, spec_bytes(n)?));
		}
		attrs.push(Attr::new(
			attr::SANDBOX_STATUS,
			Value::sym(SANDBOX_STATUS_GROUP, self.status.as_sym()),
		));
		attrs.push(Attr::str(attr::SANDBOX_POOL, self.pool_key()));
		attrs.push(Attr::entity_ref(attr::SANDBOX_APP, self.app.clone()));
		attrs.push(Attr::entity_ref(attr::SANDBOX_VERSION, self.version.clone()));
		attrs.push(Attr::str(attr::SANDBOX_SERVICE, self.service.clone()));
		attrs.extend(self.extras.iter().cloned());
		Ok(attrs)
	}

	fn decode_attrs(attrs: &[Attr]) -> Result<Self> {
		let mut containers = Vec::new();
		let mut networks = Vec::new();
		let mut status = None;
		let mut app = None;
		let mut version = None;
		let mut service = None;
		let mut extras = Vec::new();
		for a in attrs {
			match (a.id, &a.value) {
				(attr::KIND, _) => {}
				// The pool attr is derived; recomputed on encode.
				(attr::SANDBOX_POOL, _) => {}
				(attr::SANDBOX_CONTAINER, Value::Bytes(raw)) => {
					containers.push(spec_from_bytes::<ContainerSpec>(raw)?)
				}
				(attr::SANDBOX_NETWORK, Value::Bytes(raw)) => {
					networks.push(spec_from_bytes::<NetworkSpec>(raw)?)
				}
				(attr::SANDBOX_STATUS, Value::Sym { name, .. }) => {
					status = SandboxStatus::from_sym(name);
					if status.is_none() {
						return Err(Error::Invalid(format!(
							"unknown sandbox status: {name}"
						)));
					}
				}
				(attr::SANDBOX_APP, Value::Ref(id)) => app = Some(id.clone()),
				(attr::SANDBOX_VERSION, Value::Ref(id)) => {
					version = Some(id.clone())
				}
				(attr::SANDBOX_SERVICE, Value::Str(s)) => {
					service = Some(s.clone())
				}
				_ => extras.push(a.clone()),
			}
		}
		Ok(Sandbox {
			containers,
			networks,
			status: status
				.ok_or_else(|| Error::Invalid("sandbox without status".into()))?,
			app: app.ok_or_else(|| Error::Invalid("sandbox without app".into()))?,
			version: version
				.ok_or_else(|| Error::Invalid("sandbox without version".into()))?,
			service: service
				.ok_or_else(|| Error::Invalid("sandbox without service".into()))?,
			extras,
		})
	}
}
