use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attr::{self, Attr, Value};
use crate::entity::EntityId;
use crate::error::Error;
use crate::kinds::{spec_bytes, spec_from_bytes, Codec};
use crate::Result;

/// How many sandboxes a service wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum Concurrency {
	/// Scale with demand: `ceil(active_uses / requests_per_instance)`
	/// instances, releasing one only after it has idled for the delay.
	Auto {
		requests_per_instance: u32,
		#[serde(default = "default_scale_down_delay_ms")]
		scale_down_delay_ms: u64,
	},
	/// A constant instance count. The only mode that may attach disks.
	Fixed { num_instances: u32 },
}

fn default_scale_down_delay_ms() -> u64 {
	30_000
}

impl Default for Concurrency {
	fn default() -> Self {
		Concurrency::Auto {
			requests_per_instance: 10,
			scale_down_delay_ms: default_scale_down_delay_ms(),
		}
	}
}

impl Concurrency {
	pub fn validate(&self) -> Result<()> {
		match self {
			Concurrency::Auto {
				requests_per_instance,
				..
			} if *requests_per_instance == 0 => Err(Error::Invalid(
				"auto concurrency requires requests_per_instance >= 1".into(),
			)),
			Concurrency::Fixed { num_instances } if *num_instances == 0 => {
				Err(Error::Invalid(
					"fixed concurrency requires num_instances >= 1".into(),
				))
			}
			_ => Ok(()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resources {
	#[serde(default = "default_cpu_millis")]
	pub cpu_millis: u32,
	#[serde(default = "default_memory_mb")]
	pub memory_mb: u32,
}

fn default_cpu_millis() -> u32 {
	1000
}

fn default_memory_mb() -> u32 {
	256
}

impl Default for Resources {
	fn default() -> Self {
		Self {
			cpu_millis: default_cpu_millis(),
			memory_mb: default_memory_mb(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Disk {
	pub name: String,
	pub size_mb: u64,
}

/// One exposed service of an app version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
	pub name: String,
	pub port: u16,
	#[serde(default)]
	pub concurrency: Concurrency,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
	#[serde(default)]
	pub resources: Resources,
	#[serde(default)]
	pub disks: Vec<Disk>,
	/// Max concurrent uses of one sandbox lease.
	#[serde(default = "default_lease_size")]
	pub lease_size: u32,
}

fn default_lease_size() -> u32 {
	10
}

impl ServiceSpec {
	pub fn new(name: impl Into<String>, port: u16) -> Self {
		Self {
			name: name.into(),
			port,
			concurrency: Concurrency::default(),
			env: BTreeMap::new(),
			resources: Resources::default(),
			disks: Vec::new(),
			lease_size: default_lease_size(),
		}
	}

	pub fn validate(&self) -> Result<()> {
		self.concurrency.validate()?;
		if !self.disks.is_empty()
			&& !matches!(self.concurrency, Concurrency::Fixed { .. })
		{
			return Err(Error::Invalid(format!(
				"service {}: disks may only attach to fixed-mode services",
				self.name
			)));
		}
		if self.lease_size == 0 {
			return Err(Error::Invalid(format!(
				"service {}: lease_size must be >= 1",
				self.name
			)));
		}
		Ok(())
	}
}

/// One immutable version of an app: the image plus its service definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct AppVersion {
	pub app: EntityId,
	pub image_url: String,
	pub services: Vec<ServiceSpec>,
	pub extras: Vec<Attr>,
}

impl AppVersion {
	pub fn new(app: EntityId, image_url: impl Into<String>) -> Self {
		Self {
			app,
			image_url: image_url.into(),
			services: Vec::new(),
			extras: Vec::new(),
		}
	}

	pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
		self.services.iter().find(|s| s.name == name)
	}

	pub fn validate(&self) -> Result<()> {
		if self.services.is_empty() {
			return Err(Error::Invalid("app_version without services".into()));
		}
		for service in &self.services {
			service.validate()?;
		}
		Ok(())
	}
}

impl Codec for AppVersion {
	const KIND: &'static str = "app_version";

	fn encode_attrs(&self) -> Result<Vec<Attr>> {
		self.validate()?;
		let mut attrs = vec![
			Attr::entity_ref(attr::VERSION_APP, self.app.clone()),
			Attr::str(attr::VERSION_IMAGE_URL, self.image_url.clone()),
		];
		for service in &self.services {
			attrs.push(Attr::bytes(attr::VERSION_SERVICE, spec_bytes(service)?));
		}
		attrs.extend(self.extras.iter().cloned());
		Ok(attrs)
	}

	fn decode_attrs(attrs: &[Attr]) -> Result<Self> {
		let mut app = None;
		let mut image_url = None;
		let mut services = Vec::new();
		let mut extras = Vec::new();
		for a in attrs {
			match (a.id, &a.value) {
				(attr::KIND, _) => {}
				(attr::VERSION_APP, Value::Ref(id)) => app = Some(id.clone()),
				(attr::VERSION_IMAGE_URL, Value::Str(s)) => {
					image_url = Some(s.clone())
				}
				(attr::VERSION_SERVICE, Value::Bytes(raw)) => {
					services.push(spec_from_bytes::<ServiceSpec>(raw)?)
				}
				_ => extras.push(a.clone()),
			}
		}
		Ok(AppVersion {
			app: app
				.ok_or_else(|| Error::Invalid("app_version without app".into()))?,
			image_url: image_url.ok_or_else(|| {
				Error::Invalid("app_version without image_url".into())
			})?,
			services,
			extras,
		})
	}
}
