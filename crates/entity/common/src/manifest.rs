//! Manifest dialects.
//!
//! Two on-disk forms decode to the same entities:
//!
//! * the YAML flavor: multi-document streams of `kind:` / `version:` /
//!   `metadata:` / `spec:` sections, and
//! * the compact record form: one tagged JSON entity record per line, the
//!   same records the wire uses.
//!
//! `parse` tags its output with the dialect it saw so `format` can round-trip
//! bytes through the same form. Unknown kinds parse successfully but are
//! flagged; fields no codec recognizes are carried in an extras attribute and
//! re-emitted verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::attr::{self, Attr, KNOWN_KINDS};
use crate::entity::{Entity, EntityId};
use crate::error::Error;
use crate::kinds::{
	App, AppVersion, Codec, ContainerSpec, HttpRoute, NetworkSpec, Sandbox,
	SandboxStatus, ServiceSpec,
};
use crate::record::{decode_entity, encode_entity};
use crate::Result;

const MANIFEST_VERSION: &str = "miren/v1";

/// Which dialect a byte stream was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
	Yaml,
	Records,
}

/// One parsed document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDoc {
	pub entity: Entity,
	/// False when the kind has no registered codec. The entity is still
	/// usable; its spec rides along in the extras attribute.
	pub known_kind: bool,
}

/// Output of [`parse`]: the documents plus the dialect tag for round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
	pub docs: Vec<ParsedDoc>,
	pub format: Format,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	name: Option<String>,
	#[serde(flatten)]
	extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Doc {
	kind: String,
	#[serde(default = "manifest_version")]
	version: String,
	#[serde(default)]
	metadata: Metadata,
	#[serde(default)]
	spec: JsonValue,
}

fn manifest_version() -> String {
	MANIFEST_VERSION.to_owned()
}

#[derive(Debug, Serialize, Deserialize)]
struct AppManifest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	active_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	project: Option<String>,
	#[serde(flatten)]
	extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionManifest {
	app: String,
	image_url: String,
	#[serde(default)]
	services: Vec<ServiceSpec>,
	#[serde(flatten)]
	extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteManifest {
	host: String,
	app: String,
	#[serde(default)]
	default: bool,
	#[serde(flatten)]
	extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SandboxManifest {
	#[serde(default)]
	containers: Vec<ContainerSpec>,
	#[serde(default)]
	networks: Vec<NetworkSpec>,
	status: SandboxStatus,
	app: String,
	version: String,
	service: String,
	#[serde(flatten)]
	extra: BTreeMap<String, JsonValue>,
}

/// The extras attribute payload: whatever metadata/spec fields no codec
/// claimed, kept as canonical JSON so emission order is stable.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ExtraBag {
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	metadata: BTreeMap<String, JsonValue>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	spec: BTreeMap<String, JsonValue>,
}

impl ExtraBag {
	fn is_empty(&self) -> bool {
		self.metadata.is_empty() && self.spec.is_empty()
	}

	fn into_attr(self) -> Result<Option<Attr>> {
		if self.is_empty() {
			return Ok(None);
		}
		let raw = serde_json::to_vec(&self)
			.map_err(|err| Error::Parse(format!("extras encode: {err}")))?;
		Ok(Some(Attr::bytes(attr::MANIFEST_EXTRA, raw)))
	}

	fn from_entity(entity: &Entity) -> Result<Self> {
		match entity.first(attr::MANIFEST_EXTRA).and_then(|v| v.as_bytes()) {
			Some(raw) => serde_json::from_slice(raw)
				.map_err(|err| Error::Format(format!("extras decode: {err}"))),
			None => Ok(Self::default()),
		}
	}
}

/// Parses a byte stream in either dialect.
pub fn parse(bytes: &[u8]) -> Result<Parsed> {
	let text = std::str::from_utf8(bytes)
		.map_err(|_| Error::Parse("manifest is not utf-8".into()))?;
	let trimmed = text.trim_start();
	if trimmed.starts_with('{') {
		parse_records(text)
	} else {
		parse_yaml(text)
	}
}

fn parse_records(text: &str) -> Result<Parsed> {
	let mut docs = Vec::new();
	for (lineno, line) in text.lines().enumerate() {
		if line.trim().is_empty() {
			continue;
		}
		let rec = serde_json::from_str(line).map_err(|err| {
			Error::Parse(format!("record line {}: {err}", lineno + 1))
		})?;
		let entity = decode_entity(&rec)?;
		let known_kind = entity
			.first(attr::KIND)
			.and_then(|v| v.as_sym())
			.map(|k| KNOWN_KINDS.contains(&k))
			.unwrap_or(false);
		docs.push(ParsedDoc { entity, known_kind });
	}
	Ok(Parsed {
		docs,
		format: Format::Records,
	})
}

fn parse_yaml(text: &str) -> Result<Parsed> {
	let mut docs = Vec::new();
	for de in serde_yaml::Deserializer::from_str(text) {
		let doc = Doc::deserialize(de)
			.map_err(|err| Error::Parse(format!("yaml: {err}")))?;
		docs.push(parse_doc(doc)?);
	}
	Ok(Parsed {
		docs,
		format: Format::Yaml,
	})
}

fn spec_value(spec: JsonValue) -> JsonValue {
	match spec {
		JsonValue::Null => JsonValue::Object(Default::default()),
		other => other,
	}
}

fn from_spec<T: serde::de::DeserializeOwned>(kind: &str, spec: JsonValue) -> Result<T> {
	serde_json::from_value(spec_value(spec))
		.map_err(|err| Error::Parse(format!("{kind} spec: {err}")))
}

fn parse_doc(doc: Doc) -> Result<ParsedDoc> {
	let id = doc
		.metadata
		.id
		.clone()
		.map(EntityId::from)
		.unwrap_or_else(EntityId::random);
	let mut extras = ExtraBag {
		metadata: doc.metadata.extra,
		..Default::default()
	};

	let (mut entity, known_kind) = match doc.kind.as_str() {
		"app" => {
			let m: AppManifest = from_spec("app", doc.spec)?;
			let name = doc.metadata.name.clone().ok_or_else(|| {
				Error::Parse("app manifest requires metadata.name".into())
			})?;
			let mut app = App::named(name);
			app.active_version = m.active_version.map(EntityId::from);
			app.project = m.project.map(EntityId::from);
			extras.spec = m.extra;
			(app.to_entity(id)?, true)
		}
		"app_version" => {
			let m: VersionManifest = from_spec("app_version", doc.spec)?;
			let mut version =
				AppVersion::new(EntityId::from(m.app), m.image_url);
			version.services = m.services;
			extras.spec = m.extra;
			(version.to_entity(id)?, true)
		}
		"http_route" => {
			let m: RouteManifest = from_spec("http_route", doc.spec)?;
			let mut route = HttpRoute::new(m.host, EntityId::from(m.app));
			route.default = m.default;
			extras.spec = m.extra;
			(route.to_entity(id)?, true)
		}
		"sandbox" => {
			let m: SandboxManifest = from_spec("sandbox", doc.spec)?;
			let sandbox = Sandbox {
				containers: m.containers,
				networks: m.networks,
				status: m.status,
				app: EntityId::from(m.app),
				version: EntityId::from(m.version),
				service: m.service,
				extras: Vec::new(),
			};
			extras.spec = m.extra;
			(sandbox.to_entity(id)?, true)
		}
		other => {
			// No codec for this kind; keep the whole spec in the extras bag.
			let mut entity = Entity::new(id);
			entity.push(crate::attr::Schema::builtin().kind_attr(other));
			if let JsonValue::Object(map) = spec_value(doc.spec) {
				extras.spec = map.into_iter().collect();
			}
			(entity, false)
		}
	};

	// metadata.name on non-app kinds is carried as a plain attribute.
	if doc.kind != "app" {
		if let Some(name) = doc.metadata.name {
			entity.push(Attr::str(attr::METADATA_NAME, name));
		}
	}
	if let Some(extra_attr) = extras.into_attr()? {
		entity.push(extra_attr);
	}
	Ok(ParsedDoc {
		entity,
		known_kind,
	})
}

/// Formats one entity in the given dialect.
pub fn format(entity: &Entity, format: Format) -> Result<Vec<u8>> {
	match format {
		Format::Records => {
			let mut out = serde_json::to_vec(&encode_entity(entity))
				.map_err(|err| Error::Format(err.to_string()))?;
			out.push(b'\n');
			Ok(out)
		}
		Format::Yaml => format_yaml(entity),
	}
}

/// Formats a stream of entities as one multi-document file.
pub fn format_stream(entities: &[Entity], fmt: Format) -> Result<Vec<u8>> {
	let mut out = Vec::new();
	for (i, entity) in entities.iter().enumerate() {
		if fmt == Format::Yaml && i > 0 {
			out.extend_from_slice(b"---\n");
		}
		out.extend(format(entity, fmt)?);
	}
	Ok(out)
}

fn to_spec<T: Serialize>(value: &T) -> Result<JsonValue> {
	serde_json::to_value(value).map_err(|err| Error::Format(err.to_string()))
}

fn format_yaml(entity: &Entity) -> Result<Vec<u8>> {
	let kind = entity
		.first(attr::KIND)
		.and_then(|v| v.as_sym())
		.ok_or_else(|| Error::Format(format!("entity {} has no kind", entity.id)))?
		.to_owned();
	let extras = ExtraBag::from_entity(entity)?;

	let mut metadata = Metadata {
		id: Some(entity.id.to_string()),
		name: None,
		extra: extras.metadata,
	};

	let mut spec = match kind.as_str() {
		"app" => {
			let app = App::from_entity(entity)?;
			metadata.name = Some(app.name.clone());
			to_spec(&AppManifest {
				active_version: app.active_version.map(|v| v.to_string()),
				project: app.project.map(|v| v.to_string()),
				extra: BTreeMap::new(),
			})?
		}
		"app_version" => {
			let version = AppVersion::from_entity(entity)?;
			to_spec(&VersionManifest {
				app: version.app.to_string(),
				image_url: version.image_url.clone(),
				services: version.services,
				extra: BTreeMap::new(),
			})?
		}
		"http_route" => {
			let route = HttpRoute::from_entity(entity)?;
			to_spec(&RouteManifest {
				host: route.host.clone(),
				app: route.app.to_string(),
				default: route.default,
				extra: BTreeMap::new(),
			})?
		}
		"sandbox" => {
			let sandbox = Sandbox::from_entity(entity)?;
			to_spec(&SandboxManifest {
				containers: sandbox.containers.clone(),
				networks: sandbox.networks.clone(),
				status: sandbox.status,
				app: sandbox.app.to_string(),
				version: sandbox.version.to_string(),
				service: sandbox.service.clone(),
				extra: BTreeMap::new(),
			})?
		}
		_ => JsonValue::Object(Default::default()),
	};

	// Non-app kinds carry metadata.name as a plain attribute.
	if kind != "app" {
		if let Some(name) = entity.first(attr::METADATA_NAME).and_then(|v| v.as_str())
		{
			metadata.name = Some(name.to_owned());
		}
	}
	// Merge the preserved unknown spec fields back in.
	if let JsonValue::Object(map) = &mut spec {
		for (k, v) in extras.spec {
			map.entry(k).or_insert(v);
		}
	}

	let doc = Doc {
		kind,
		version: manifest_version(),
		metadata,
		spec,
	};
	serde_yaml::to_string(&doc)
		.map(String::into_bytes)
		.map_err(|err| Error::Format(err.to_string()))
}

#[cfg(test)]
mod test {
	use super::*;

	const ROUTE_YAML: &str = "\
kind: http_route
version: miren/v1
metadata:
  id: r-1
spec:
  host: Example.Com
  app: app-1
  default: true
  rollout_group: blue
";

	#[test]
	fn parses_route_and_preserves_unknown_fields() {
		let parsed = parse(ROUTE_YAML.as_bytes()).unwrap();
		assert_eq!(parsed.format, Format::Yaml);
		assert_eq!(parsed.docs.len(), 1);
		let doc = &parsed.docs[0];
		assert!(doc.known_kind);

		let route = HttpRoute::from_entity(&doc.entity).unwrap();
		assert_eq!(route.host, "example.com");
		assert!(route.default);

		// The unrecognized field must still be there after a format pass.
		let out = format(&doc.entity, Format::Yaml).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.contains("rollout_group"), "got: {text}");
	}

	#[test]
	fn yaml_round_trip_is_stable() {
		let parsed = parse(ROUTE_YAML.as_bytes()).unwrap();
		let first = format(&parsed.docs[0].entity, Format::Yaml).unwrap();
		let reparsed = parse(&first).unwrap();
		let second = format(&reparsed.docs[0].entity, Format::Yaml).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn multi_document_streams_parse() {
		let text = format!("{ROUTE_YAML}---\nkind: app\nmetadata:\n  id: a-1\n  name: demo\nspec: {{}}\n");
		let parsed = parse(text.as_bytes()).unwrap();
		assert_eq!(parsed.docs.len(), 2);
	}

	#[test]
	fn unknown_kinds_parse_but_are_flagged() {
		let text = "kind: gadget\nmetadata:\n  id: g-1\nspec:\n  widgets: 3\n";
		let parsed = parse(text.as_bytes()).unwrap();
		let doc = &parsed.docs[0];
		assert!(!doc.known_kind);

		// Round-trips its spec verbatim.
		let out = format(&doc.entity, Format::Yaml).unwrap();
		assert!(String::from_utf8(out).unwrap().contains("widgets"));
	}

	#[test]
	fn record_lines_round_trip() {
		let parsed = parse(ROUTE_YAML.as_bytes()).unwrap();
		let entity = &parsed.docs[0].entity;
		let line = format(entity, Format::Records).unwrap();
		let reparsed = parse(&line).unwrap();
		assert_eq!(reparsed.format, Format::Records);
		assert_eq!(&reparsed.docs[0].entity, entity);
	}

	#[test]
	fn app_requires_name() {
		let text = "kind: app\nmetadata:\n  id: a-1\nspec: {}\n";
		let err = parse(text.as_bytes()).unwrap_err();
		assert!(matches!(err, Error::Parse(_)));
	}

	#[test]
	fn app_version_services_parse() {
		let text = "\
kind: app_version
metadata:
  id: av-1
spec:
  app: app-1
  image_url: registry/img:v1
  services:
    - name: web
      port: 8080
      concurrency:
        mode: fixed
        num_instances: 2
";
		let parsed = parse(text.as_bytes()).unwrap();
		let version = AppVersion::from_entity(&parsed.docs[0].entity).unwrap();
		assert_eq!(version.services.len(), 1);
		assert_eq!(
			version.services[0].concurrency,
			crate::kinds::Concurrency::Fixed { num_instances: 2 }
		);
	}
}
