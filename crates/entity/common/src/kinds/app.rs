use crate::attr::{self, Attr, Value};
use crate::entity::EntityId;
use crate::error::Error;
use crate::kinds::Codec;
use crate::Result;

/// A deployed application. Routing resolves `http_route → app →
/// active_version`; an app without an active version is unreachable.
#[derive(Debug, Clone, PartialEq)]
pub struct App {
	pub name: String,
	pub active_version: Option<EntityId>,
	pub project: Option<EntityId>,
	pub extras: Vec<Attr>,
}

impl App {
	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			active_version: None,
			project: None,
			extras: Vec::new(),
		}
	}
}

impl Codec for App {
	const KIND: &'static str = "app";

	fn encode_attrs(&self) -> Result<Vec<Attr>> {
		let mut attrs = vec![Attr::str(attr::METADATA_NAME, self.name.clone())];
		if let Some(v) = &self.active_version {
			attrs.push(Attr::entity_ref(attr::APP_ACTIVE_VERSION, v.clone()));
		}
		if let Some(p) = &self.project {
			attrs.push(Attr::entity_ref(attr::APP_PROJECT, p.clone()));
		}
		attrs.extend(self.extras.iter().cloned());
		Ok(attrs)
	}

	fn decode_attrs(attrs: &[Attr]) -> Result<Self> {
		let mut app = App::named("");
		let mut saw_name = false;
		for a in attrs {
			match (a.id, &a.value) {
				(attr::KIND, _) => {}
				(attr::METADATA_NAME, Value::Str(s)) => {
					app.name = s.clone();
					saw_name = true;
				}
				(attr::APP_ACTIVE_VERSION, Value::Ref(id)) => {
					app.active_version = Some(id.clone());
				}
				(attr::APP_PROJECT, Value::Ref(id)) => {
					app.project = Some(id.clone());
				}
				_ => app.extras.push(a.clone()),
			}
		}
		if !saw_name {
			return Err(Error::Invalid("app without metadata.name".into()));
		}
		Ok(app)
	}
}
