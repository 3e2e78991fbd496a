use crate::attr::{self, Attr, Value};
use crate::entity::EntityId;
use crate::error::Error;
use crate::kinds::Codec;
use crate::Result;

/// Hostname → app mapping. The host index is case-insensitive: hosts are
/// lowercased here on encode and by the schema on lookup, so `Example.Com`
/// and `EXAMPLE.COM` resolve to the same route.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRoute {
	pub host: String,
	pub app: EntityId,
	/// Fallback route used when no host matches. At most one route should
	/// hold this at a time; see `ensure_single_default` on the client.
	pub default: bool,
	pub extras: Vec<Attr>,
}

impl HttpRoute {
	pub fn new(host: impl Into<String>, app: EntityId) -> Self {
		Self {
			host: host.into(),
			app,
			default: false,
			extras: Vec::new(),
		}
	}
}

impl Codec for HttpRoute {
	const KIND: &'static str = "http_route";

	fn encode_attrs(&self) -> Result<Vec<Attr>> {
		let mut attrs = vec![
			Attr::str(attr::ROUTE_HOST, self.host.to_lowercase()),
			Attr::entity_ref(attr::ROUTE_APP, self.app.clone()),
			Attr::bool(attr::ROUTE_DEFAULT, self.default),
		];
		attrs.extend(self.extras.iter().cloned());
		Ok(attrs)
	}

	fn decode_attrs(attrs: &[Attr]) -> Result<Self> {
		let mut host = None;
		let mut app = None;
		let mut default = false;
		let mut extras = Vec::new();
		for a in attrs {
			match (a.id, &a.value) {
				(attr::KIND, _) => {}
				(attr::ROUTE_HOST, Value::Str(s)) => host = Some(s.clone()),
				(attr::ROUTE_APP, Value::Ref(id)) => app = Some(id.clone()),
				(attr::ROUTE_DEFAULT, Value::Bool(v)) => default = *v,
				_ => extras.push(a.clone()),
			}
		}
		Ok(HttpRoute {
			host: host.ok_or_else(|| Error::Invalid("route without host".into()))?,
			app: app.ok_or_else(|| Error::Invalid("route without app".into()))?,
			default,
			extras,
		})
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn encode_lowercases_host() {
		let route = HttpRoute::new("Example.Com", EntityId::from("app-1"));
		let attrs = route.encode_attrs().unwrap();
		let host = attrs
			.iter()
			.find(|a| a.id == attr::ROUTE_HOST)
			.and_then(|a| a.value.as_str())
			.unwrap();
		assert_eq!(host, "example.com");
	}
}
