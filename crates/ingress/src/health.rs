use std::collections::BTreeMap;

use serde::Serialize;

/// Reserved path, handled directly and never forwarded to a tenant app.
pub const HEALTH_PATH: &str = "/.well-known/miren/health";

#[derive(Debug, Serialize)]
pub struct Health {
	pub status: &'static str,
	pub checks: BTreeMap<&'static str, Check>,
}

#[derive(Debug, Serialize)]
pub struct Check {
	pub status: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Check {
	pub fn ok() -> Self {
		Self {
			status: "ok",
			error: None,
		}
	}

	pub fn failed(error: impl std::fmt::Display) -> Self {
		Self {
			status: "failed",
			error: Some(error.to_string()),
		}
	}

	pub fn is_ok(&self) -> bool {
		self.error.is_none()
	}
}
