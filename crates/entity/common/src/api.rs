//! The `EntityAccess` RPC surface: interface/method names and the field ids
//! of every request and response record. Shared by the service and the
//! clients; ids are stable and append-only.

pub const INTERFACE: &str = "miren.dev/EntityAccess";

pub mod method {
	pub const GET: &str = "Get";
	pub const PUT: &str = "Put";
	pub const DELETE: &str = "Delete";
	pub const LIST: &str = "List";
	pub const WATCH_ENTITY: &str = "WatchEntity";
	pub const WATCH_INDEX: &str = "WatchIndex";
	pub const MAKE_ATTR: &str = "MakeAttr";
	pub const LOOKUP_KIND: &str = "LookupKind";
	pub const PARSE: &str = "Parse";
	pub const FORMAT: &str = "Format";
}

pub mod field {
	/// Entity id (`Get`/`Delete`/`WatchEntity` args; `Put` result).
	pub const ID: u32 = 0;
	/// Entity record (`Put`/`Format` args; `Get` result).
	pub const ENTITY: u32 = 0;
	/// Attribute record (`List`/`WatchIndex` args; `MakeAttr`/`LookupKind`
	/// results).
	pub const ATTR: u32 = 0;
	/// Revision (`Put`/`Delete` results).
	pub const REVISION: u32 = 1;
	/// List of entity records (`List` result).
	pub const ENTITIES: u32 = 0;
	/// Raw manifest bytes (`Parse` args, `Format` result).
	pub const BYTES: u32 = 0;
	/// List of parsed-doc records (`Parse` result).
	pub const DOCS: u32 = 0;
	/// Dialect tag (`Parse` result, `Format` args).
	pub const FORMAT: u32 = 1;
	/// Attribute name (`MakeAttr` args) or kind name (`LookupKind` args).
	pub const NAME: u32 = 0;
	/// Attribute string value (`MakeAttr` args).
	pub const VALUE: u32 = 1;

	// Parsed-doc records inside `DOCS`.
	pub const DOC_ENTITY: u32 = 0;
	pub const DOC_KNOWN_KIND: u32 = 1;
}

/// Dialect tags carried in `Parse`/`Format` records.
pub const FORMAT_YAML: &str = "yaml";
pub const FORMAT_RECORDS: &str = "records";

use crate::manifest::Format;

pub fn format_tag(format: Format) -> &'static str {
	match format {
		Format::Yaml => FORMAT_YAML,
		Format::Records => FORMAT_RECORDS,
	}
}

pub fn format_from_tag(tag: &str) -> Option<Format> {
	match tag {
		FORMAT_YAML => Some(Format::Yaml),
		FORMAT_RECORDS => Some(Format::Records),
		_ => None,
	}
}
