//! Shared entity model for the miren runtime.
//!
//! An entity is a schemaless record: an opaque id, a monotonically increasing
//! revision, timestamps, and an ordered list of typed attributes. Some
//! attributes are declared as indexes, which is what makes hostname routing
//! and pool membership lookups possible without the store knowing anything
//! about apps or sandboxes.
//!
//! This crate is transport-agnostic. The wire representation (tagged records
//! with stable numeric field ids) lives in [`record`], the typed domain kinds
//! (`app`, `app_version`, `http_route`, `sandbox`) in [`kinds`], and the YAML
//! manifest dialect in [`manifest`].

pub mod api;
pub mod attr;
pub mod entity;
pub mod error;
pub mod kinds;
pub mod manifest;
pub mod record;

pub use self::attr::{Attr, AttrDef, AttrId, IndexMode, Schema, Value};
pub use self::entity::{now_ms, Entity, EntityId, EntityOp, OpKind};
pub use self::error::Error;
pub use self::kinds::Codec;

/// Result alias used throughout the entity crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;
