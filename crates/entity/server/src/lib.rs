//! The entity store and the `EntityAccess` service fronting it.
//!
//! The store keeps everything in memory behind a single writer task: every
//! accepted write updates the entity map, recomputes index deltas and
//! notifies watchers as one serialized step, so watchers observe a total
//! order of ops. Reads take consistent snapshots and never queue behind
//! writes.
//!
//! [`EntityService`] exposes the store over [`caprpc`]: plain request/return
//! methods for reads and writes, and streaming-sink capabilities for the two
//! watch calls.

mod service;
mod store;

pub use self::service::{connect_in_process, listen, EntityService};
pub use self::store::{EntityStore, PutOutcome};
