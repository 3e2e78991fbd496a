//! Capability-passing RPC for the miren runtime.
//!
//! The transport is abstract: anything `AsyncRead + AsyncWrite` works. Frames
//! are length-prefixed and serialized with serde, in either the compact
//! binary (CBOR) or the JSON debug dialect; both decode to identical frames.
//!
//! On top of the frames sits a small capability model. Either side may
//! register an object and attach a short handle (an *oid*) to an outgoing
//! call; the receiver can invoke that handle, which routes a call back to the
//! sender's object table. Streaming sinks are the main user: a watch call
//! attaches a sink capability, and the server pushes ops into it under
//! credit-based backpressure until one side closes.

mod conn;
mod error;
mod frame;
mod framed;
mod stream;

pub use self::conn::{CallCtx, Connection, Handler};
pub use self::error::RpcError;
pub use self::frame::{CallId, CapDescriptor, CapKind, Frame, Oid, Target, WireError};
pub use self::framed::{cbor_framed, json_framed, Framed};
pub use self::stream::{RemoteSink, SinkEvent, SinkStream};

pub use entity_common::record::{Record, RecordValue};

/// Default number of outstanding pushes a sink grants its producer.
pub const DEFAULT_STREAM_CREDIT: u32 = 32;
