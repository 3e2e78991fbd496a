//! Boilerplate to wrap tokio_serde::Framed.
//!
//! Converts a byte-oriented `AsyncRead + AsyncWrite` into a message-oriented
//! `Stream + Sink` of [`Frame`]s: length-delimited framing underneath, serde
//! on top. Two codecs are supported; the compact binary form is the default
//! and the JSON form exists for debugging and interop. Both must decode to
//! identical frames.

use std::pin::Pin;

use futures::{Sink, Stream};
use pin_project::pin_project;
use tokio_serde::formats::{Cbor, Json};
use tokio_util::codec::LengthDelimitedCodec;

use crate::frame::Frame;

/// Frames `Transport` with a tokio-serde `Codec` producing [`Frame`]s.
#[pin_project]
pub struct Framed<Transport, Codec> {
	#[pin]
	inner: tokio_serde::Framed<
		tokio_util::codec::Framed<Transport, LengthDelimitedCodec>,
		Frame,
		Frame,
		Codec,
	>,
}

/// The compact tagged-binary wire form (preferred).
pub fn cbor_framed<T>(transport: T) -> Framed<T, Cbor<Frame, Frame>>
where
	T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
	Framed::new(transport, Cbor::default())
}

/// The JSON wire form (debugging / interop).
pub fn json_framed<T>(transport: T) -> Framed<T, Json<Frame, Frame>>
where
	T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
	Framed::new(transport, Json::default())
}

impl<Transport, Codec> Framed<Transport, Codec>
where
	Transport: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
	pub fn new(transport: Transport, codec: Codec) -> Self {
		let framed =
			tokio_util::codec::Framed::new(transport, LengthDelimitedCodec::new());
		let framed = tokio_serde::Framed::new(framed, codec);
		Self { inner: framed }
	}
}

// Skip potentially !Debug transport.
impl<Transport, Codec> std::fmt::Debug for Framed<Transport, Codec> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct(std::any::type_name::<Self>()).finish()
	}
}

// -- boilerplate to implement stream and sink by calling into the inner type --

impl<Transport, Codec> Stream for Framed<Transport, Codec>
where
	Transport: tokio::io::AsyncRead + tokio::io::AsyncWrite,
	Codec: tokio_serde::Deserializer<Frame>,
	std::io::Error: From<Codec::Error>,
{
	type Item = std::io::Result<Frame>;

	fn poll_next(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<Option<Self::Item>> {
		self.project().inner.poll_next(cx)
	}
}

impl<Transport, Codec> Sink<Frame> for Framed<Transport, Codec>
where
	Transport: tokio::io::AsyncRead + tokio::io::AsyncWrite,
	Codec: tokio_serde::Serializer<Frame>,
	Codec::Error: Into<std::io::Error>,
{
	type Error = std::io::Error;

	fn poll_ready(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::result::Result<(), Self::Error>> {
		self.project().inner.poll_ready(cx)
	}

	fn start_send(
		self: Pin<&mut Self>,
		item: Frame,
	) -> std::result::Result<(), Self::Error> {
		self.project().inner.start_send(item)
	}

	fn poll_flush(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::result::Result<(), Self::Error>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_close(
		self: Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::result::Result<(), Self::Error>> {
		self.project().inner.poll_close(cx)
	}
}
