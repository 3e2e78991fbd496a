use std::error::Error as _;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use http::header::{HeaderMap, HeaderName, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use http::Request;
use pin_project::pin_project;

use crate::leases::LeaseUse;
use crate::telemetry::{RequestRecord, Telemetry};

/// Connection-level failures that mean the backend is gone (refused, reset,
/// aborted, host/net unreachable). These invalidate the lease; anything else
/// releases it normally.
pub fn is_dead_backend(err: &reqwest::Error) -> bool {
	let mut source = err.source();
	while let Some(cause) = source {
		if let Some(io) = cause.downcast_ref::<std::io::Error>() {
			if matches!(
				io.kind(),
				std::io::ErrorKind::ConnectionRefused
					| std::io::ErrorKind::ConnectionReset
					| std::io::ErrorKind::ConnectionAborted
			) {
				return true;
			}
			// ENETUNREACH / EHOSTUNREACH have no stable ErrorKind on our
			// minimum toolchain.
			if matches!(io.raw_os_error(), Some(101) | Some(113)) {
				return true;
			}
		}
		source = cause.source();
	}
	err.is_connect()
}

/// Hop-by-hop headers that must not be forwarded either way.
fn hop_by_hop(name: &HeaderName) -> bool {
	name == CONNECTION
		|| name == TRANSFER_ENCODING
		|| name == UPGRADE
		|| name == http::header::TE
		|| name == http::header::TRAILER
		|| name == http::header::PROXY_AUTHENTICATE
		|| name == http::header::PROXY_AUTHORIZATION
		|| name.as_str() == "keep-alive"
}

/// Builds the outbound request for a lease: same method and path, streamed
/// body, forwarding headers rewritten.
pub fn outbound(
	http: &reqwest::Client,
	base: &url::Url,
	req: Request<Body>,
	original_host: &str,
	forwarded_proto: &str,
) -> reqwest::RequestBuilder {
	let mut url = base.clone();
	url.set_path(req.uri().path());
	url.set_query(req.uri().query());

	let (parts, body) = req.into_parts();
	let mut builder = http.request(parts.method, url);
	for (name, value) in parts.headers.iter() {
		if hop_by_hop(name) || name == HOST {
			continue;
		}
		builder = builder.header(name, value);
	}
	builder = builder
		.header("x-forwarded-proto", forwarded_proto)
		.header("x-forwarded-host", original_host);
	builder.body(reqwest::Body::wrap_stream(body.into_data_stream()))
}

/// Turns a backend response into the client response, counting body bytes
/// into the request record.
pub fn into_response(
	resp: reqwest::Response,
	mut record: RequestRecord,
	telemetry: std::sync::Arc<dyn Telemetry>,
	started: tokio::time::Instant,
	lease_use: LeaseUse,
) -> Response {
	record.status = resp.status().as_u16();
	let headers = resp.headers().clone();
	let status = resp.status();

	let body = CountingBody {
		inner: resp.bytes_stream(),
		flight: Some(Flight {
			record,
			telemetry,
			started,
			_lease_use: lease_use,
		}),
	};

	let mut out = Response::builder().status(status);
	if let Some(out_headers) = out.headers_mut() {
		copy_end_to_end(&headers, out_headers);
	}
	out.body(Body::from_stream(body))
		.expect("response construction cannot fail")
}

pub fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
	for (name, value) in from.iter() {
		if hop_by_hop(name) {
			continue;
		}
		to.append(name.clone(), value.clone());
	}
}

/// Everything that must happen exactly once when the response finishes or is
/// abandoned: emit the telemetry record and return the lease use. Lives in
/// the body stream so cancelled requests still report.
struct Flight {
	record: RequestRecord,
	telemetry: std::sync::Arc<dyn Telemetry>,
	started: tokio::time::Instant,
	_lease_use: LeaseUse,
}

impl Drop for Flight {
	fn drop(&mut self) {
		self.record.duration = self.started.elapsed();
		self.telemetry.record(self.record.clone());
	}
}

#[pin_project]
struct CountingBody<S> {
	#[pin]
	inner: S,
	flight: Option<Flight>,
}

impl<S> Stream for CountingBody<S>
where
	S: Stream<Item = reqwest::Result<Bytes>>,
{
	type Item = std::io::Result<Bytes>;

	fn poll_next(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Self::Item>> {
		let this = self.project();
		match this.inner.poll_next(cx) {
			Poll::Ready(Some(Ok(chunk))) => {
				if let Some(flight) = this.flight.as_mut() {
					flight.record.bytes += chunk.len() as u64;
				}
				Poll::Ready(Some(Ok(chunk)))
			}
			Poll::Ready(Some(Err(err))) => {
				// Emit now; the error aborts the transfer.
				this.flight.take();
				Poll::Ready(Some(Err(std::io::Error::other(err))))
			}
			Poll::Ready(None) => {
				this.flight.take();
				Poll::Ready(None)
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn hop_by_hop_headers_are_stripped() {
		assert!(hop_by_hop(&CONNECTION));
		assert!(hop_by_hop(&UPGRADE));
		assert!(!hop_by_hop(&http::header::CONTENT_TYPE));
	}
}
