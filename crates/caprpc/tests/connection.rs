//! End-to-end connection tests over an in-memory duplex transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use caprpc::{
	cbor_framed, json_framed, CallCtx, Connection, Handler, Record, RecordValue,
	RpcError, Target, WireError,
};

const ECHO: &str = "test/Echo";

struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
	async fn call(
		&self,
		ctx: CallCtx,
		method: &str,
		args: Record,
	) -> Result<Record, WireError> {
		match method {
			"echo" => Ok(args),
			"delay_echo" => {
				let ms = args.int(1).unwrap_or(0) as u64;
				tokio::time::sleep(Duration::from_millis(ms)).await;
				Ok(args)
			}
			"fail" => Err(WireError {
				code: 1,
				message: "entity not found".into(),
			}),
			"count" => {
				let n = args.int(0).unwrap_or(0);
				let sink = ctx.sink(0)?;
				for i in 0..n {
					let mut item = Record::new();
					item.set(0, RecordValue::Int(i));
					sink.push(item).await.map_err(|err| WireError {
						code: 0,
						message: err.to_string(),
					})?;
				}
				sink.close(None).await.map_err(|err| WireError {
					code: 0,
					message: err.to_string(),
				})?;
				Ok(Record::new())
			}
			other => Err(WireError {
				code: 0,
				message: format!("unknown method: {other}"),
			}),
		}
	}
}

fn pair_with(server: Arc<dyn Handler>) -> (Connection, Connection) {
	let (a, b) = tokio::io::duplex(16 * 1024);
	let client = Connection::spawn(json_framed(a), HashMap::new());
	let mut interfaces: HashMap<String, Arc<dyn Handler>> = HashMap::new();
	interfaces.insert(ECHO.to_owned(), server);
	let server = Connection::spawn(json_framed(b), interfaces);
	(client, server)
}

fn args_with_str(field: u32, s: &str) -> Record {
	let mut rec = Record::new();
	rec.set(field, RecordValue::Str(s.into()));
	rec
}

#[tokio::test]
async fn call_returns_result() {
	let (client, _server) = pair_with(Arc::new(Echo));
	let result = client
		.call(
			Target::Interface(ECHO.into()),
			"echo",
			args_with_str(0, "hello"),
			vec![],
		)
		.await
		.unwrap();
	assert_eq!(result.str(0), Some("hello"));
}

#[tokio::test]
async fn cbor_dialect_decodes_identically() {
	let (a, b) = tokio::io::duplex(16 * 1024);
	let client = Connection::spawn(cbor_framed(a), HashMap::new());
	let mut interfaces: HashMap<String, Arc<dyn Handler>> = HashMap::new();
	interfaces.insert(ECHO.to_owned(), Arc::new(Echo) as Arc<dyn Handler>);
	let _server = Connection::spawn(cbor_framed(b), interfaces);

	let mut args = Record::new();
	args.set(0, RecordValue::Str("hello".into()));
	args.set(1, RecordValue::Int(-42));
	args.set(2, RecordValue::Bool(true));
	args.set(3, RecordValue::Bytes(vec![0u8, 1, 255].into()));
	let result = client
		.call(Target::Interface(ECHO.into()), "echo", args.clone(), vec![])
		.await
		.unwrap();
	assert_eq!(result, args);
}

#[tokio::test]
async fn concurrent_calls_demux_by_id() {
	let (client, _server) = pair_with(Arc::new(Echo));
	let mut handles = Vec::new();
	for i in 0..8i64 {
		let client = client.clone();
		handles.push(tokio::spawn(async move {
			let mut args = Record::new();
			args.set(0, RecordValue::Int(i));
			// Later calls sleep less, so returns come back out of order.
			args.set(1, RecordValue::Int(80 - i * 10));
			let result = client
				.call(Target::Interface(ECHO.into()), "delay_echo", args, vec![])
				.await
				.unwrap();
			assert_eq!(result.int(0), Some(i));
		}));
	}
	for handle in handles {
		handle.await.unwrap();
	}
}

#[tokio::test]
async fn wire_errors_surface_with_code() {
	let (client, _server) = pair_with(Arc::new(Echo));
	let err = client
		.call(Target::Interface(ECHO.into()), "fail", Record::new(), vec![])
		.await
		.unwrap_err();
	assert_eq!(err.as_wire().map(|w| w.code), Some(1));
}

#[tokio::test]
async fn unknown_interface_is_an_error() {
	let (client, _server) = pair_with(Arc::new(Echo));
	let err = client
		.call(
			Target::Interface("test/Nope".into()),
			"echo",
			Record::new(),
			vec![],
		)
		.await
		.unwrap_err();
	assert!(matches!(err, RpcError::Call(_)));
}

#[tokio::test]
async fn stream_delivers_in_wire_order() {
	let (client, _server) = pair_with(Arc::new(Echo));
	let (cap, mut stream) = client.new_sink(4);
	let mut args = Record::new();
	args.set(0, RecordValue::Int(20));
	let call = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.call(Target::Interface(ECHO.into()), "count", args, vec![cap])
				.await
		})
	};

	let mut seen = Vec::new();
	while let Some(item) = stream.next().await {
		seen.push(item.unwrap().int(0).unwrap());
	}
	assert_eq!(seen, (0..20).collect::<Vec<_>>());
	call.await.unwrap().unwrap();
}

#[tokio::test]
async fn slow_consumer_blocks_producer() {
	let (client, _server) = pair_with(Arc::new(Echo));
	let (cap, mut stream) = client.new_sink(2);
	let mut args = Record::new();
	args.set(0, RecordValue::Int(10));
	let call = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.call(Target::Interface(ECHO.into()), "count", args, vec![cap])
				.await
		})
	};

	// Without any reads, the producer stalls after its credit window.
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!call.is_finished());

	// Draining the stream unblocks it; everything arrives, nothing dropped.
	let mut seen = Vec::new();
	while let Some(item) = stream.next().await {
		seen.push(item.unwrap().int(0).unwrap());
	}
	assert_eq!(seen, (0..10).collect::<Vec<_>>());
	call.await.unwrap().unwrap();
}

struct Hang {
	aborted: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
	fn drop(&mut self) {
		self.0.store(true, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl Handler for Hang {
	async fn call(
		&self,
		_ctx: CallCtx,
		_method: &str,
		_args: Record,
	) -> Result<Record, WireError> {
		let _guard = SetOnDrop(self.aborted.clone());
		std::future::pending::<()>().await;
		unreachable!()
	}
}

#[tokio::test]
async fn dropping_a_call_cancels_server_work() {
	let aborted = Arc::new(AtomicBool::new(false));
	let (client, _server) = pair_with(Arc::new(Hang {
		aborted: aborted.clone(),
	}));

	let call = client.call(
		Target::Interface(ECHO.into()),
		"hang",
		Record::new(),
		vec![],
	);
	let timed_out =
		tokio::time::timeout(Duration::from_millis(50), call).await.is_err();
	assert!(timed_out);

	// The drop sent a cancel frame; the handler task gets aborted.
	for _ in 0..100 {
		if aborted.load(Ordering::SeqCst) {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("server never observed the cancellation");
}

#[tokio::test]
async fn close_fails_in_flight_calls() {
	let aborted = Arc::new(AtomicBool::new(false));
	let (client, server) = pair_with(Arc::new(Hang { aborted }));

	let pending = {
		let client = client.clone();
		tokio::spawn(async move {
			client
				.call(Target::Interface(ECHO.into()), "hang", Record::new(), vec![])
				.await
		})
	};
	tokio::time::sleep(Duration::from_millis(20)).await;
	server.close();

	let err = pending.await.unwrap().unwrap_err();
	assert_eq!(err, RpcError::Disconnected);

	// New calls fail fast once the transport is gone.
	tokio::time::sleep(Duration::from_millis(20)).await;
	let err = client
		.call(Target::Interface(ECHO.into()), "echo", Record::new(), vec![])
		.await
		.unwrap_err();
	assert_eq!(err, RpcError::Disconnected);
}
