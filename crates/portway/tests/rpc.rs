//! End-to-end RPC behavior over localhost sockets: calls, timeouts,
//! pub/sub fan-out, stream upgrades, and reconnect-driven resubscription.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portway::{
	ClientConfig, ReconnectPolicy, RpcClient, RpcErrorKind, RpcServer, ServerConfig, ServerHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn test_server(cfg: ServerConfig) -> RpcServer {
	portway_core::telemetry::setup_logging();
	let mut server = RpcServer::bind(cfg).expect("bind");
	server
		.register("add", |_ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
		.unwrap();
	server
		.register("translate", |_ctx, (text,): (String,)| async move {
			Ok(text.to_uppercase())
		})
		.unwrap();
	server
		.register("slow", |_ctx, (value,): (u32,)| async move {
			tokio::time::sleep(Duration::from_millis(200)).await;
			Ok(value)
		})
		.unwrap();
	server
		.register_stream("echo_stream", |stream| async move {
			while let Some(msg) = stream.read::<String>(None).await {
				stream.write(&format!("{msg} from server"));
			}
			stream.write_done();
			let _ = stream.finish(Some(Duration::from_secs(5))).await;
		})
		.unwrap();
	server
}

async fn spawn_server(cfg: ServerConfig) -> (SocketAddr, ServerHandle, JoinHandle<()>) {
	let server = test_server(cfg);
	let addr = server.local_addr().unwrap();
	let handle = server.handle();
	let task = tokio::spawn(async move {
		server.run().await.unwrap();
	});
	(addr, handle, task)
}

async fn connect(addr: SocketAddr) -> RpcClient {
	RpcClient::connect(ClientConfig::new("127.0.0.1", addr.port()))
		.await
		.expect("connect")
}

#[tokio::test]
async fn call_add() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	let sum: i32 = client.call("add", &(1i32, 2i32)).await.unwrap();
	assert_eq!(sum, 3);

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn call_translate() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	let upper: String = client.call("translate", &("hello".to_string(),)).await.unwrap();
	assert_eq!(upper, "HELLO");

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn unknown_method_is_a_fail_reply() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	let err = client.call::<_, i32>("no_such_method", &()).await.unwrap_err();
	assert_eq!(err.kind(), RpcErrorKind::Failed);
	assert!(err.message().unwrap().starts_with("method not found"));

	// the connection survives a bad method
	let sum: i32 = client.call("add", &(2i32, 2i32)).await.unwrap();
	assert_eq!(sum, 4);

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn short_deadline_times_out_and_late_reply_is_dropped() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	let err = client
		.call_with_timeout::<_, u32>("slow", &(7u32,), Duration::from_millis(50))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), RpcErrorKind::Timeout);

	// the late reply for the timed-out call must not leak into this one
	let value: u32 = client
		.call_with_timeout("slow", &(9u32,), Duration::from_millis(400))
		.await
		.unwrap();
	assert_eq!(value, 9);

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn oversized_body_is_rejected() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0).max_body(1024)).await;
	let client = connect(addr).await;

	let big = "x".repeat(64 * 1024);
	let err = client.call::<_, String>("translate", &(big,)).await.unwrap_err();
	assert_eq!(err.kind(), RpcErrorKind::Failed);
	assert_eq!(err.message(), Some("body too large"));

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn publish_fans_out_to_each_subscriber_once() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;

	let client_a = connect(addr).await;
	let client_b = connect(addr).await;
	let client_c = connect(addr).await;
	let client_d = connect(addr).await;

	let (tx_a, mut rx_a) = mpsc::unbounded_channel::<String>();
	let (tx_b, mut rx_b) = mpsc::unbounded_channel::<String>();
	let (tx_d, mut rx_d) = mpsc::unbounded_channel::<String>();
	client_a
		.subscribe("k", move |msg: String| {
			let _ = tx_a.send(msg);
		})
		.await
		.unwrap();
	client_b
		.subscribe("k", move |msg: String| {
			let _ = tx_b.send(msg);
		})
		.await
		.unwrap();
	client_d
		.subscribe("k", move |msg: String| {
			let _ = tx_d.send(msg);
		})
		.await
		.unwrap();
	client_d.unsubscribe("k").await.unwrap();

	client_c.publish("k", &"msg").await.unwrap();

	let got_a = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
		.await
		.unwrap()
		.unwrap();
	let got_b = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(got_a, "msg");
	assert_eq!(got_b, "msg");

	// exactly one delivery each, none for the unsubscribed client
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(rx_a.try_recv().is_err());
	assert!(rx_b.try_recv().is_err());
	assert!(rx_d.try_recv().is_err());

	drop((client_a, client_b, client_c, client_d));
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn duplicate_subscribe_is_rejected_locally() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	client.subscribe("dup", |_msg: String| {}).await.unwrap();
	let err = client.subscribe("dup", |_msg: String| {}).await.unwrap_err();
	assert_eq!(err.kind(), RpcErrorKind::Internal);

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn server_side_publish_reaches_clients() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
	client
		.subscribe("ticks", move |value: u64| {
			let _ = tx.send(value);
		})
		.await
		.unwrap();

	assert_eq!(handle.publish("ticks", &42u64).unwrap(), 1);
	let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(got, 42);

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn stream_echo_in_order() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = connect(addr).await;

	let stream = client
		.upgrade_to_stream("echo_stream", Some(Duration::from_secs(2)))
		.await
		.unwrap();
	for i in (1..=10u32).rev() {
		assert!(stream.write(&format!("msg {i}")));
	}
	assert!(stream.write_done());

	for i in (1..=10u32).rev() {
		let echoed = stream
			.read::<String>(Some(Duration::from_secs(2)))
			.await
			.expect("echo frame");
		assert_eq!(echoed, format!("msg {i} from server"));
	}
	assert_eq!(stream.read::<String>(Some(Duration::from_secs(2))).await, None);
	stream.finish(Some(Duration::from_secs(2))).await.unwrap();

	// the connection is stream-bound now; new calls are refused
	let err = client.call::<_, i32>("add", &(1i32, 1i32)).await.unwrap_err();
	assert_eq!(err.kind(), RpcErrorKind::Internal);

	drop(stream);
	drop(client);
	handle.shutdown();
	task.await.unwrap();
}

#[tokio::test]
async fn reconnect_resends_subscriptions() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;

	let cfg = ClientConfig::new("127.0.0.1", addr.port()).reconnect(ReconnectPolicy {
		delay: Duration::from_millis(100),
		max_retries: None,
	});
	let client = RpcClient::connect(cfg).await.unwrap();

	let hits = Arc::new(AtomicUsize::new(0));
	let hits_cb = hits.clone();
	let (tx, mut rx) = mpsc::unbounded_channel::<String>();
	client
		.subscribe("k", move |msg: String| {
			hits_cb.fetch_add(1, Ordering::SeqCst);
			let _ = tx.send(msg);
		})
		.await
		.unwrap();

	// kill the first server; its connections die with it
	handle.shutdown();
	task.await.unwrap();

	// a new server appears on the same port; the client must resubscribe
	// on its own before publishes can reach it
	let (new_addr, new_handle, new_task) = spawn_server(ServerConfig::new(addr.port())).await;
	assert_eq!(new_addr.port(), addr.port());

	let mut delivered = None;
	for round in 0..100u32 {
		if new_handle.publish("k", &format!("after-restart-{round}")).unwrap() > 0 {
			delivered = Some(round);
			break;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	let round = delivered.expect("client never resubscribed");

	let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(got, format!("after-restart-{round}"));

	// one subscription in the new broker: one delivery
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(hits.load(Ordering::SeqCst), 1);

	drop(client);
	new_handle.shutdown();
	new_task.await.unwrap();
}

#[tokio::test]
async fn pending_calls_fail_broken_pipe_on_shutdown() {
	let (addr, handle, task) = spawn_server(ServerConfig::new(0)).await;
	let client = Arc::new(connect(addr).await);

	let caller = client.clone();
	let call = tokio::spawn(async move {
		caller
			.call_with_timeout::<(u32,), u32>("slow", &(1u32,), Duration::from_secs(5))
			.await
	});
	tokio::time::sleep(Duration::from_millis(50)).await;
	handle.shutdown();
	task.await.unwrap();

	let err = call.await.unwrap().unwrap_err();
	assert_eq!(err.kind(), RpcErrorKind::BrokenPipe);
	drop(client);
}

#[tokio::test]
async fn delayed_reply_completes_the_call() {
	let mut server = RpcServer::bind(ServerConfig::new(0)).unwrap();
	server
		.register("later", |ctx: portway::CallContext, (value,): (u32,)| async move {
			let responder = ctx.detach();
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(50)).await;
				responder.respond(Ok(value * 2));
			});
			Ok(())
		})
		.unwrap();
	let addr = server.local_addr().unwrap();
	let handle = server.handle();
	let task = tokio::spawn(async move { server.run().await.unwrap() });

	let client = connect(addr).await;
	let doubled: u32 = client.call("later", &(21u32,)).await.unwrap();
	assert_eq!(doubled, 42);

	drop(client);
	handle.shutdown();
	task.await.unwrap();
}
