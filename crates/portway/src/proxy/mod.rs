//! The in-band traffic proxy: everything a connection can become when its
//! first byte is not the RPC magic. Detection is done once per connection;
//! after that the socket is spliced and the RPC engine never sees it again.

pub mod codec;
pub(crate) mod forward;
pub mod pipe;
pub mod registry;
pub(crate) mod socks5;
pub(crate) mod splice;
pub mod websocket;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::ProxySetup;
use crate::proxy::codec::{ProxyRequest, MAX_PROXY_PAYLOAD, PROXY_HEADER_LEN, VERIFY_OK};
use crate::transport::{self, Io};

/// Serve a connection whose first byte was the proxy magic: read the masked
/// request, resolve it against the registry, acknowledge with `"ok"`, and
/// splice. Every failure before the acknowledgement closes without replying.
pub(crate) async fn serve_traffic_proxy(mut io: Io, setup: &ProxySetup) {
	let mut len_buf = [0u8; 4];
	if io.read_exact(&mut len_buf).await.is_err() {
		return;
	}
	let payload_len = ProxyRequest::peek_len(&len_buf) as usize;
	if payload_len > MAX_PROXY_PAYLOAD {
		warn!(payload_len, "proxy request over payload cap");
		return;
	}
	let mut frame = vec![0u8; PROXY_HEADER_LEN + payload_len];
	frame[0] = crate::codec::PROXY_MAGIC;
	frame[1..5].copy_from_slice(&len_buf);
	if io.read_exact(&mut frame[PROXY_HEADER_LEN..]).await.is_err() {
		return;
	}
	let Some(request) = ProxyRequest::decode(&frame) else {
		warn!("invalid proxy request frame");
		return;
	};
	let Some(upstream) = setup
		.registry
		.lookup(&request.service, &request.token, &request.field)
	else {
		warn!(service = %request.service, field = %request.field, "no proxy host for request");
		return;
	};
	debug!(
		service = %request.service,
		field = %request.field,
		host = %upstream.host,
		port = %upstream.service,
		"proxy handoff"
	);
	let upstream_sock = match transport::dial(&upstream.host, &upstream.service).await {
		Ok(sock) => sock,
		Err(e) => {
			warn!(error = %e, "proxy upstream dial failed");
			return;
		},
	};
	if io.write_all(VERIFY_OK).await.is_err() {
		return;
	}
	let _ = io.flush().await;
	if let Err(e) = splice::copy_bidirectional(io, upstream_sock).await {
		debug!(error = %e, "proxy splice ended");
	}
}

/// Serve a connection that opened with an HTTP GET: a WebSocket upgrade
/// against the dynamic route table, then a raw splice to the routed
/// upstream.
pub(crate) async fn serve_ws_forward(mut io: Io, setup: &ProxySetup, first_byte: u8) {
	let upstream = match websocket::serve_upgrade(&mut io, &setup.routes, &[first_byte]).await {
		Ok(upstream) => upstream,
		Err(e) => {
			debug!(error = %e, "websocket upgrade refused");
			return;
		},
	};
	let upstream_sock = match transport::dial(&upstream.host, &upstream.service).await {
		Ok(sock) => sock,
		Err(e) => {
			warn!(error = %e, "websocket route dial failed");
			return;
		},
	};
	if let Err(e) = splice::copy_bidirectional(io, upstream_sock).await {
		debug!(error = %e, "websocket splice ended");
	}
}
