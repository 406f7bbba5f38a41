//! The connection driver: dial (through the optional traffic proxy and
//! TLS), run one connection epoch, and reconnect with backoff when the
//! policy says so. Exactly one driver task per client.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsStream;
use tracing::{debug, warn};

use crate::codec::{FrameHeader, RequestType, MAX_BODY_LEN};
use crate::config::{ClientConfig, TlsLevel};
use crate::errors::{RpcError, RpcErrorKind};
use crate::proxy::codec::{ProxyRequest, VERIFY_OK};
use crate::stream::{self, StreamCore};
use crate::transport::{tls, Io, Rewind};
use crate::wire::{self, Closer, StreamSlot, WireMsg, WriterTx};

use super::ClientInner;

#[derive(Debug, PartialEq, Eq)]
enum EpochEnd {
	Disconnected,
	Released,
	Upgraded,
}

pub(crate) async fn drive(inner: Arc<ClientInner>, first: oneshot::Sender<Result<(), RpcError>>) {
	let cfg = inner.cfg.clone();
	let mut first = Some(first);
	let mut retries_left = cfg.reconnect.and_then(|r| r.max_retries);
	loop {
		if inner.released.is_closed() {
			break;
		}
		match establish(&cfg).await {
			Ok(io) => {
				if let Some(tx) = first.take() {
					let _ = tx.send(Ok(()));
				}
				let end = run_epoch(&inner, io).await;
				if end != EpochEnd::Disconnected {
					break;
				}
				retries_left = cfg.reconnect.and_then(|r| r.max_retries);
			},
			Err(e) => {
				debug!(error = %e, host = %cfg.host, port = cfg.port, "connect failed");
				if let Some(tx) = first.take() {
					let _ = tx.send(Err(e));
				}
			},
		}
		let Some(policy) = cfg.reconnect else { break };
		if let Some(left) = retries_left.as_mut() {
			if *left == 0 {
				break;
			}
			*left -= 1;
		}
		tokio::select! {
			_ = inner.released.closed() => break,
			_ = tokio::time::sleep(policy.delay) => {},
		}
	}
	inner.connected.send_replace(false);
	inner.fail_pending(RpcError::broken_pipe());
	debug!("client driver stopped");
}

/// Dial, run the proxy handshake when configured, then TLS when configured.
async fn establish(cfg: &ClientConfig) -> Result<Io, RpcError> {
	let mut stream = tokio::time::timeout(
		cfg.connect_timeout,
		TcpStream::connect((cfg.host.as_str(), cfg.port)),
	)
	.await
	.map_err(|_| RpcError::timeout())?
	.map_err(RpcError::from)?;
	stream.set_nodelay(cfg.tcp_nodelay)?;

	if let Some(proxy) = &cfg.proxy {
		let frame = ProxyRequest::new(&proxy.service, &proxy.token, &proxy.field).encode();
		stream.write_all(&frame).await?;
		let mut ack = [0u8; VERIFY_OK.len()];
		stream.read_exact(&mut ack).await?;
		if &ack != VERIFY_OK {
			return Err(RpcError::bad_request("proxy handshake rejected"));
		}
		debug!(service = %proxy.service, "traffic proxy handshake complete");
	}

	let Some(tls_cfg) = cfg.tls.as_ref().filter(|t| t.level != TlsLevel::None) else {
		return Ok(Io::plain(stream));
	};
	let connector = match tls::connector(tls_cfg) {
		Ok(Some(connector)) => connector,
		Ok(None) => return Ok(Io::plain(stream)),
		Err(e) if tls_cfg.level == TlsLevel::Required => {
			return Err(RpcError::with_message(RpcErrorKind::Internal, e.to_string()));
		},
		Err(e) => {
			// optional tls: a broken local config degrades to plaintext
			warn!(error = %e, "tls config unusable, continuing without tls");
			return Ok(Io::plain(stream));
		},
	};
	let name = tls::server_name(&cfg.host)
		.map_err(|e| RpcError::with_message(RpcErrorKind::Internal, e.to_string()))?;
	let tls_stream = connector
		.connect(name, Rewind::new(stream))
		.await
		.map_err(|e| RpcError::with_message(RpcErrorKind::BrokenPipe, e.to_string()))?;
	Ok(Io::Tls(Box::new(TlsStream::Client(tls_stream))))
}

async fn run_epoch(inner: &Arc<ClientInner>, io: Io) -> EpochEnd {
	let (rd, wr) = tokio::io::split(io);
	let closer = Closer::new();
	let slot = StreamSlot::default();
	let (tx, rx) = mpsc::unbounded_channel();
	let writer_task = tokio::spawn(wire::write_loop(
		wr,
		rx,
		closer.clone(),
		slot.clone(),
		inner.liveness.clone(),
	));

	{
		let mut sh = inner.lock();
		sh.writer = Some(tx.clone());
		sh.epoch_closer = Some(closer.clone());
	}
	// subscriptions go out before anything queued behind the connect
	inner.resend_subscriptions(&tx);
	inner.connected.send_replace(true);

	let keepalive_task = inner.cfg.keepalive.map(|period| {
		tokio::spawn(keepalive(
			inner.clone(),
			tx.clone(),
			closer.clone(),
			period,
		))
	});

	let end = read_loop(rd, inner, &closer, &slot).await;

	closer.close();
	if let Some(task) = keepalive_task {
		task.abort();
	}
	inner.connected.send_replace(false);
	{
		let mut sh = inner.lock();
		sh.writer = None;
		sh.epoch_closer = None;
		sh.pending_stream = None;
	}
	if let Some(core) = slot.get() {
		if !core.terminal() {
			core.fail(RpcError::new(RpcErrorKind::Internal));
		}
	}
	inner.fail_pending(RpcError::broken_pipe());
	drop(tx);
	let _ = writer_task.await;
	end
}

async fn read_loop(
	mut rd: ReadHalf<Io>,
	inner: &Arc<ClientInner>,
	closer: &Closer,
	slot: &StreamSlot,
) -> EpochEnd {
	loop {
		let header_buf = tokio::select! {
			biased;
			_ = inner.released.closed() => return EpochEnd::Released,
			_ = closer.closed() => return EpochEnd::Disconnected,
			r = wire::read_header_buf(&mut rd) => match r {
				Ok(buf) => buf,
				Err(e) => {
					debug!(error = %e, "read failed");
					return EpochEnd::Disconnected;
				},
			},
		};
		let header = match FrameHeader::decode(&header_buf) {
			Ok(header) => header,
			Err(e) => {
				warn!(error = %e, "protocol error from server");
				return EpochEnd::Disconnected;
			},
		};
		inner.liveness.mark();

		match header.req_type {
			RequestType::Heartbeat => {
				if header.body_len != 0 {
					return EpochEnd::Disconnected;
				}
			},
			RequestType::Res | RequestType::Publish | RequestType::Stream => {
				if header.body_len == 0 || u64::from(header.body_len) >= MAX_BODY_LEN {
					warn!(body_len = header.body_len, "bad reply length");
					return EpochEnd::Disconnected;
				}
				let body = match wire::read_body_buf(&mut rd, header.body_len as usize).await {
					Ok(body) => body,
					Err(e) => {
						debug!(error = %e, "read failed");
						return EpochEnd::Disconnected;
					},
				};
				match header.req_type {
					RequestType::Res => inner.complete_call(header.req_id, Ok(body)),
					RequestType::Publish => inner.dispatch_publish(&body),
					_ => {
						// stream acknowledgement: flip into stream framing
						let core = {
							let mut sh = inner.lock();
							let core = sh.pending_stream.take();
							if core.is_some() {
								sh.upgraded = true;
							}
							core
						};
						inner.complete_call(header.req_id, Ok(body));
						let Some(core) = core else {
							warn!("unsolicited stream acknowledgement");
							return EpochEnd::Disconnected;
						};
						slot.install(core.clone());
						return stream_mode(rd, inner, closer, core).await;
					},
				}
			},
			_ => {
				warn!(req_type = header_buf[1], "unexpected frame from server");
				return EpochEnd::Disconnected;
			},
		}
	}
}

async fn stream_mode(
	mut rd: ReadHalf<Io>,
	inner: &Arc<ClientInner>,
	closer: &Closer,
	core: Arc<StreamCore>,
) -> EpochEnd {
	loop {
		let packet = tokio::select! {
			biased;
			_ = inner.released.closed() => return EpochEnd::Released,
			_ = closer.closed() => return EpochEnd::Upgraded,
			r = stream::read_packet(&mut rd) => match r {
				Ok(packet) => packet,
				Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
					core.fail(RpcError::bad_request(e.to_string()));
					return EpochEnd::Upgraded;
				},
				Err(e) => {
					core.transport_error(&e);
					return EpochEnd::Upgraded;
				},
			},
		};
		if !core.on_packet(packet) {
			return EpochEnd::Upgraded;
		}
	}
}

/// Two-strike keepalive: a silent period sends a heartbeat, a second one in
/// a row closes the connection as timed out.
async fn keepalive(inner: Arc<ClientInner>, tx: WriterTx, closer: Closer, period: Duration) {
	let mut waiting = false;
	loop {
		tokio::select! {
			_ = closer.closed() => break,
			_ = tokio::time::sleep(period) => {},
		}
		if inner.liveness.take() {
			waiting = false;
			continue;
		}
		if waiting {
			warn!("closing connection: no data within two keepalive periods");
			closer.close();
			break;
		}
		waiting = true;
		let _ = tx.send(WireMsg::heartbeat());
	}
}
