//! Per-connection state machine. One task owns the socket from accept to
//! close: it sniffs TLS, picks the connection's role off the first byte,
//! then runs the RPC frame loop (or hands the socket to the proxy layer and
//! never sees it again).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tracing::{debug, warn};

use crate::codec::{FrameHeader, RequestType, HEADER_LEN, PIPE_MAGIC, PROXY_MAGIC, RPC_MAGIC, WS_MAGIC};
use crate::config::ServerConfig;
use crate::payload;
use crate::proxy;
use crate::pubsub::{Broker, PublishOutcome, SubscriberHandle};
use crate::router::{CallContext, Handler, Router};
use crate::server::{EventSink, ServerEvent};
use crate::stream::{self, RpcStream, StreamCore};
use crate::transport::tls::{classify, TlsSniff, SNIFF_LEN};
use crate::transport::{Io, Rewind};
use crate::wire::{self, Closer, Liveness, StreamSlot, WireMsg, WriterTx};

pub(crate) struct ConnectionCtx {
	pub id: u64,
	pub cfg: Arc<ServerConfig>,
	pub router: Arc<Router>,
	pub broker: Arc<Broker>,
	pub tls: Option<TlsAcceptor>,
	pub events: EventSink,
	pub server_closer: Closer,
}

/// Apply the connection idle deadline to one read.
async fn with_idle<T>(
	idle: Duration,
	fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
	if idle.is_zero() {
		fut.await
	} else {
		tokio::time::timeout(idle, fut)
			.await
			.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout"))?
	}
}

pub(crate) async fn serve(stream: TcpStream, ctx: ConnectionCtx) {
	let Ok(peer) = stream.peer_addr() else { return };
	let _ = stream.set_nodelay(true);

	let Some(mut io) = establish_io(stream, &ctx).await else {
		return;
	};

	let mut first = [0u8; 1];
	if with_idle(ctx.cfg.idle_timeout, io.read_exact(&mut first))
		.await
		.is_err()
	{
		return;
	}

	// the role decision: taken exactly once, on the first byte
	match first[0] {
		RPC_MAGIC => serve_rpc(io, &ctx, peer).await,
		PROXY_MAGIC | PIPE_MAGIC | WS_MAGIC => {
			let Some(setup) = &ctx.cfg.proxy else {
				debug!(conn = ctx.id, magic = first[0], "proxy traffic refused: proxy disabled");
				return;
			};
			match first[0] {
				PROXY_MAGIC => proxy::serve_traffic_proxy(io, setup).await,
				PIPE_MAGIC => proxy::pipe::serve_pipe(io, setup).await,
				_ => proxy::serve_ws_forward(io, setup, first[0]).await,
			}
		},
		other => {
			warn!(conn = ctx.id, magic = other, "protocol error on first byte");
		},
	}
}

/// Pre-read three bytes when TLS is configured and decide between a TLS
/// handshake (with the bytes replayed) and the plaintext fallback. Without
/// a certificate there is nothing to sniff.
async fn establish_io(stream: TcpStream, ctx: &ConnectionCtx) -> Option<Io> {
	let Some(acceptor) = &ctx.tls else {
		return Some(Io::plain(stream));
	};
	let mut rewind = Rewind::new(stream);
	let mut prefix = [0u8; SNIFF_LEN];
	if with_idle(ctx.cfg.idle_timeout, rewind.read_exact(&mut prefix))
		.await
		.is_err()
	{
		return None;
	}
	match classify(&prefix) {
		TlsSniff::ClientHello => {
			rewind.rewind(Bytes::copy_from_slice(&prefix));
			match acceptor.accept(rewind).await {
				Ok(tls) => Some(Io::Tls(Box::new(TlsStream::Server(tls)))),
				Err(e) => {
					debug!(conn = ctx.id, error = %e, "tls handshake failed");
					None
				},
			}
		},
		TlsSniff::Plaintext => {
			if ctx.cfg.tls.as_ref().map(|t| t.require_tls).unwrap_or(false) {
				debug!(conn = ctx.id, "closing plaintext connection: tls required");
				return None;
			}
			debug!(conn = ctx.id, "falling back to plaintext");
			rewind.rewind(Bytes::copy_from_slice(&prefix));
			Some(Io::Plain(rewind))
		},
		TlsSniff::Malformed => {
			debug!(conn = ctx.id, "unsupported tls record version");
			None
		},
	}
}

async fn serve_rpc(io: Io, ctx: &ConnectionCtx, peer: SocketAddr) {
	let (rd, wr) = tokio::io::split(io);
	let closer = Closer::new();
	let liveness = Liveness::default();
	let slot = StreamSlot::default();
	let (tx, rx) = mpsc::unbounded_channel();
	let writer = tokio::spawn(wire::write_loop(
		wr,
		rx,
		closer.clone(),
		slot.clone(),
		liveness.clone(),
	));
	let handle = SubscriberHandle::new(ctx.id, tx.clone(), closer.clone());

	if let Err(e) = rpc_loop(rd, ctx, peer, &tx, &closer, &liveness, &slot, &handle).await {
		debug!(conn = ctx.id, error = %e, "connection ended");
		ctx.events.emit(ServerEvent::ConnectionError {
			conn_id: ctx.id,
			message: e.to_string(),
		});
	}

	// teardown: the broker index entry, the stream (if any), the writer
	ctx.broker.remove_connection(ctx.id);
	closer.close();
	if let Some(core) = slot.get() {
		if !core.terminal() {
			core.fail(crate::errors::RpcError::new(crate::errors::RpcErrorKind::Internal));
		}
	}
	drop(handle);
	drop(tx);
	let _ = writer.await;
	debug!(conn = ctx.id, "connection released");
}

fn proto_err(msg: impl Into<String>) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn read_header_after_magic<R: AsyncRead + Unpin>(
	rd: &mut R,
	magic_consumed: bool,
) -> io::Result<[u8; HEADER_LEN]> {
	let mut buf = [0u8; HEADER_LEN];
	if magic_consumed {
		buf[0] = RPC_MAGIC;
		rd.read_exact(&mut buf[1..]).await?;
	} else {
		rd.read_exact(&mut buf).await?;
	}
	Ok(buf)
}

#[allow(clippy::too_many_arguments)]
async fn rpc_loop(
	mut rd: ReadHalf<Io>,
	ctx: &ConnectionCtx,
	peer: SocketAddr,
	tx: &WriterTx,
	closer: &Closer,
	liveness: &Liveness,
	slot: &StreamSlot,
	handle: &Arc<SubscriberHandle>,
) -> io::Result<()> {
	let idle = ctx.cfg.idle_timeout;
	let mut first_frame = true;
	loop {
		let header_buf = tokio::select! {
			biased;
			_ = ctx.server_closer.closed() => return Ok(()),
			_ = closer.closed() => return Ok(()),
			r = with_idle(idle, read_header_after_magic(&mut rd, first_frame)) => match r {
				Ok(buf) => buf,
				Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
				Err(e) => return Err(e),
			},
		};
		first_frame = false;
		let header = FrameHeader::decode(&header_buf).map_err(|e| proto_err(e.to_string()))?;

		match header.req_type {
			RequestType::Heartbeat => {
				if header.body_len != 0 {
					return Err(proto_err("heartbeat with body"));
				}
				continue;
			},
			RequestType::Req
			| RequestType::Subscribe
			| RequestType::Unsubscribe
			| RequestType::Publish => {
				if u64::from(header.body_len) >= ctx.cfg.max_body {
					let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail("body too large")));
					return Ok(());
				}
				if header.body_len == 0 && header.req_type != RequestType::Req {
					let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail("bad request")));
					continue;
				}
				let body = with_idle(
					idle,
					wire::read_body_buf(&mut rd, header.body_len as usize),
				)
				.await?;
				liveness.mark();
				// closing the connection cancels the handler along with it
				tokio::select! {
					biased;
					_ = ctx.server_closer.closed() => return Ok(()),
					_ = closer.closed() => return Ok(()),
					_ = dispatch(ctx, peer, tx, handle, &header, body) => {},
				}
			},
			RequestType::Stream => {
				if header.body_len != 0 {
					return Err(proto_err("stream request with body"));
				}
				match ctx.router.lookup(header.func_id) {
					Some(Handler::Stream(make)) => {
						let core = StreamCore::new(tx.clone(), closer.clone(), liveness.clone(), false);
						slot.install(core.clone());
						let _ = tx.send(WireMsg::Frame {
							req_type: RequestType::Stream,
							req_id: header.req_id,
							func_id: 0,
							body: payload::pack_ok_empty(),
						});
						debug!(conn = ctx.id, method = ctx.router.name_of(header.func_id), "stream upgrade");
						tokio::spawn(make(RpcStream::new(core.clone())));
						stream_loop(rd, core, closer, &ctx.server_closer).await;
						return Ok(());
					},
					_ => {
						let _ = tx.send(WireMsg::response(
							header.req_id,
							payload::pack_fail("not a stream method"),
						));
					},
				}
			},
			RequestType::Res => {
				// a client has no business sending replies; stay framed
				let _ = wire::read_body_buf(&mut rd, header.body_len as usize).await?;
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail("bad request type")));
			},
		}
	}
}

async fn dispatch(
	ctx: &ConnectionCtx,
	peer: SocketAddr,
	tx: &WriterTx,
	handle: &Arc<SubscriberHandle>,
	header: &FrameHeader,
	body: Bytes,
) {
	match header.req_type {
		RequestType::Req => match ctx.router.lookup(header.func_id) {
			Some(Handler::Call(call)) => {
				let cctx = CallContext::new(header.req_id, peer, tx.clone());
				if let Some(reply) = call(cctx, body).await {
					let _ = tx.send(WireMsg::response(header.req_id, reply));
				}
			},
			Some(Handler::Stream(_)) => {
				let _ = tx.send(WireMsg::response(
					header.req_id,
					payload::pack_fail("stream method requires stream upgrade"),
				));
			},
			None => {
				let _ = tx.send(WireMsg::response(
					header.req_id,
					payload::pack_fail(&format!("method not found: {:#010x}", header.func_id)),
				));
			},
		},
		RequestType::Subscribe => match payload::unpack::<String>(&body) {
			Ok(key) => {
				ctx.broker.subscribe(&key, handle);
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_ok_empty()));
			},
			Err(e) => {
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail(&e.to_string())));
			},
		},
		RequestType::Unsubscribe => match payload::unpack::<String>(&body) {
			Ok(key) => {
				ctx.broker.unsubscribe(&key, handle.conn_id);
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_ok_empty()));
			},
			Err(e) => {
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail(&e.to_string())));
			},
		},
		RequestType::Publish => match payload::unpack_publish(&body) {
			Ok((key, data)) => {
				match ctx.broker.publish_raw(&key, &data) {
					Ok(PublishOutcome::NoSuchTopic {
						any_subscribers: true,
					}) => {
						ctx.events.emit(ServerEvent::MisroutedPublish { key });
					},
					Ok(_) => {},
					Err(e) => {
						let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail(&e.to_string())));
						return;
					},
				}
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_ok_empty()));
			},
			Err(e) => {
				let _ = tx.send(WireMsg::response(header.req_id, payload::pack_fail(&e.to_string())));
			},
		},
		_ => {},
	}
}

async fn stream_loop(
	mut rd: ReadHalf<Io>,
	core: Arc<StreamCore>,
	closer: &Closer,
	server_closer: &Closer,
) {
	loop {
		let packet = tokio::select! {
			biased;
			_ = server_closer.closed() => break,
			_ = closer.closed() => break,
			r = stream::read_packet(&mut rd) => match r {
				Ok(packet) => packet,
				Err(e) if e.kind() == io::ErrorKind::InvalidData => {
					core.fail(crate::errors::RpcError::bad_request(e.to_string()));
					break;
				},
				Err(e) => {
					core.transport_error(&e);
					break;
				},
			},
		};
		if !core.on_packet(packet) {
			break;
		}
	}
}
