//! Shared connection machinery: the outbound write queue, the close signal
//! every task of a connection watches, and frame-level read helpers.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::codec::{FrameHeader, RequestType, HEADER_LEN};
use crate::stream::{PacketKind, StreamCore, StreamPacket};

/// Everything a connection can put on the wire. One writer task per
/// connection drains these in FIFO order with a single outstanding write.
#[derive(Debug)]
pub(crate) enum WireMsg {
	Frame {
		req_type: RequestType,
		req_id: u64,
		func_id: u32,
		body: Bytes,
	},
	Stream(StreamPacket),
}

impl WireMsg {
	pub(crate) fn response(req_id: u64, body: Bytes) -> WireMsg {
		WireMsg::Frame {
			req_type: RequestType::Res,
			req_id,
			func_id: 0,
			body,
		}
	}

	pub(crate) fn publish(body: Bytes) -> WireMsg {
		WireMsg::Frame {
			req_type: RequestType::Publish,
			req_id: 0,
			func_id: 0,
			body,
		}
	}

	pub(crate) fn heartbeat() -> WireMsg {
		WireMsg::Frame {
			req_type: RequestType::Heartbeat,
			req_id: 0,
			func_id: 0,
			body: Bytes::new(),
		}
	}
}

pub(crate) type WriterTx = mpsc::UnboundedSender<WireMsg>;

/// Idempotent close signal. Cloned into every task touching one connection;
/// the first `close` wins and everyone observes it.
#[derive(Clone, Debug)]
pub(crate) struct Closer {
	tx: Arc<watch::Sender<bool>>,
}

impl Closer {
	pub(crate) fn new() -> Self {
		Closer {
			tx: Arc::new(watch::channel(false).0),
		}
	}

	pub(crate) fn close(&self) {
		self.tx.send_if_modified(|closed| {
			if *closed {
				false
			} else {
				*closed = true;
				true
			}
		});
	}

	pub(crate) fn is_closed(&self) -> bool {
		*self.tx.borrow()
	}

	pub(crate) async fn closed(&self) {
		let mut rx = self.tx.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}
}

/// "Saw traffic since the last keepalive tick" flag, shared by the reader,
/// the writer, and whichever heartbeat timer is active.
#[derive(Clone, Debug, Default)]
pub(crate) struct Liveness(Arc<AtomicBool>);

impl Liveness {
	pub(crate) fn mark(&self) {
		self.0.store(true, Ordering::Relaxed);
	}

	pub(crate) fn take(&self) -> bool {
		self.0.swap(false, Ordering::Relaxed)
	}
}

/// Connections start without a stream; the upgrade installs one. The writer
/// task reads the slot to learn about finish/error bookkeeping it owes the
/// stream.
#[derive(Clone, Default)]
pub(crate) struct StreamSlot(Arc<OnceLock<Arc<StreamCore>>>);

impl StreamSlot {
	pub(crate) fn install(&self, core: Arc<StreamCore>) {
		let _ = self.0.set(core);
	}

	pub(crate) fn get(&self) -> Option<&Arc<StreamCore>> {
		self.0.get()
	}
}

pub(crate) async fn read_header_buf<R: AsyncRead + Unpin>(rd: &mut R) -> io::Result<[u8; HEADER_LEN]> {
	let mut buf = [0u8; HEADER_LEN];
	rd.read_exact(&mut buf).await?;
	Ok(buf)
}

pub(crate) async fn read_body_buf<R: AsyncRead + Unpin>(rd: &mut R, len: usize) -> io::Result<Bytes> {
	if len == 0 {
		return Ok(Bytes::new());
	}
	let mut buf = vec![0u8; len];
	rd.read_exact(&mut buf).await?;
	Ok(Bytes::from(buf))
}

async fn write_msg<W: AsyncWrite + Unpin>(wr: &mut W, msg: &WireMsg) -> io::Result<()> {
	match msg {
		WireMsg::Frame {
			req_type,
			req_id,
			func_id,
			body,
		} => {
			let header = FrameHeader::new(*req_type, body.len() as u32, *req_id, *func_id);
			wr.write_all(&header.encode()).await?;
			if !body.is_empty() {
				wr.write_all(body).await?;
			}
		},
		WireMsg::Stream(packet) => {
			wr.write_all(&packet.encode_head()).await?;
			if !packet.data.is_empty() {
				wr.write_all(&packet.data).await?;
			}
		},
	}
	wr.flush().await
}

/// Drain the outbound queue onto the socket. Exits when the queue closes,
/// the connection closes, or a write fails; then half-closes the socket so
/// the peer sees EOF after everything already queued was delivered.
pub(crate) async fn write_loop<W: AsyncWrite + Unpin>(
	mut wr: W,
	mut rx: mpsc::UnboundedReceiver<WireMsg>,
	closer: Closer,
	slot: StreamSlot,
	liveness: Liveness,
) {
	let mut draining = false;
	loop {
		let msg = if draining {
			// the connection is closing: flush what was already queued, then
			// leave
			match rx.try_recv() {
				Ok(msg) => msg,
				Err(_) => break,
			}
		} else {
			tokio::select! {
				biased;
				_ = closer.closed() => {
					draining = true;
					continue;
				},
				msg = rx.recv() => match msg {
					Some(msg) => msg,
					None => break,
				},
			}
		};
		match write_msg(&mut wr, &msg).await {
			Ok(()) => {
				liveness.mark();
				if let WireMsg::Stream(packet) = &msg {
					if packet.kind == PacketKind::Finish {
						if let Some(core) = slot.get() {
							core.finish_sent();
						}
					}
				}
			},
			Err(e) => {
				if let Some(core) = slot.get() {
					core.transport_error(&e);
				}
				tracing::debug!(error = %e, "connection write failed");
				closer.close();
				break;
			},
		}
	}
	let _ = wr.shutdown().await;
}
