//! The stream sub-protocol layered inside a connection after an upgrade
//! reply. Frames are `size:u32 LE, type:u8, payload`; the observed type
//! sequence is monotonic and `finish`/`failed` are terminal for the stream
//! and the connection that carries it.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::{RpcError, RpcErrorKind};
use crate::payload;
use crate::wire::{Closer, Liveness, WireMsg, WriterTx};

/// Wire codes for stream packets. Stable across implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PacketKind {
	Data = 1,
	WriteDone = 2,
	Finish = 3,
	Failed = 4,
	Heartbeat = 5,
}

impl PacketKind {
	fn from_u8(v: u8) -> Option<PacketKind> {
		Some(match v {
			1 => PacketKind::Data,
			2 => PacketKind::WriteDone,
			3 => PacketKind::Finish,
			4 => PacketKind::Failed,
			5 => PacketKind::Heartbeat,
			_ => return None,
		})
	}
}

/// Local stream state, ordered: `None < Data < WriteDone < Finish`;
/// `Failed` is terminal like `Finish` but carries an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum StreamStatus {
	None = 0,
	Data = 1,
	WriteDone = 2,
	Finish = 3,
	Failed = 4,
}

#[derive(Debug)]
pub(crate) struct StreamPacket {
	pub kind: PacketKind,
	pub data: Bytes,
}

impl StreamPacket {
	pub(crate) fn data(data: Bytes) -> Self {
		StreamPacket {
			kind: PacketKind::Data,
			data,
		}
	}

	pub(crate) fn control(kind: PacketKind) -> Self {
		StreamPacket {
			kind,
			data: Bytes::new(),
		}
	}

	pub(crate) fn encode_head(&self) -> [u8; 5] {
		let mut head = [0u8; 5];
		head[0..4].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
		head[4] = self.kind as u8;
		head
	}
}

/// Read one stream packet. An unknown type code surfaces as
/// `InvalidData`; the caller turns that into a `bad_request` teardown.
pub(crate) async fn read_packet<R: AsyncRead + Unpin>(rd: &mut R) -> io::Result<StreamPacket> {
	let mut head = [0u8; 5];
	rd.read_exact(&mut head).await?;
	let size = u32::from_le_bytes(head[0..4].try_into().expect("4 bytes")) as usize;
	let kind = PacketKind::from_u8(head[4])
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad stream type {}", head[4])))?;
	let data = if size > 0 {
		let mut buf = vec![0u8; size];
		rd.read_exact(&mut buf).await?;
		Bytes::from(buf)
	} else {
		Bytes::new()
	};
	Ok(StreamPacket { kind, data })
}

struct StreamState {
	status: StreamStatus,
	last_error: Option<RpcError>,
	queue: VecDeque<Bytes>,
}

/// State shared between the stream handle, the connection's reader, and its
/// writer.
pub(crate) struct StreamCore {
	state: Mutex<StreamState>,
	version: watch::Sender<u64>,
	writer: WriterTx,
	closer: Closer,
	liveness: Liveness,
	hb_waiting: AtomicBool,
	hb_task: Mutex<Option<JoinHandle<()>>>,
	is_client: bool,
}

impl StreamCore {
	pub(crate) fn new(writer: WriterTx, closer: Closer, liveness: Liveness, is_client: bool) -> Arc<Self> {
		Arc::new(StreamCore {
			state: Mutex::new(StreamState {
				status: StreamStatus::None,
				last_error: None,
				queue: VecDeque::new(),
			}),
			version: watch::channel(0).0,
			writer,
			closer,
			liveness,
			hb_waiting: AtomicBool::new(false),
			hb_task: Mutex::new(None),
			is_client,
		})
	}

	fn bump(&self) {
		self.version.send_modify(|v| *v += 1);
	}

	pub(crate) fn terminal(&self) -> bool {
		self.state.lock().expect("stream lock").status >= StreamStatus::Finish
	}

	pub(crate) fn last_error(&self) -> Option<RpcError> {
		self.state.lock().expect("stream lock").last_error.clone()
	}

	fn set_status(&self, status: StreamStatus, error: Option<RpcError>) {
		let close;
		{
			let mut st = self.state.lock().expect("stream lock");
			if st.status >= StreamStatus::Finish {
				drop(st);
				self.bump();
				return;
			}
			st.status = status;
			st.last_error = error;
			close = status >= StreamStatus::Finish;
		}
		self.bump();
		if close {
			// terminal stream status tears down the owning connection
			self.closer.close();
		}
	}

	pub(crate) fn fail(&self, error: RpcError) {
		self.set_status(StreamStatus::Failed, Some(error));
	}

	pub(crate) fn transport_error(&self, e: &io::Error) {
		self.fail(RpcError::with_message(RpcErrorKind::BrokenPipe, e.to_string()));
	}

	/// The writer finished flushing our `finish` packet; the stream is done.
	pub(crate) fn finish_sent(&self) {
		self.set_status(StreamStatus::Finish, None);
	}

	/// Apply one received packet. Returns false once the stream is terminal
	/// and the reader should stop.
	pub(crate) fn on_packet(&self, packet: StreamPacket) -> bool {
		self.liveness.mark();
		match packet.kind {
			PacketKind::Heartbeat => true,
			PacketKind::Data => {
				let mut st = self.state.lock().expect("stream lock");
				if st.status > StreamStatus::Data {
					drop(st);
					self.fail(RpcError::new(RpcErrorKind::BadRequest));
					return false;
				}
				st.status = StreamStatus::Data;
				st.queue.push_back(packet.data);
				drop(st);
				self.bump();
				true
			},
			PacketKind::WriteDone => {
				let status = self.state.lock().expect("stream lock").status;
				if status >= StreamStatus::WriteDone {
					self.fail(RpcError::new(RpcErrorKind::BadRequest));
					return false;
				}
				self.set_status(StreamStatus::WriteDone, None);
				true
			},
			PacketKind::Finish => {
				if self.is_client {
					// the peer never finishes a stream for us
					self.fail(RpcError::new(RpcErrorKind::BadRequest));
					return false;
				}
				let status = self.state.lock().expect("stream lock").status;
				if status != StreamStatus::WriteDone {
					self.fail(RpcError::new(RpcErrorKind::BrokenPipe));
				} else {
					self.set_status(StreamStatus::Finish, None);
				}
				false
			},
			PacketKind::Failed => {
				self.fail(RpcError::new(RpcErrorKind::BadRequest));
				false
			},
		}
	}

	fn send_packet(&self, packet: StreamPacket) -> bool {
		self.writer.send(WireMsg::Stream(packet)).is_ok()
	}

	fn write_bytes(&self, data: Bytes) -> bool {
		if self.terminal() {
			return false;
		}
		self.send_packet(StreamPacket::data(data))
	}

	fn write_done(&self) -> bool {
		if self.terminal() {
			return false;
		}
		self.send_packet(StreamPacket::control(PacketKind::WriteDone))
	}

	async fn wait_status(&self, at_least: StreamStatus) {
		let mut rx = self.version.subscribe();
		loop {
			if self.state.lock().expect("stream lock").status >= at_least {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	async fn read_bytes(&self, deadline: Option<Duration>) -> Option<Bytes> {
		let wait = async {
			let mut rx = self.version.subscribe();
			loop {
				{
					let mut st = self.state.lock().expect("stream lock");
					if st.status == StreamStatus::Failed {
						return None;
					}
					if let Some(data) = st.queue.pop_front() {
						return Some(data);
					}
					if st.status >= StreamStatus::WriteDone {
						return None;
					}
				}
				if rx.changed().await.is_err() {
					return None;
				}
			}
		};
		match deadline {
			Some(d) => tokio::time::timeout(d, wait).await.unwrap_or(None),
			None => wait.await,
		}
	}

	async fn finish(&self, deadline: Option<Duration>) -> Result<(), RpcError> {
		if self.is_client && !self.terminal() {
			self.send_packet(StreamPacket::control(PacketKind::Finish));
		}
		let wait = self.wait_status(StreamStatus::Finish);
		match deadline {
			Some(d) => tokio::time::timeout(d, wait).await.map_err(|_| RpcError::timeout())?,
			None => wait.await,
		}
		match self.last_error() {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	fn enable_auto_heartbeat(core: &Arc<StreamCore>, enable: bool, period: Duration) {
		let mut slot = core.hb_task.lock().expect("hb lock");
		if let Some(task) = slot.take() {
			task.abort();
		}
		if !enable {
			return;
		}
		let weak = Arc::downgrade(core);
		*slot = Some(tokio::spawn(async move {
			loop {
				tokio::time::sleep(period).await;
				let Some(core) = weak.upgrade() else { break };
				if core.terminal() {
					break;
				}
				if core.liveness.take() {
					core.hb_waiting.store(false, Ordering::Relaxed);
					continue;
				}
				if core.hb_waiting.swap(true, Ordering::Relaxed) {
					tracing::warn!("closing stream: no data within two heartbeat periods");
					core.fail(RpcError::timeout());
					break;
				}
				core.send_packet(StreamPacket::control(PacketKind::Heartbeat));
			}
		}));
	}

	fn release(&self) {
		if let Some(task) = self.hb_task.lock().expect("hb lock").take() {
			task.abort();
		}
		if !self.terminal() {
			self.fail(RpcError::new(RpcErrorKind::Internal));
		}
	}
}

/// Bidirectional typed stream handle. Held by the server handler on one side
/// and returned from `upgrade_to_stream` on the other; dropping it before
/// `finish` fails the stream and closes the connection.
pub struct RpcStream {
	core: Arc<StreamCore>,
}

impl RpcStream {
	pub(crate) fn new(core: Arc<StreamCore>) -> Self {
		RpcStream { core }
	}

	/// Next value from the peer, or `None` on `write_done`/`finish`/failure
	/// or when `deadline` elapses. Decode failures fail the stream; check
	/// [`last_error`](Self::last_error) to distinguish.
	pub async fn read<T: DeserializeOwned>(&self, deadline: Option<Duration>) -> Option<T> {
		let data = self.core.read_bytes(deadline).await?;
		match payload::unpack::<T>(&data) {
			Ok(value) => Some(value),
			Err(e) => {
				self.core.fail(e);
				None
			},
		}
	}

	/// Queue one value. Returns false when the stream is already terminal or
	/// the value does not encode.
	pub fn write<T: Serialize>(&self, value: &T) -> bool {
		match payload::pack(value) {
			Ok(data) => self.core.write_bytes(data),
			Err(e) => {
				self.core.fail(e);
				false
			},
		}
	}

	/// Signal that this side will not write further data.
	pub fn write_done(&self) -> bool {
		self.core.write_done()
	}

	/// Complete the stream and wait for the terminal state; returns the
	/// stream's final error, if any.
	pub async fn finish(&self, deadline: Option<Duration>) -> Result<(), RpcError> {
		self.core.finish(deadline).await
	}

	pub fn last_error(&self) -> Option<RpcError> {
		self.core.last_error()
	}

	/// When no frame arrived within `period`, send one heartbeat; when the
	/// next period is silent too, close as timeout.
	pub fn enable_auto_heartbeat(&self, enable: bool, period: Duration) {
		StreamCore::enable_auto_heartbeat(&self.core, enable, period);
	}
}

impl Drop for RpcStream {
	fn drop(&mut self) {
		self.core.release();
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::mpsc;

	use super::*;

	fn test_core(is_client: bool) -> (Arc<StreamCore>, mpsc::UnboundedReceiver<WireMsg>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let core = StreamCore::new(tx, Closer::new(), Liveness::default(), is_client);
		(core, rx)
	}

	#[tokio::test]
	async fn data_then_write_done_then_reads_drain() {
		let (core, _rx) = test_core(false);
		assert!(core.on_packet(StreamPacket::data(Bytes::from_static(b"\xa1a"))));
		assert!(core.on_packet(StreamPacket::data(Bytes::from_static(b"\xa1b"))));
		assert!(core.on_packet(StreamPacket::control(PacketKind::WriteDone)));

		let stream = RpcStream::new(core);
		assert_eq!(stream.read::<String>(None).await.as_deref(), Some("a"));
		assert_eq!(stream.read::<String>(None).await.as_deref(), Some("b"));
		assert_eq!(stream.read::<String>(None).await, None);
		assert!(stream.last_error().is_none());
	}

	#[tokio::test]
	async fn regression_is_bad_request() {
		let (core, _rx) = test_core(false);
		assert!(core.on_packet(StreamPacket::control(PacketKind::WriteDone)));
		// data after write_done regresses the status ladder
		assert!(!core.on_packet(StreamPacket::data(Bytes::from_static(b"\xc0"))));
		assert_eq!(core.last_error().unwrap().kind(), RpcErrorKind::BadRequest);
		core.release();
	}

	#[tokio::test]
	async fn duplicate_write_done_is_bad_request() {
		let (core, _rx) = test_core(false);
		assert!(core.on_packet(StreamPacket::control(PacketKind::WriteDone)));
		assert!(!core.on_packet(StreamPacket::control(PacketKind::WriteDone)));
		assert_eq!(core.last_error().unwrap().kind(), RpcErrorKind::BadRequest);
		core.release();
	}

	#[tokio::test]
	async fn server_finish_requires_write_done() {
		let (core, _rx) = test_core(false);
		assert!(!core.on_packet(StreamPacket::control(PacketKind::Finish)));
		assert_eq!(core.last_error().unwrap().kind(), RpcErrorKind::BrokenPipe);
		core.release();
	}

	#[tokio::test]
	async fn client_never_receives_finish() {
		let (core, _rx) = test_core(true);
		assert!(!core.on_packet(StreamPacket::control(PacketKind::Finish)));
		assert_eq!(core.last_error().unwrap().kind(), RpcErrorKind::BadRequest);
		core.release();
	}

	#[tokio::test]
	async fn read_deadline_returns_none() {
		let (core, _rx) = test_core(false);
		let stream = RpcStream::new(core.clone());
		let got = stream.read::<String>(Some(Duration::from_millis(20))).await;
		assert_eq!(got, None);
		// not terminal: the deadline alone does not fail the stream
		assert!(!core.terminal());
	}

	#[tokio::test]
	async fn heartbeat_is_exempt_from_ordering() {
		let (core, _rx) = test_core(false);
		assert!(core.on_packet(StreamPacket::control(PacketKind::WriteDone)));
		assert!(core.on_packet(StreamPacket::control(PacketKind::Heartbeat)));
		core.release();
	}

	#[test]
	fn packet_head_layout() {
		let packet = StreamPacket::data(Bytes::from_static(b"abc"));
		let head = packet.encode_head();
		assert_eq!(&head[0..4], &3u32.to_le_bytes());
		assert_eq!(head[4], 1);
	}
}
