//! The RPC client: calls with deadlines, pub/sub with automatic
//! resubscription after reconnect, keepalive, stream upgrades, and the
//! optional traffic-proxy handshake in front of everything.

mod driver;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{method_id, RequestType};
use crate::config::ClientConfig;
use crate::errors::RpcError;
use crate::payload;
use crate::stream::{RpcStream, StreamCore};
use crate::wire::{Closer, Liveness, WireMsg, WriterTx};

type CallReply = Result<Bytes, RpcError>;
type SubCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

pub(crate) struct ClientShared {
	next_req_id: u64,
	calls: HashMap<u64, oneshot::Sender<CallReply>>,
	subs: HashMap<String, SubCallback>,
	writer: Option<WriterTx>,
	epoch_closer: Option<Closer>,
	pending_stream: Option<Arc<StreamCore>>,
	upgraded: bool,
}

pub(crate) struct ClientInner {
	cfg: ClientConfig,
	shared: Mutex<ClientShared>,
	connected: watch::Sender<bool>,
	released: Closer,
	liveness: Liveness,
}

impl ClientInner {
	fn lock(&self) -> std::sync::MutexGuard<'_, ClientShared> {
		self.shared.lock().expect("client lock")
	}

	/// Register a pending call and put its frame on the wire, waiting for a
	/// connection when there is none yet. Bounded by `deadline`.
	async fn enqueue(
		&self,
		req_type: RequestType,
		func_id: u32,
		body: Bytes,
		deadline: Instant,
	) -> Result<(u64, oneshot::Receiver<CallReply>), RpcError> {
		let mut conn_rx = self.connected.subscribe();
		loop {
			if self.released.is_closed() {
				return Err(RpcError::broken_pipe());
			}
			{
				let mut sh = self.lock();
				if sh.upgraded {
					return Err(RpcError::internal("client already upgraded"));
				}
				if let Some(writer) = sh.writer.clone() {
					sh.next_req_id += 1;
					let req_id = sh.next_req_id;
					let (tx, rx) = oneshot::channel();
					sh.calls.insert(req_id, tx);
					let sent = writer
						.send(WireMsg::Frame {
							req_type,
							req_id,
							func_id,
							body: body.clone(),
						})
						.is_ok();
					if sent {
						return Ok((req_id, rx));
					}
					// the connection flipped under us; retry on the next one
					sh.calls.remove(&req_id);
				}
			}
			match tokio::time::timeout_at(deadline, conn_rx.changed()).await {
				Err(_) => return Err(RpcError::timeout()),
				Ok(Err(_)) => return Err(RpcError::broken_pipe()),
				Ok(Ok(())) => {},
			}
		}
	}

	/// Wait for the reply, enforcing exactly-once completion: when the
	/// deadline wins, the entry is removed so a late reply is dropped.
	async fn await_reply(
		&self,
		req_id: u64,
		rx: oneshot::Receiver<CallReply>,
		deadline: Instant,
	) -> Result<Bytes, RpcError> {
		match tokio::time::timeout_at(deadline, rx).await {
			Err(_) => {
				self.lock().calls.remove(&req_id);
				Err(RpcError::timeout())
			},
			Ok(Err(_)) => Err(RpcError::broken_pipe()),
			Ok(Ok(reply)) => reply,
		}
	}

	pub(crate) fn complete_call(&self, req_id: u64, reply: CallReply) {
		let entry = self.lock().calls.remove(&req_id);
		match entry {
			Some(tx) => {
				let _ = tx.send(reply);
			},
			// completed by timeout already; late replies are dropped
			None => debug!(req_id, "dropping reply for unknown request"),
		}
	}

	pub(crate) fn fail_pending(&self, error: RpcError) {
		let calls = std::mem::take(&mut self.lock().calls);
		for (_, tx) in calls {
			let _ = tx.send(Err(error.clone()));
		}
	}

	pub(crate) fn dispatch_publish(&self, body: &[u8]) {
		match payload::unpack_fanout(body) {
			Ok((_code, key, data)) => {
				let callback = self.lock().subs.get(&key).cloned();
				match callback {
					Some(callback) => callback(data),
					None => debug!(key = %key, "publish for unknown key dropped"),
				}
			},
			Err(e) => warn!(error = %e, "undecodable publish frame"),
		}
	}

	/// Replay every local subscription on a fresh connection, before user
	/// calls resume. The acks come back against throwaway ids.
	pub(crate) fn resend_subscriptions(&self, writer: &WriterTx) {
		let keys: Vec<String> = self.lock().subs.keys().cloned().collect();
		for key in keys {
			let Ok(body) = payload::pack(&key) else { continue };
			let req_id = {
				let mut sh = self.lock();
				sh.next_req_id += 1;
				sh.next_req_id
			};
			debug!(key = %key, "resending subscription");
			let _ = writer.send(WireMsg::Frame {
				req_type: RequestType::Subscribe,
				req_id,
				func_id: 0,
				body,
			});
		}
	}
}

pub struct RpcClient {
	inner: Arc<ClientInner>,
}

impl RpcClient {
	/// Connect and spawn the connection driver. With a reconnect policy the
	/// client is returned even when the first attempt fails; it keeps
	/// retrying in the background and queued work waits for the link.
	pub async fn connect(cfg: ClientConfig) -> Result<RpcClient, RpcError> {
		let connect_timeout = cfg.connect_timeout;
		let reconnecting = cfg.reconnect.is_some();
		let inner = Arc::new(ClientInner {
			cfg,
			shared: Mutex::new(ClientShared {
				next_req_id: 0,
				calls: HashMap::new(),
				subs: HashMap::new(),
				writer: None,
				epoch_closer: None,
				pending_stream: None,
				upgraded: false,
			}),
			connected: watch::channel(false).0,
			released: Closer::new(),
			liveness: Liveness::default(),
		});
		let (first_tx, first_rx) = oneshot::channel();
		tokio::spawn(driver::drive(inner.clone(), first_tx));

		let client = RpcClient { inner };
		match tokio::time::timeout(connect_timeout, first_rx).await {
			Ok(Ok(Ok(()))) => Ok(client),
			Ok(Ok(Err(e))) if !reconnecting => {
				client.inner.released.close();
				Err(e)
			},
			Ok(Err(_)) => {
				client.inner.released.close();
				Err(RpcError::internal("client driver died"))
			},
			Err(_) if !reconnecting => {
				client.inner.released.close();
				Err(RpcError::timeout())
			},
			// reconnect enabled: background retries continue
			_ => Ok(client),
		}
	}

	pub fn is_connected(&self) -> bool {
		*self.inner.connected.borrow()
	}

	/// Call `name` with the default timeout from the config.
	pub async fn call<A, R>(&self, name: &str, args: &A) -> Result<R, RpcError>
	where
		A: Serialize,
		R: DeserializeOwned,
	{
		self.call_with_timeout(name, args, self.inner.cfg.call_timeout).await
	}

	pub async fn call_with_timeout<A, R>(
		&self,
		name: &str,
		args: &A,
		timeout: Duration,
	) -> Result<R, RpcError>
	where
		A: Serialize,
		R: DeserializeOwned,
	{
		let body = payload::pack(args)?;
		let deadline = Instant::now() + timeout;
		let (req_id, rx) = self
			.inner
			.enqueue(RequestType::Req, method_id(name), body, deadline)
			.await?;
		let reply = self.inner.await_reply(req_id, rx, deadline).await?;
		payload::parse_reply(&reply)
	}

	/// Publish `value` on `key`; resolves once the server acknowledged the
	/// frame.
	pub async fn publish<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RpcError> {
		let data = payload::pack(value)?;
		let body = payload::pack_publish(key, &data)?;
		let deadline = Instant::now() + self.inner.cfg.call_timeout;
		let (req_id, rx) = self
			.inner
			.enqueue(RequestType::Publish, 0, body, deadline)
			.await?;
		let reply = self.inner.await_reply(req_id, rx, deadline).await?;
		payload::parse_reply::<String>(&reply).map(|_| ())
	}

	/// Subscribe to `key`. The callback runs on the connection driver and
	/// must not block. The subscription is recorded before the frame is
	/// sent and survives reconnects; a duplicate key is rejected locally.
	pub async fn subscribe<T, F>(&self, key: &str, callback: F) -> Result<(), RpcError>
	where
		T: DeserializeOwned + 'static,
		F: Fn(T) + Send + Sync + 'static,
	{
		{
			let mut sh = self.inner.lock();
			if sh.upgraded {
				return Err(RpcError::internal("client already upgraded"));
			}
			if sh.subs.contains_key(key) {
				return Err(RpcError::internal("duplicate subscribe"));
			}
			let typed: SubCallback = Arc::new(move |data: Vec<u8>| match payload::unpack::<T>(&data) {
				Ok(value) => callback(value),
				Err(e) => warn!(error = %e, "undecodable publish payload"),
			});
			sh.subs.insert(key.to_string(), typed);
		}
		let body = payload::pack(&key)?;
		let deadline = Instant::now() + self.inner.cfg.call_timeout;
		let (req_id, rx) = self
			.inner
			.enqueue(RequestType::Subscribe, 0, body, deadline)
			.await?;
		let reply = self.inner.await_reply(req_id, rx, deadline).await?;
		payload::parse_reply::<String>(&reply).map(|_| ())
	}

	/// Remove the local callback first, then tell the server.
	pub async fn unsubscribe(&self, key: &str) -> Result<(), RpcError> {
		if self.inner.lock().subs.remove(key).is_none() {
			return Err(RpcError::internal("not subscribed"));
		}
		let body = payload::pack(&key)?;
		let deadline = Instant::now() + self.inner.cfg.call_timeout;
		let (req_id, rx) = self
			.inner
			.enqueue(RequestType::Unsubscribe, 0, body, deadline)
			.await?;
		let reply = self.inner.await_reply(req_id, rx, deadline).await?;
		payload::parse_reply::<String>(&reply).map(|_| ())
	}

	/// Upgrade the connection into a bidirectional stream bound to the
	/// handler registered under `name`. After the acknowledgement the
	/// client rejects further calls.
	pub async fn upgrade_to_stream(
		&self,
		name: &str,
		timeout: Option<Duration>,
	) -> Result<RpcStream, RpcError> {
		let timeout = timeout.unwrap_or(self.inner.cfg.call_timeout);
		let deadline = Instant::now() + timeout;
		let mut conn_rx = self.inner.connected.subscribe();
		let (req_id, rx, core) = loop {
			if self.inner.released.is_closed() {
				return Err(RpcError::broken_pipe());
			}
			{
				let mut sh = self.inner.lock();
				if sh.upgraded {
					return Err(RpcError::internal("client already upgraded"));
				}
				let pair = sh.writer.clone().zip(sh.epoch_closer.clone());
				if let Some((writer, epoch_closer)) = pair {
					let core = StreamCore::new(
						writer.clone(),
						epoch_closer,
						self.inner.liveness.clone(),
						true,
					);
					sh.pending_stream = Some(core.clone());
					sh.next_req_id += 1;
					let req_id = sh.next_req_id;
					let (tx, rx) = oneshot::channel();
					sh.calls.insert(req_id, tx);
					let sent = writer
						.send(WireMsg::Frame {
							req_type: RequestType::Stream,
							req_id,
							func_id: method_id(name),
							body: Bytes::new(),
						})
						.is_ok();
					if sent {
						break (req_id, rx, core);
					}
					sh.calls.remove(&req_id);
					sh.pending_stream = None;
				}
			}
			match tokio::time::timeout_at(deadline, conn_rx.changed()).await {
				Err(_) => return Err(RpcError::timeout()),
				Ok(Err(_)) => return Err(RpcError::broken_pipe()),
				Ok(Ok(())) => {},
			}
		};

		match self.inner.await_reply(req_id, rx, deadline).await {
			Ok(reply) => match payload::parse_reply::<String>(&reply) {
				Ok(_) => Ok(RpcStream::new(core)),
				Err(e) => {
					self.inner.lock().pending_stream = None;
					Err(e)
				},
			},
			Err(e) => {
				self.inner.lock().pending_stream = None;
				Err(e)
			},
		}
	}

	/// Tear the client down: socket, timers, and every outstanding call
	/// (each completes `broken_pipe`).
	pub fn close(&self) {
		self.inner.released.close();
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		self.inner.released.close();
	}
}

impl std::fmt::Debug for RpcClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RpcClient")
			.field("connected", &self.is_connected())
			.finish()
	}
}
