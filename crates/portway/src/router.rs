//! Method table: hashes names to wire ids at registration (rejecting
//! collisions), decodes argument tuples, invokes the typed handler, and
//! encodes the reply envelope.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::method_id;
use crate::errors::RpcError;
use crate::payload;
use crate::stream::RpcStream;
use crate::wire::{WireMsg, WriterTx};

/// Per-call context handed to handlers. Detaching takes over the reply.
pub struct CallContext {
	req_id: u64,
	remote_addr: SocketAddr,
	writer: WriterTx,
	detached: Arc<AtomicBool>,
}

impl CallContext {
	pub(crate) fn new(req_id: u64, remote_addr: SocketAddr, writer: WriterTx) -> Self {
		CallContext {
			req_id,
			remote_addr,
			writer,
			detached: Arc::new(AtomicBool::new(false)),
		}
	}

	pub(crate) fn detached_flag(&self) -> Arc<AtomicBool> {
		self.detached.clone()
	}

	pub fn req_id(&self) -> u64 {
		self.req_id
	}

	pub fn remote_addr(&self) -> SocketAddr {
		self.remote_addr
	}

	/// Take responsibility for the reply. The dispatch path skips its
	/// auto-response; the returned responder must eventually be used, or the
	/// caller only completes by timeout.
	pub fn detach(&self) -> Responder {
		self.detached.store(true, Ordering::Relaxed);
		Responder {
			req_id: self.req_id,
			writer: self.writer.clone(),
		}
	}
}

/// Deferred reply handle for long-running calls; keeps the read loop free.
pub struct Responder {
	req_id: u64,
	writer: WriterTx,
}

impl Responder {
	pub fn respond<T: Serialize>(self, result: Result<T, RpcError>) {
		let body = match result {
			Ok(value) => payload::pack_ok(&value).unwrap_or_else(|e| payload::pack_fail(&e.to_string())),
			Err(e) => payload::pack_fail(&e.to_string()),
		};
		let _ = self.writer.send(WireMsg::response(self.req_id, body));
	}
}

type CallFuture = Pin<Box<dyn Future<Output = Option<Bytes>> + Send>>;
type CallFn = Box<dyn Fn(CallContext, Bytes) -> CallFuture + Send + Sync>;
type StreamFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type StreamFn = Box<dyn Fn(RpcStream) -> StreamFuture + Send + Sync>;

pub(crate) enum Handler {
	Call(CallFn),
	Stream(StreamFn),
}

struct Registration {
	name: String,
	handler: Handler,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
	#[error("method {0:?} is already registered")]
	Duplicate(String),
	#[error("method id collision: {0:?} and {1:?} hash alike")]
	Collision(String, String),
}

#[derive(Default)]
pub struct Router {
	methods: HashMap<u32, Registration>,
}

impl Router {
	/// Register a request/response method. `A` is the argument tuple, `R`
	/// the result; both travel msgpack-encoded.
	pub fn register<A, R, F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegisterError>
	where
		A: DeserializeOwned + Send + 'static,
		R: Serialize + Send + 'static,
		F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
	{
		let handler = Arc::new(handler);
		let call: CallFn = Box::new(move |ctx: CallContext, body: Bytes| {
			let handler = handler.clone();
			Box::pin(async move {
				let detached = ctx.detached_flag();
				let args: A = match payload::unpack_args(&body) {
					Ok(args) => args,
					Err(e) => return Some(payload::pack_fail(&format!("bad request: {e}"))),
				};
				let reply = match handler(ctx, args).await {
					Ok(value) => {
						payload::pack_ok(&value).unwrap_or_else(|e| payload::pack_fail(&e.to_string()))
					},
					Err(e) => payload::pack_fail(&e.to_string()),
				};
				if detached.load(Ordering::Relaxed) {
					None
				} else {
					Some(reply)
				}
			})
		});
		self.insert(name, Handler::Call(call))
	}

	/// Register a stream method. The handler owns the stream handle; the
	/// dispatch path acknowledges the upgrade itself.
	pub fn register_stream<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegisterError>
	where
		F: Fn(RpcStream) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let handler = Arc::new(handler);
		let stream: StreamFn = Box::new(move |s: RpcStream| {
			let handler = handler.clone();
			Box::pin(async move { handler(s).await })
		});
		self.insert(name, Handler::Stream(stream))
	}

	fn insert(&mut self, name: &str, handler: Handler) -> Result<(), RegisterError> {
		let id = method_id(name);
		if let Some(existing) = self.methods.get(&id) {
			if existing.name == name {
				return Err(RegisterError::Duplicate(name.to_string()));
			}
			return Err(RegisterError::Collision(existing.name.clone(), name.to_string()));
		}
		self.methods.insert(
			id,
			Registration {
				name: name.to_string(),
				handler,
			},
		);
		Ok(())
	}

	pub(crate) fn lookup(&self, func_id: u32) -> Option<&Handler> {
		self.methods.get(&func_id).map(|r| &r.handler)
	}

	pub(crate) fn name_of(&self, func_id: u32) -> Option<&str> {
		self.methods.get(&func_id).map(|r| r.name.as_str())
	}
}

#[cfg(test)]
mod tests {
	use tokio::sync::mpsc;

	use super::*;

	fn ctx(writer: WriterTx) -> CallContext {
		CallContext::new(1, "127.0.0.1:1".parse().unwrap(), writer)
	}

	#[tokio::test]
	async fn dispatch_encodes_reply() {
		let mut router = Router::default();
		router
			.register("add", |_ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
			.unwrap();

		let (tx, _rx) = mpsc::unbounded_channel();
		let Handler::Call(call) = router.lookup(method_id("add")).unwrap() else {
			panic!("expected call handler")
		};
		let body = payload::pack(&(1i32, 2i32)).unwrap();
		let reply = call(ctx(tx), body).await.unwrap();
		assert_eq!(payload::parse_reply::<i32>(&reply).unwrap(), 3);
	}

	#[tokio::test]
	async fn undecodable_args_reply_bad_request() {
		let mut router = Router::default();
		router
			.register("add", |_ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
			.unwrap();

		let (tx, _rx) = mpsc::unbounded_channel();
		let Handler::Call(call) = router.lookup(method_id("add")).unwrap() else {
			panic!("expected call handler")
		};
		let reply = call(ctx(tx), Bytes::from_static(b"\xa3abc")).await.unwrap();
		let err = payload::parse_reply::<i32>(&reply).unwrap_err();
		assert!(err.message().unwrap().starts_with("bad request"));
	}

	#[tokio::test]
	async fn handler_error_becomes_fail_reply() {
		let mut router = Router::default();
		router
			.register("boom", |_ctx, (): ()| async move {
				Err::<i32, _>(RpcError::failed("it broke"))
			})
			.unwrap();

		let (tx, _rx) = mpsc::unbounded_channel();
		let Handler::Call(call) = router.lookup(method_id("boom")).unwrap() else {
			panic!("expected call handler")
		};
		let reply = call(ctx(tx), Bytes::new()).await.unwrap();
		let err = payload::parse_reply::<i32>(&reply).unwrap_err();
		assert_eq!(err.message(), Some("failed: it broke"));
	}

	#[tokio::test]
	async fn detached_handler_replies_through_responder() {
		let mut router = Router::default();
		router
			.register("later", |ctx: CallContext, (): ()| async move {
				let responder = ctx.detach();
				tokio::spawn(async move { responder.respond(Ok(99i32)) });
				Ok(())
			})
			.unwrap();

		let (tx, mut rx) = mpsc::unbounded_channel();
		let Handler::Call(call) = router.lookup(method_id("later")).unwrap() else {
			panic!("expected call handler")
		};
		assert!(call(ctx(tx), Bytes::new()).await.is_none());
		let WireMsg::Frame { req_id, body, .. } = rx.recv().await.unwrap() else {
			panic!("expected frame")
		};
		assert_eq!(req_id, 1);
		assert_eq!(payload::parse_reply::<i32>(&body).unwrap(), 99);
	}

	#[test]
	fn duplicate_registration_rejected() {
		let mut router = Router::default();
		router.register("dup", |_ctx, (): ()| async move { Ok(0i32) }).unwrap();
		let err = router
			.register("dup", |_ctx, (): ()| async move { Ok(0i32) })
			.unwrap_err();
		assert!(matches!(err, RegisterError::Duplicate(_)));
	}
}
