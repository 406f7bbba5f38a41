//! The RPC server: one dual-stack listener whose connections carry RPC
//! frames, pub/sub traffic, typed streams, and the traffic proxy, decided
//! per connection by its first bytes.

mod connection;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::RpcError;
use crate::pubsub::{Broker, PublishOutcome};
use crate::router::{CallContext, RegisterError, Router};
use crate::stream::RpcStream;
use crate::transport;
use crate::transport::tls::{self, TlsError};
use crate::wire::Closer;

/// Non-fatal conditions surfaced to the application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
	/// A publish reached a broker with subscribers, but none for its key.
	MisroutedPublish { key: String },
	ConnectionError { conn_id: u64, message: String },
}

#[derive(Clone, Default)]
pub(crate) struct EventSink(Option<Arc<dyn Fn(ServerEvent) + Send + Sync>>);

impl EventSink {
	pub(crate) fn emit(&self, event: ServerEvent) {
		if let Some(f) = &self.0 {
			f(event);
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
	#[error("bind failed: {0}")]
	Bind(#[from] io::Error),
	#[error(transparent)]
	Tls(#[from] TlsError),
}

pub struct RpcServer {
	cfg: Arc<ServerConfig>,
	listener: TcpListener,
	router: Router,
	broker: Arc<Broker>,
	tls: Option<TlsAcceptor>,
	events: EventSink,
	closer: Closer,
}

impl RpcServer {
	/// Bind the listener and load TLS material. The server does not accept
	/// until [`run`](Self::run).
	pub fn bind(cfg: ServerConfig) -> Result<Self, ServerError> {
		let listener = transport::listen(cfg.port)?;
		let tls = cfg.tls.as_ref().map(tls::acceptor).transpose()?;
		Ok(RpcServer {
			cfg: Arc::new(cfg),
			listener,
			router: Router::default(),
			broker: Arc::new(Broker::default()),
			tls,
			events: EventSink::default(),
			closer: Closer::new(),
		})
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Register a request/response method; see [`Router::register`].
	pub fn register<A, R, F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegisterError>
	where
		A: DeserializeOwned + Send + 'static,
		R: Serialize + Send + 'static,
		F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
	{
		self.router.register(name, handler)
	}

	/// Register a stream method; see [`Router::register_stream`].
	pub fn register_stream<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegisterError>
	where
		F: Fn(RpcStream) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		self.router.register_stream(name, handler)
	}

	pub fn on_event<F: Fn(ServerEvent) + Send + Sync + 'static>(&mut self, f: F) {
		self.events = EventSink(Some(Arc::new(f)));
	}

	/// Handle usable after `run` consumes the server: publishing and
	/// shutdown.
	pub fn handle(&self) -> ServerHandle {
		ServerHandle {
			broker: self.broker.clone(),
			closer: self.closer.clone(),
			events: self.events.clone(),
		}
	}

	/// Accept connections until shutdown. Accept errors are transient (fd
	/// pressure, aborted handshakes) and do not stop the server.
	pub async fn run(self) -> io::Result<()> {
		let RpcServer {
			cfg,
			listener,
			router,
			broker,
			tls,
			events,
			closer,
		} = self;
		let router = Arc::new(router);
		let addr = listener.local_addr()?;
		info!(%addr, "rpc server listening");
		let mut conn_seq: u64 = 0;
		loop {
			let accepted = tokio::select! {
				biased;
				_ = closer.closed() => break,
				accepted = listener.accept() => accepted,
			};
			match accepted {
				Ok((stream, _peer)) => {
					conn_seq += 1;
					let ctx = connection::ConnectionCtx {
						id: conn_seq,
						cfg: cfg.clone(),
						router: router.clone(),
						broker: broker.clone(),
						tls: tls.clone(),
						events: events.clone(),
						server_closer: closer.clone(),
					};
					tokio::spawn(connection::serve(stream, ctx));
				},
				Err(e) => {
					warn!(error = %e, "accept failed");
				},
			}
		}
		info!("rpc server stopped accepting");
		Ok(())
	}
}

/// Cloneable handle for application-side publish and shutdown.
#[derive(Clone)]
pub struct ServerHandle {
	broker: Arc<Broker>,
	closer: Closer,
	events: EventSink,
}

impl ServerHandle {
	/// Fan `value` out to every subscriber of `key`; returns how many
	/// subscribers were reached.
	pub fn publish<T: Serialize>(&self, key: &str, value: &T) -> Result<usize, RpcError> {
		let data = crate::payload::pack(value)?;
		match self.broker.publish_raw(key, &data)? {
			PublishOutcome::Delivered(n) => Ok(n),
			PublishOutcome::NoSuchTopic { any_subscribers } => {
				if any_subscribers {
					self.events.emit(ServerEvent::MisroutedPublish {
						key: key.to_string(),
					});
				}
				Ok(0)
			},
		}
	}

	pub fn shutdown(&self) {
		self.closer.close();
	}
}
