//! portway — an asynchronous RPC framework over TCP whose single listener
//! also serves as a protocol-detecting traffic proxy.
//!
//! One multiplexed connection carries request/response calls,
//! publish/subscribe topics, and bidirectional typed streams; connections
//! whose first bytes are not RPC frames become proxied tunnels instead
//! (raw TCP forward, WebSocket-upgrade forward, SOCKS5-chained forward, TLS
//! pass-through, dynamic route registration). TLS and plaintext clients
//! share the port via a three-byte handshake sniff.

pub mod codec;
pub mod config;
pub mod errors;
pub mod payload;
pub mod proxy;
pub mod router;
pub mod transport;

mod client;
mod pubsub;
mod server;
mod stream;
mod wire;

pub use client::RpcClient;
pub use config::{
	ClientConfig, ClientTlsConfig, ForwardConfig, ProxyConnector, ProxySetup, ReconnectPolicy,
	ServerConfig, Socks5ProxyConfig, TlsLevel, TlsServerConfig,
};
pub use errors::{RpcError, RpcErrorKind};
pub use proxy::registry::{ProxyRegistry, ServiceEntry, UpstreamAddr};
pub use proxy::websocket::WsRouteTable;
pub use router::{CallContext, RegisterError, Responder, Router};
pub use server::{RpcServer, ServerError, ServerEvent, ServerHandle};
pub use stream::RpcStream;
