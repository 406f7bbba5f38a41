//! Configuration surface for servers, clients, and the forwarded legs of
//! the traffic proxy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::MAX_BODY_LEN;
use crate::proxy::registry::ProxyRegistry;
use crate::proxy::websocket::WsRouteTable;

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub port: u16,
	/// Close a connection that produced no complete read for this long.
	/// `Duration::ZERO` disables the check.
	pub idle_timeout: Duration,
	/// Request bodies above this are rejected with a `body too large` reply.
	pub max_body: u64,
	pub tls: Option<TlsServerConfig>,
	pub proxy: Option<ProxySetup>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			port: 0,
			idle_timeout: Duration::from_secs(30),
			max_body: MAX_BODY_LEN,
			tls: None,
			proxy: None,
		}
	}
}

impl ServerConfig {
	pub fn new(port: u16) -> Self {
		ServerConfig {
			port,
			..Default::default()
		}
	}

	pub fn idle_timeout(mut self, timeout: Duration) -> Self {
		self.idle_timeout = timeout;
		self
	}

	pub fn max_body(mut self, max_body: u64) -> Self {
		self.max_body = max_body;
		self
	}

	pub fn tls(mut self, tls: TlsServerConfig) -> Self {
		self.tls = Some(tls);
		self
	}

	pub fn proxy(mut self, proxy: ProxySetup) -> Self {
		self.proxy = Some(proxy);
		self
	}
}

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	/// When set, client certificates are required and verified against this
	/// CA bundle.
	pub client_ca_path: Option<PathBuf>,
	/// Refuse the plaintext fallback: connections whose first bytes are not
	/// a TLS ClientHello are closed.
	pub require_tls: bool,
}

impl TlsServerConfig {
	pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
		TlsServerConfig {
			cert_path: cert_path.into(),
			key_path: key_path.into(),
			client_ca_path: None,
			require_tls: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsLevel {
	#[default]
	None,
	/// Use TLS but accept any server certificate.
	Optional,
	/// Use TLS and verify the peer against the configured (or system) roots.
	Required,
}

#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
	pub level: TlsLevel,
	pub ca_path: Option<PathBuf>,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
}

impl ClientTlsConfig {
	pub fn required() -> Self {
		ClientTlsConfig {
			level: TlsLevel::Required,
			..Default::default()
		}
	}

	pub fn optional() -> Self {
		ClientTlsConfig {
			level: TlsLevel::Optional,
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
	pub delay: Duration,
	/// `None` retries forever.
	pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		ReconnectPolicy {
			delay: Duration::from_secs(1),
			max_retries: None,
		}
	}
}

/// Client-side traffic-proxy handshake: sent before anything else so the
/// server splices us through to the registered upstream.
#[derive(Debug, Clone)]
pub struct ProxyConnector {
	pub service: String,
	pub field: String,
	pub token: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub host: String,
	pub port: u16,
	pub connect_timeout: Duration,
	/// Default deadline for `call`; per-call overrides take precedence.
	pub call_timeout: Duration,
	pub reconnect: Option<ReconnectPolicy>,
	/// Two-strike idle policy period: first idle tick sends a heartbeat,
	/// second closes the connection.
	pub keepalive: Option<Duration>,
	pub tls: Option<ClientTlsConfig>,
	pub tcp_nodelay: bool,
	pub proxy: Option<ProxyConnector>,
}

impl ClientConfig {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		ClientConfig {
			host: host.into(),
			port,
			connect_timeout: Duration::from_secs(3),
			call_timeout: Duration::from_secs(5),
			reconnect: None,
			keepalive: None,
			tls: None,
			tcp_nodelay: true,
			proxy: None,
		}
	}

	pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
		self.reconnect = Some(policy);
		self
	}

	pub fn keepalive(mut self, period: Duration) -> Self {
		self.keepalive = Some(period);
		self
	}

	pub fn call_timeout(mut self, timeout: Duration) -> Self {
		self.call_timeout = timeout;
		self
	}

	pub fn connect_timeout(mut self, timeout: Duration) -> Self {
		self.connect_timeout = timeout;
		self
	}

	pub fn tls(mut self, tls: ClientTlsConfig) -> Self {
		self.tls = Some(tls);
		self
	}

	pub fn proxy(mut self, proxy: ProxyConnector) -> Self {
		self.proxy = Some(proxy);
		self
	}
}

/// SOCKS5 hop configuration for forwarded legs.
#[derive(Debug, Clone)]
pub struct Socks5ProxyConfig {
	pub host: String,
	pub port: String,
	pub username: Option<String>,
	pub password: Option<String>,
}

/// Options applied to the upstream leg of protocol-pipe forwards.
#[derive(Debug, Clone, Default)]
pub struct ForwardConfig {
	pub socks5: Option<Socks5ProxyConfig>,
	/// Upstream TLS material; a pipe request with `ssl_option=required`
	/// fails when this is absent.
	pub tls: Option<ClientTlsConfig>,
}

/// Enables the traffic proxy on a server: the registry answers masked proxy
/// requests, the route table answers WebSocket upgrades, and the forward
/// config shapes pipe-selected upstream legs.
#[derive(Clone)]
pub struct ProxySetup {
	pub registry: Arc<ProxyRegistry>,
	pub routes: Arc<WsRouteTable>,
	pub forward: ForwardConfig,
}

impl std::fmt::Debug for ProxySetup {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxySetup").finish_non_exhaustive()
	}
}

impl ProxySetup {
	pub fn new(registry: Arc<ProxyRegistry>) -> Self {
		ProxySetup {
			registry,
			routes: Arc::new(WsRouteTable::default()),
			forward: ForwardConfig::default(),
		}
	}

	pub fn forward(mut self, forward: ForwardConfig) -> Self {
		self.forward = forward;
		self
	}

	pub fn routes(mut self, routes: Arc<WsRouteTable>) -> Self {
		self.routes = routes;
		self
	}
}
