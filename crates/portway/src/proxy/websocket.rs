//! WebSocket upgrade plumbing for forwarded connections: the client-side
//! HTTP/1.1 upgrade used on pipe-selected legs, and the server side that
//! answers upgrades against a dynamic route table and splices to the routed
//! upstream. Only the handshake is WebSocket; after 101 the tunnel carries
//! raw bytes.

use std::collections::HashMap;
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proxy::registry::UpstreamAddr;

pub(crate) const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HTTP_HEAD: usize = 64 * 1024;
const WS_VERSION: &str = "13";

/// `route_path → upstream` table behind the WebSocket forwarding layer.
/// Routes are installed at runtime by `add_server` pipe requests.
#[derive(Default)]
pub struct WsRouteTable {
	inner: RwLock<HashMap<String, UpstreamAddr>>,
}

impl WsRouteTable {
	pub fn add_route(&self, path: impl Into<String>, upstream: UpstreamAddr) {
		self
			.inner
			.write()
			.expect("route lock")
			.insert(path.into(), upstream);
	}

	pub fn lookup(&self, path: &str) -> Option<UpstreamAddr> {
		self.inner.read().expect("route lock").get(path).cloned()
	}
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
	#[error("websocket io: {0}")]
	Io(#[from] std::io::Error),
	#[error("http head larger than {MAX_HTTP_HEAD} bytes")]
	HeadTooLarge,
	#[error("malformed http: {0}")]
	Malformed(&'static str),
	#[error("upgrade refused: {0}")]
	Refused(String),
	#[error("no route for path {0:?}")]
	NoRoute(String),
	#[error("Sec-WebSocket-Accept mismatch")]
	BadAccept,
}

pub(crate) fn session_key() -> String {
	let seed: [u8; 16] = rand::random();
	BASE64.encode(seed)
}

pub(crate) fn accept_key(session_key: &str) -> String {
	let mut sha = Sha1::new();
	sha.update(session_key.as_bytes());
	sha.update(WS_GUID.as_bytes());
	BASE64.encode(sha.finalize())
}

struct HttpHead {
	start_line: String,
	headers: HashMap<String, String>,
}

impl HttpHead {
	fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
	}
}

/// Read one HTTP head (through `\r\n\r\n`). `prefix` holds bytes already
/// consumed by protocol detection.
async fn read_http_head<S>(io: &mut S, prefix: &[u8]) -> Result<HttpHead, WsError>
where
	S: AsyncRead + Unpin,
{
	let mut buf = prefix.to_vec();
	let mut chunk = [0u8; 1024];
	while !contains_head_end(&buf) {
		if buf.len() > MAX_HTTP_HEAD {
			return Err(WsError::HeadTooLarge);
		}
		let n = io.read(&mut chunk).await?;
		if n == 0 {
			return Err(WsError::Malformed("eof before end of head"));
		}
		buf.extend_from_slice(&chunk[..n]);
	}
	let end = find_head_end(&buf).expect("checked above");
	let head = std::str::from_utf8(&buf[..end]).map_err(|_| WsError::Malformed("head is not utf-8"))?;

	let mut lines = head.split("\r\n");
	let start_line = lines.next().unwrap_or("").to_string();
	if start_line.is_empty() {
		return Err(WsError::Malformed("empty start line"));
	}
	let mut headers = HashMap::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let (name, value) = line.split_once(':').ok_or(WsError::Malformed("header without colon"))?;
		headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
	}
	Ok(HttpHead {
		start_line,
		headers,
	})
}

fn contains_head_end(buf: &[u8]) -> bool {
	find_head_end(buf).is_some()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Client half of the upgrade: send the GET, verify `101` and the accept
/// key.
pub(crate) async fn client_upgrade<S>(io: &mut S, path: &str, host: &str) -> Result<(), WsError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let key = session_key();
	let request = format!(
		"GET {path} HTTP/1.1\r\n\
		 Host: {host}\r\n\
		 Upgrade: websocket\r\n\
		 Connection: Upgrade\r\n\
		 Sec-WebSocket-Key: {key}\r\n\
		 Sec-WebSocket-Version: {WS_VERSION}\r\n\r\n"
	);
	io.write_all(request.as_bytes()).await?;
	io.flush().await?;

	let head = read_http_head(io, &[]).await?;
	let mut parts = head.start_line.split_whitespace();
	let version = parts.next().unwrap_or("");
	let status = parts.next().unwrap_or("");
	if !version.starts_with("HTTP/") {
		return Err(WsError::Malformed("not an http response"));
	}
	if status != "101" {
		return Err(WsError::Refused(head.start_line.clone()));
	}
	let accept = head.header("sec-websocket-accept").unwrap_or("");
	if accept != accept_key(&key) {
		return Err(WsError::BadAccept);
	}
	Ok(())
}

/// Server half: parse the upgrade request (whose first bytes live in
/// `prefix`), resolve the path against the route table, answer `101`, and
/// hand back the routed upstream. Failures answer `400` before erroring.
pub(crate) async fn serve_upgrade<S>(
	io: &mut S,
	routes: &WsRouteTable,
	prefix: &[u8],
) -> Result<UpstreamAddr, WsError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	match try_serve_upgrade(io, routes, prefix).await {
		Ok(upstream) => Ok(upstream),
		Err(e) => {
			let _ = io
				.write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
				.await;
			Err(e)
		},
	}
}

async fn try_serve_upgrade<S>(
	io: &mut S,
	routes: &WsRouteTable,
	prefix: &[u8],
) -> Result<UpstreamAddr, WsError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let head = read_http_head(io, prefix).await?;
	let mut parts = head.start_line.split_whitespace();
	let method = parts.next().unwrap_or("");
	let path = parts.next().unwrap_or("");
	if method != "GET" {
		return Err(WsError::Malformed("upgrade must be GET"));
	}
	if !head
		.header("upgrade")
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false)
	{
		return Err(WsError::Malformed("missing Upgrade: websocket"));
	}
	let key = head
		.header("sec-websocket-key")
		.ok_or(WsError::Malformed("missing Sec-WebSocket-Key"))?;
	let upstream = routes.lookup(path).ok_or_else(|| WsError::NoRoute(path.to_string()))?;

	let response = format!(
		"HTTP/1.1 101 Switching Protocols\r\n\
		 Upgrade: websocket\r\n\
		 Connection: Upgrade\r\n\
		 Sec-WebSocket-Accept: {}\r\n\r\n",
		accept_key(key)
	);
	io.write_all(response.as_bytes()).await?;
	io.flush().await?;
	Ok(upstream)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accept_key_matches_rfc_example() {
		// the sample handshake from RFC 6455 §1.3
		assert_eq!(
			accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
			"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
		);
	}

	#[tokio::test]
	async fn upgrade_round_trip_through_route_table() {
		let routes = WsRouteTable::default();
		routes.add_route("/tunnel", UpstreamAddr::new("10.0.0.9", "9000"));

		let (mut client, mut server) = tokio::io::duplex(4096);
		let server_task = tokio::spawn(async move {
			let mut first = [0u8; 1];
			server.read_exact(&mut first).await.unwrap();
			assert_eq!(first[0], b'G');
			serve_upgrade(&mut server, &routes, &first).await
		});

		client_upgrade(&mut client, "/tunnel", "10.0.0.9").await.unwrap();
		let upstream = server_task.await.unwrap().unwrap();
		assert_eq!(upstream, UpstreamAddr::new("10.0.0.9", "9000"));
	}

	#[tokio::test]
	async fn unknown_route_is_refused() {
		let routes = WsRouteTable::default();
		let (mut client, mut server) = tokio::io::duplex(4096);
		let server_task =
			tokio::spawn(async move { serve_upgrade(&mut server, &routes, &[]).await });

		let err = client_upgrade(&mut client, "/nowhere", "h").await.unwrap_err();
		assert!(matches!(err, WsError::Refused(_)));
		assert!(matches!(server_task.await.unwrap(), Err(WsError::NoRoute(_))));
	}
}
