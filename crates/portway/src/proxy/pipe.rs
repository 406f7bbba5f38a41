//! Protocol-pipe control frames: `'*'` + four ASCII digits of payload
//! length + `key '#' vlen(4) value` items. A pipe session reads one request
//! frame, answers with a response frame, and either registers a route or
//! runs a forward pipeline.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::{ProxySetup, TlsLevel};
use crate::proxy::forward;
use crate::proxy::registry::UpstreamAddr;
use crate::transport::Io;

pub(crate) const PIPE_MAX_PAYLOAD: usize = 9999;
const LEN_DIGITS: usize = 4;
const SPLIT_CHAR: char = '#';

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
	#[error("pipe io: {0}")]
	Io(#[from] std::io::Error),
	#[error("malformed pipe frame: {0}")]
	Malformed(&'static str),
	#[error("pipe payload exceeds {PIPE_MAX_PAYLOAD} bytes")]
	TooLarge,
	#[error("unknown option value {0:?}")]
	BadValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardOption {
	Disabled,
	#[default]
	Optional,
	Required,
}

impl ForwardOption {
	fn as_str(&self) -> &'static str {
		match self {
			ForwardOption::Disabled => "disabled",
			ForwardOption::Optional => "optional",
			ForwardOption::Required => "required",
		}
	}

	fn parse(value: &str) -> Result<Self, PipeError> {
		Ok(match value {
			"disabled" => ForwardOption::Disabled,
			"optional" => ForwardOption::Optional,
			"required" => ForwardOption::Required,
			_ => return Err(PipeError::BadValue(value.to_string())),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardProtocol {
	Raw,
	#[default]
	Websocket,
	AddServer,
}

impl ForwardProtocol {
	fn as_str(&self) -> &'static str {
		match self {
			ForwardProtocol::Raw => "raw",
			ForwardProtocol::Websocket => "websocket",
			ForwardProtocol::AddServer => "add_server",
		}
	}

	fn parse(value: &str) -> Result<Self, PipeError> {
		Ok(match value {
			"raw" => ForwardProtocol::Raw,
			"websocket" => ForwardProtocol::Websocket,
			"add_server" => ForwardProtocol::AddServer,
			_ => return Err(PipeError::BadValue(value.to_string())),
		})
	}
}

/// The key spelling `forward_protocal` is what peers send; it is part of
/// the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipeRequest {
	pub socks5: ForwardOption,
	pub tls: ForwardOption,
	pub protocol: ForwardProtocol,
	pub dst_host: String,
	pub dst_service: String,
	pub route_path: String,
}

impl PipeRequest {
	pub fn encode(&self) -> Result<Vec<u8>, PipeError> {
		let mut payload = String::new();
		encode_item(&mut payload, "socks5_option", self.socks5.as_str())?;
		encode_item(&mut payload, "ssl_option", self.tls.as_str())?;
		encode_item(&mut payload, "forward_protocal", self.protocol.as_str())?;
		encode_item(&mut payload, "dst_host", &self.dst_host)?;
		encode_item(&mut payload, "dst_service", &self.dst_service)?;
		encode_item(&mut payload, "route_path", &self.route_path)?;
		frame(payload)
	}

	pub fn from_items(items: Vec<(String, String)>) -> Result<Self, PipeError> {
		let mut request = PipeRequest::default();
		for (key, value) in items {
			match key.as_str() {
				"socks5_option" => request.socks5 = ForwardOption::parse(&value)?,
				"ssl_option" => request.tls = ForwardOption::parse(&value)?,
				"forward_protocal" => request.protocol = ForwardProtocol::parse(&value)?,
				"dst_host" => request.dst_host = value,
				"dst_service" => request.dst_service = value,
				"route_path" => request.route_path = value,
				// forward compatibility: ignore options we do not know
				_ => {},
			}
		}
		Ok(request)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeResponse {
	pub code: i32,
	pub msg: String,
}

impl PipeResponse {
	pub const SUCCESS: i32 = 0;

	pub fn ok() -> Self {
		PipeResponse {
			code: Self::SUCCESS,
			msg: "success".to_string(),
		}
	}

	pub fn failed(msg: impl Into<String>) -> Self {
		PipeResponse {
			code: 1,
			msg: msg.into(),
		}
	}

	pub fn encode(&self) -> Result<Vec<u8>, PipeError> {
		let mut payload = String::new();
		encode_item(&mut payload, "code", &self.code.to_string())?;
		encode_item(&mut payload, "msg", &self.msg)?;
		frame(payload)
	}

	pub fn from_items(items: Vec<(String, String)>) -> Result<Self, PipeError> {
		let mut code = Self::SUCCESS;
		let mut msg = String::new();
		for (key, value) in items {
			match key.as_str() {
				"code" => {
					code = value
						.parse()
						.map_err(|_| PipeError::BadValue(value.clone()))?
				},
				"msg" => msg = value,
				_ => {},
			}
		}
		Ok(PipeResponse { code, msg })
	}
}

fn format_len(len: usize) -> Result<String, PipeError> {
	if len > PIPE_MAX_PAYLOAD {
		return Err(PipeError::TooLarge);
	}
	Ok(format!("{len:04}"))
}

fn encode_item(out: &mut String, key: &str, value: &str) -> Result<(), PipeError> {
	if key.contains(SPLIT_CHAR) {
		return Err(PipeError::Malformed("key contains split char"));
	}
	out.push_str(key);
	out.push(SPLIT_CHAR);
	out.push_str(&format_len(value.len())?);
	out.push_str(value);
	if out.len() > PIPE_MAX_PAYLOAD {
		return Err(PipeError::TooLarge);
	}
	Ok(())
}

fn frame(payload: String) -> Result<Vec<u8>, PipeError> {
	let mut out = Vec::with_capacity(1 + LEN_DIGITS + payload.len());
	out.push(crate::codec::PIPE_MAGIC);
	out.extend_from_slice(format_len(payload.len())?.as_bytes());
	out.extend_from_slice(payload.as_bytes());
	Ok(out)
}

fn parse_len(digits: &[u8]) -> Result<usize, PipeError> {
	let text = std::str::from_utf8(digits).map_err(|_| PipeError::Malformed("length not ascii"))?;
	if !text.bytes().all(|b| b.is_ascii_digit()) {
		return Err(PipeError::Malformed("length not numeric"));
	}
	Ok(text.parse().expect("digits parse"))
}

pub fn parse_items(payload: &str) -> Result<Vec<(String, String)>, PipeError> {
	let mut items = Vec::new();
	let mut pos = 0;
	let bytes = payload.as_bytes();
	while pos < bytes.len() {
		let rel = payload[pos..]
			.find(SPLIT_CHAR)
			.ok_or(PipeError::Malformed("item without split char"))?;
		let key = payload[pos..pos + rel].to_string();
		let value_len_start = pos + rel + 1;
		if value_len_start + LEN_DIGITS > bytes.len() {
			return Err(PipeError::Malformed("item length truncated"));
		}
		let value_len = parse_len(&bytes[value_len_start..value_len_start + LEN_DIGITS])?;
		let value_start = value_len_start + LEN_DIGITS;
		if value_start + value_len > bytes.len() {
			return Err(PipeError::Malformed("item value truncated"));
		}
		items.push((key, payload[value_start..value_start + value_len].to_string()));
		pos = value_start + value_len;
	}
	Ok(items)
}

/// Read one complete pipe frame. `magic_consumed` marks whether protocol
/// detection already took the `'*'`.
pub async fn read_pipe_frame<R>(
	rd: &mut R,
	magic_consumed: bool,
) -> Result<Vec<(String, String)>, PipeError>
where
	R: AsyncRead + Unpin,
{
	if !magic_consumed {
		let mut magic = [0u8; 1];
		rd.read_exact(&mut magic).await?;
		if magic[0] != crate::codec::PIPE_MAGIC {
			return Err(PipeError::Malformed("bad pipe magic"));
		}
	}
	let mut digits = [0u8; LEN_DIGITS];
	rd.read_exact(&mut digits).await?;
	let payload_len = parse_len(&digits)?;
	if payload_len == 0 || payload_len > PIPE_MAX_PAYLOAD {
		return Err(PipeError::Malformed("bad payload length"));
	}
	let mut payload = vec![0u8; payload_len];
	rd.read_exact(&mut payload).await?;
	let text = String::from_utf8(payload).map_err(|_| PipeError::Malformed("payload not utf-8"))?;
	parse_items(&text)
}

/// One protocol-pipe session: request in, response out, then either close
/// (`add_server`) or run the selected forward pipeline.
pub(crate) async fn serve_pipe(mut io: Io, setup: &ProxySetup) {
	let request = match read_pipe_frame(&mut io, true).await {
		Ok(items) => PipeRequest::from_items(items),
		Err(e) => {
			debug!(error = %e, "unreadable pipe frame");
			return;
		},
	};

	let (response, accepted) = match request {
		Ok(request) => match validate(&request, setup) {
			Ok(()) => (PipeResponse::ok(), Some(request)),
			Err(msg) => (PipeResponse::failed(msg), None),
		},
		Err(e) => (PipeResponse::failed(e.to_string()), None),
	};
	if response.code != PipeResponse::SUCCESS {
		warn!(msg = %response.msg, "refusing pipe request");
	}

	let Ok(encoded) = response.encode() else { return };
	if io.write_all(&encoded).await.is_err() {
		return;
	}
	let _ = AsyncWriteExt::flush(&mut io).await;

	let Some(request) = accepted else { return };
	match request.protocol {
		// the route was installed during validation; nothing to forward
		ForwardProtocol::AddServer => {},
		ForwardProtocol::Raw | ForwardProtocol::Websocket => {
			if let Err(e) = forward::run_forward(io, &request, setup).await {
				debug!(error = %e, "pipe forward ended");
			}
		},
	}
}

fn validate(request: &PipeRequest, setup: &ProxySetup) -> Result<(), String> {
	if request.dst_host.is_empty() || request.dst_service.is_empty() {
		return Err("invalid forward host information".to_string());
	}
	match request.protocol {
		ForwardProtocol::Websocket if request.route_path.is_empty() => {
			return Err("websocket forward needs a valid route path".to_string());
		},
		ForwardProtocol::AddServer if request.route_path.is_empty() => {
			return Err("add_server needs a valid route path".to_string());
		},
		_ => {},
	}
	if request.socks5 == ForwardOption::Required && setup.forward.socks5.is_none() {
		return Err("no socks5 proxy set".to_string());
	}
	let tls_available = setup
		.forward
		.tls
		.as_ref()
		.map(|t| t.level != TlsLevel::None)
		.unwrap_or(false);
	if request.tls == ForwardOption::Required && !tls_available {
		return Err("no ssl proxy enabled".to_string());
	}
	if request.protocol == ForwardProtocol::AddServer {
		setup.routes.add_route(
			request.route_path.clone(),
			UpstreamAddr::new(&request.dst_host, &request.dst_service),
		);
		info!(
			path = %request.route_path,
			host = %request.dst_host,
			service = %request.dst_service,
			"route registered"
		);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_round_trip() {
		let request = PipeRequest {
			socks5: ForwardOption::Disabled,
			tls: ForwardOption::Disabled,
			protocol: ForwardProtocol::Websocket,
			dst_host: "127.0.0.1".to_string(),
			dst_service: "9000".to_string(),
			route_path: "/tunnel".to_string(),
		};
		let buf = request.encode().unwrap();
		assert_eq!(buf[0], b'*');
		let len: usize = std::str::from_utf8(&buf[1..5]).unwrap().parse().unwrap();
		assert_eq!(len, buf.len() - 5);

		let items = parse_items(std::str::from_utf8(&buf[5..]).unwrap()).unwrap();
		assert_eq!(PipeRequest::from_items(items).unwrap(), request);
	}

	#[test]
	fn response_round_trip() {
		let response = PipeResponse::failed("no socks5 proxy set");
		let buf = response.encode().unwrap();
		let items = parse_items(std::str::from_utf8(&buf[5..]).unwrap()).unwrap();
		assert_eq!(PipeResponse::from_items(items).unwrap(), response);
	}

	#[test]
	fn unknown_keys_are_ignored() {
		let items = vec![
			("future_option".to_string(), "x".to_string()),
			("dst_host".to_string(), "h".to_string()),
		];
		let request = PipeRequest::from_items(items).unwrap();
		assert_eq!(request.dst_host, "h");
	}

	#[test]
	fn bad_option_value_is_rejected() {
		let items = vec![("ssl_option".to_string(), "maybe".to_string())];
		assert!(matches!(
			PipeRequest::from_items(items),
			Err(PipeError::BadValue(_))
		));
	}

	#[test]
	fn truncated_items_are_rejected() {
		assert!(parse_items("key#00").is_err());
		assert!(parse_items("key#0005ab").is_err());
		assert!(parse_items("keynovalue").is_err());
	}

	#[tokio::test]
	async fn read_frame_rejects_oversize_length() {
		let mut data: &[u8] = b"*abcd";
		assert!(matches!(
			read_pipe_frame(&mut data, true).await,
			Err(PipeError::Malformed(_))
		));
	}
}
