//! Fixed 18-byte frame header shared by every RPC-mode connection, and the
//! method-name hash both peers must agree on.

use md5::{Digest, Md5};

/// First byte of every RPC frame.
pub const RPC_MAGIC: u8 = 0x27;
/// First byte of a traffic-proxy request.
pub const PROXY_MAGIC: u8 = 0x28;
/// First byte of a protocol-pipe control frame.
pub const PIPE_MAGIC: u8 = b'*';
/// First byte of an HTTP GET, used by the WebSocket forwarding layer.
pub const WS_MAGIC: u8 = b'G';

/// magic(1) + req_type(1) + body_len(4) + req_id(8) + func_id(4).
pub const HEADER_LEN: usize = 18;

/// Hard ceiling for `body_len`. Deployments usually configure something far
/// smaller via [`crate::config::ServerConfig::max_body`].
pub const MAX_BODY_LEN: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
	Req = 0,
	Subscribe = 1,
	Unsubscribe = 2,
	Publish = 3,
	Heartbeat = 4,
	Res = 5,
	Stream = 6,
}

impl RequestType {
	pub fn from_u8(v: u8) -> Option<RequestType> {
		Some(match v {
			0 => RequestType::Req,
			1 => RequestType::Subscribe,
			2 => RequestType::Unsubscribe,
			3 => RequestType::Publish,
			4 => RequestType::Heartbeat,
			5 => RequestType::Res,
			6 => RequestType::Stream,
			_ => return None,
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
	pub req_type: RequestType,
	pub body_len: u32,
	pub req_id: u64,
	pub func_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
	#[error("bad frame magic {0:#04x}")]
	BadMagic(u8),
	#[error("bad request type {0}")]
	BadType(u8),
}

impl FrameHeader {
	pub fn new(req_type: RequestType, body_len: u32, req_id: u64, func_id: u32) -> Self {
		FrameHeader {
			req_type,
			body_len,
			req_id,
			func_id,
		}
	}

	pub fn encode(&self) -> [u8; HEADER_LEN] {
		let mut buf = [0u8; HEADER_LEN];
		buf[0] = RPC_MAGIC;
		buf[1] = self.req_type as u8;
		buf[2..6].copy_from_slice(&self.body_len.to_le_bytes());
		buf[6..14].copy_from_slice(&self.req_id.to_le_bytes());
		buf[14..18].copy_from_slice(&self.func_id.to_le_bytes());
		buf
	}

	pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<FrameHeader, FrameError> {
		if buf[0] != RPC_MAGIC {
			return Err(FrameError::BadMagic(buf[0]));
		}
		let req_type = RequestType::from_u8(buf[1]).ok_or(FrameError::BadType(buf[1]))?;
		Ok(FrameHeader {
			req_type,
			body_len: u32::from_le_bytes(buf[2..6].try_into().expect("4 bytes")),
			req_id: u64::from_le_bytes(buf[6..14].try_into().expect("8 bytes")),
			func_id: u32::from_le_bytes(buf[14..18].try_into().expect("4 bytes")),
		})
	}
}

/// Stable 32-bit id for a method name: the first four bytes of the MD5
/// digest, little-endian. Part of the wire contract; registration rejects
/// collisions so the truncation is safe in practice.
pub fn method_id(name: &str) -> u32 {
	let digest = Md5::digest(name.as_bytes());
	u32::from_le_bytes(digest[0..4].try_into().expect("md5 is 16 bytes"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_round_trip() {
		for (req_type, body_len, req_id, func_id) in [
			(RequestType::Req, 0u32, 1u64, method_id("add")),
			(RequestType::Subscribe, 17, u64::MAX, 0),
			(RequestType::Publish, u32::MAX, 0, u32::MAX),
			(RequestType::Heartbeat, 0, 0, 0),
			(RequestType::Res, 1024, 42, method_id("translate")),
			(RequestType::Stream, 0, 7, method_id("echo_stream")),
		] {
			let h = FrameHeader::new(req_type, body_len, req_id, func_id);
			assert_eq!(FrameHeader::decode(&h.encode()), Ok(h));
		}
	}

	#[test]
	fn header_is_little_endian() {
		let h = FrameHeader::new(RequestType::Req, 0x0102_0304, 0x1122_3344_5566_7788, 0xAABB_CCDD);
		let buf = h.encode();
		assert_eq!(buf[0], RPC_MAGIC);
		assert_eq!(&buf[2..6], &[0x04, 0x03, 0x02, 0x01]);
		assert_eq!(&buf[6..14], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
		assert_eq!(&buf[14..18], &[0xDD, 0xCC, 0xBB, 0xAA]);
	}

	#[test]
	fn rejects_foreign_magic() {
		let mut buf = FrameHeader::new(RequestType::Req, 0, 1, 2).encode();
		buf[0] = PROXY_MAGIC;
		assert_eq!(FrameHeader::decode(&buf), Err(FrameError::BadMagic(PROXY_MAGIC)));
		buf[0] = RPC_MAGIC;
		buf[1] = 9;
		assert_eq!(FrameHeader::decode(&buf), Err(FrameError::BadType(9)));
	}

	#[test]
	fn method_id_is_stable_across_calls() {
		assert_eq!(method_id("add"), method_id("add"));
		assert_ne!(method_id("add"), method_id("sub"));
	}
}
