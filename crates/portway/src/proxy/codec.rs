//! The masked traffic-proxy request frame:
//! `magic(1) payload_len(4) check_sum(4) mask(4) service_len(4) field_len(4)
//! token_len(4) service field token`, all lengths little-endian. The payload
//! after `check_sum`/`mask` is XOR-masked; the checksum accumulator starts
//! at zero and must return to zero after unmasking.

use crate::codec::PROXY_MAGIC;

/// magic + payload_len.
pub const PROXY_HEADER_LEN: usize = 5;
pub const MAX_PROXY_PAYLOAD: usize = 32 * 1024;
/// Smallest well-formed frame: empty service/field/token.
pub const MIN_PROXY_FRAME: usize = 1 + 4 * 6;
/// Server → client acknowledgement after a successful handoff.
pub const VERIFY_OK: &[u8; 2] = b"ok";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
	pub service: String,
	pub field: String,
	pub token: String,
}

impl ProxyRequest {
	pub fn new(
		service: impl Into<String>,
		token: impl Into<String>,
		field: impl Into<String>,
	) -> Self {
		ProxyRequest {
			service: service.into(),
			token: token.into(),
			field: field.into(),
		}
	}

	pub fn peek_len(buf: &[u8; 4]) -> u32 {
		u32::from_le_bytes(*buf)
	}

	pub fn encode(&self) -> Vec<u8> {
		let service = self.service.as_bytes();
		let field = self.field.as_bytes();
		let token = self.token.as_bytes();
		let payload_len = 4 * 5 + service.len() + field.len() + token.len();
		let mut buf = Vec::with_capacity(PROXY_HEADER_LEN + payload_len);
		buf.push(PROXY_MAGIC);
		buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
		buf.extend_from_slice(&[0u8; 4]); // check_sum, filled below
		let mask: [u8; 4] = rand::random();
		buf.extend_from_slice(&mask);
		buf.extend_from_slice(&(service.len() as u32).to_le_bytes());
		buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
		buf.extend_from_slice(&(token.len() as u32).to_le_bytes());
		buf.extend_from_slice(service);
		buf.extend_from_slice(field);
		buf.extend_from_slice(token);

		let data_start = PROXY_HEADER_LEN + 8;
		for i in 0..buf.len() - data_start {
			let b = buf[data_start + i];
			buf[PROXY_HEADER_LEN + (i % 4)] ^= b;
			buf[data_start + i] = b ^ mask[i % 4];
		}
		buf
	}

	/// Decode a complete frame, magic byte included.
	pub fn decode(buf: &[u8]) -> Option<ProxyRequest> {
		if buf.len() < MIN_PROXY_FRAME || buf[0] != PROXY_MAGIC {
			return None;
		}
		let payload_len = Self::peek_len(buf[1..5].try_into().expect("4 bytes")) as usize;
		if payload_len < 4 * 5 || buf.len() < PROXY_HEADER_LEN + payload_len {
			return None;
		}
		let mut check = [0u8; 4];
		check.copy_from_slice(&buf[5..9]);
		let mask = &buf[9..13];
		let data_len = payload_len - 8;
		let mut data = buf[13..13 + data_len].to_vec();
		for (i, b) in data.iter_mut().enumerate() {
			*b ^= mask[i % 4];
			check[i % 4] ^= *b;
		}
		if check != [0u8; 4] {
			return None;
		}
		let service_len = Self::peek_len(data[0..4].try_into().expect("4 bytes")) as usize;
		let field_len = Self::peek_len(data[4..8].try_into().expect("4 bytes")) as usize;
		let token_len = Self::peek_len(data[8..12].try_into().expect("4 bytes")) as usize;
		if service_len + field_len + token_len + 12 != data_len {
			return None;
		}
		let mut offset = 12;
		let mut take = |len: usize| {
			let s = String::from_utf8_lossy(&data[offset..offset + len]).into_owned();
			offset += len;
			s
		};
		let service = take(service_len);
		let field = take(field_len);
		let token = take(token_len);
		Some(ProxyRequest {
			service,
			field,
			token,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_round_trip() {
		let req = ProxyRequest::new("rpc_service", "rpc_token", "rpc_field");
		let buf = req.encode();
		assert_eq!(buf[0], PROXY_MAGIC);
		assert_eq!(ProxyRequest::decode(&buf).unwrap(), req);
	}

	#[test]
	fn empty_fields_round_trip() {
		let req = ProxyRequest::new("", "", "");
		let buf = req.encode();
		assert_eq!(buf.len(), MIN_PROXY_FRAME);
		assert_eq!(ProxyRequest::decode(&buf).unwrap(), req);
	}

	#[test]
	fn corrupted_checksum_is_rejected() {
		let mut buf = ProxyRequest::new("svc", "tok", "fld").encode();
		let last = buf.len() - 1;
		buf[last] ^= 0xff;
		assert!(ProxyRequest::decode(&buf).is_none());
	}

	#[test]
	fn truncated_frame_is_rejected() {
		let buf = ProxyRequest::new("svc", "tok", "fld").encode();
		assert!(ProxyRequest::decode(&buf[..buf.len() - 1]).is_none());
		assert!(ProxyRequest::decode(&buf[..4]).is_none());
	}

	#[test]
	fn payload_is_masked_on_the_wire() {
		let buf = ProxyRequest::new("secret_service", "t", "f").encode();
		let wire = &buf[PROXY_HEADER_LEN + 8..];
		// the service name must not appear in clear
		assert!(!wire
			.windows(b"secret_service".len())
			.any(|w| w == b"secret_service"));
	}
}
