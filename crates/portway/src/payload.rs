//! Msgpack payload seam. The framing layer treats every body as opaque
//! bytes; this module is the only place that knows the encoding.
//!
//! Replies are enveloped as `(code, value)` with `code == 0` for success and
//! `code == 1` carrying a failure message instead of a value. Publish bodies
//! nest the user payload as a msgpack byte blob so brokers can fan it out
//! without understanding it.

use bytes::Bytes;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use serde_bytes::ByteBuf;

use crate::errors::{RpcError, RpcErrorKind};

pub const CODE_OK: i32 = 0;
pub const CODE_FAIL: i32 = 1;

pub fn pack<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, RpcError> {
	rmp_serde::to_vec(value)
		.map(Bytes::from)
		.map_err(|e| RpcError::with_message(RpcErrorKind::PackFailed, e.to_string()))
}

pub fn unpack<T: DeserializeOwned>(data: &[u8]) -> Result<T, RpcError> {
	rmp_serde::from_slice(data)
		.map_err(|e| RpcError::with_message(RpcErrorKind::UnpackFailed, e.to_string()))
}

/// Decode call arguments. A zero-length body stands for "no arguments" and
/// decodes as msgpack nil, so unit-argument handlers accept it.
pub fn unpack_args<T: DeserializeOwned>(data: &[u8]) -> Result<T, RpcError> {
	if data.is_empty() {
		const NIL: [u8; 1] = [0xc0];
		return unpack(&NIL);
	}
	unpack(data)
}

pub fn pack_ok<T: Serialize>(value: &T) -> Result<Bytes, RpcError> {
	pack(&(CODE_OK, value))
}

/// Failure envelopes carry only a message; encoding a `(i32, &str)` tuple
/// cannot fail.
pub fn pack_fail(message: &str) -> Bytes {
	pack(&(CODE_FAIL, message)).expect("(i32, str) always packs")
}

/// The `(ok, "")` envelope used for acknowledgement-only replies.
pub fn pack_ok_empty() -> Bytes {
	pack(&(CODE_OK, "")).expect("(i32, str) always packs")
}

/// Decode a reply envelope into the caller's expected type.
pub fn parse_reply<T: DeserializeOwned>(body: &[u8]) -> Result<T, RpcError> {
	let (code, IgnoredAny) = unpack::<(i32, IgnoredAny)>(body)?;
	if code == CODE_OK {
		let (_, value) = unpack::<(i32, T)>(body)?;
		return Ok(value);
	}
	let message = unpack::<(i32, String)>(body)
		.map(|(_, msg)| msg)
		.unwrap_or_default();
	Err(RpcError::with_message(RpcErrorKind::Failed, message))
}

/// Client → server publish body: `(key, raw-bytes)`.
pub fn pack_publish(key: &str, data: &[u8]) -> Result<Bytes, RpcError> {
	pack(&(key, serde_bytes::Bytes::new(data)))
}

pub fn unpack_publish(body: &[u8]) -> Result<(String, Vec<u8>), RpcError> {
	let (key, data) = unpack::<(String, ByteBuf)>(body)?;
	Ok((key, data.into_vec()))
}

/// Server → subscriber fan-out body: `(code, key, raw-bytes)`.
pub fn pack_fanout(key: &str, data: &[u8]) -> Result<Bytes, RpcError> {
	pack(&(CODE_OK, key, serde_bytes::Bytes::new(data)))
}

pub fn unpack_fanout(body: &[u8]) -> Result<(i32, String, Vec<u8>), RpcError> {
	let (code, key, data) = unpack::<(i32, String, ByteBuf)>(body)?;
	Ok((code, key, data.into_vec()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reply_envelope_round_trip() {
		let ok = pack_ok(&3i32).unwrap();
		assert_eq!(parse_reply::<i32>(&ok).unwrap(), 3);

		let fail = pack_fail("handler blew up");
		let err = parse_reply::<i32>(&fail).unwrap_err();
		assert_eq!(err.kind(), RpcErrorKind::Failed);
		assert_eq!(err.message(), Some("handler blew up"));
	}

	#[test]
	fn reply_type_mismatch_is_unpack_failed() {
		let ok = pack_ok(&"text").unwrap();
		let err = parse_reply::<i32>(&ok).unwrap_err();
		assert_eq!(err.kind(), RpcErrorKind::UnpackFailed);
	}

	#[test]
	fn empty_args_decode_as_unit() {
		assert!(unpack_args::<()>(&[]).is_ok());
		assert_eq!(unpack_args::<Option<i32>>(&[]).unwrap(), None);
	}

	#[test]
	fn publish_bodies_nest_opaque_bytes() {
		let inner = pack(&("hello", 5u32)).unwrap();
		let body = pack_publish("topic", &inner).unwrap();
		let (key, data) = unpack_publish(&body).unwrap();
		assert_eq!(key, "topic");
		assert_eq!(unpack::<(String, u32)>(&data).unwrap(), ("hello".to_string(), 5));

		let fanned = pack_fanout(&key, &data).unwrap();
		let (code, key2, data2) = unpack_fanout(&fanned).unwrap();
		assert_eq!(code, CODE_OK);
		assert_eq!(key2, "topic");
		assert_eq!(data2, data);
	}
}
