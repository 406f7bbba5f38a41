use std::io;

/// Failure classes visible on the wire and in the user API. Transport
/// problems collapse into `BrokenPipe`; everything a peer reports comes back
/// as `Failed` with the peer's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum RpcErrorKind {
	#[error("failed")]
	Failed,
	#[error("timeout")]
	Timeout,
	#[error("broken pipe")]
	BrokenPipe,
	#[error("pack failed")]
	PackFailed,
	#[error("unpack failed")]
	UnpackFailed,
	#[error("internal error")]
	Internal,
	#[error("bad request")]
	BadRequest,
	#[error("memory error")]
	MemoryError,
}

fn render(kind: &RpcErrorKind, message: &Option<String>) -> String {
	match message {
		Some(message) => format!("{kind}: {message}"),
		None => kind.to_string(),
	}
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", render(.kind, .message))]
pub struct RpcError {
	kind: RpcErrorKind,
	message: Option<String>,
}

impl RpcError {
	pub fn new(kind: RpcErrorKind) -> Self {
		RpcError {
			kind,
			message: None,
		}
	}

	pub fn with_message(kind: RpcErrorKind, message: impl Into<String>) -> Self {
		RpcError {
			kind,
			message: Some(message.into()),
		}
	}

	pub fn failed(message: impl Into<String>) -> Self {
		Self::with_message(RpcErrorKind::Failed, message)
	}

	pub fn timeout() -> Self {
		Self::new(RpcErrorKind::Timeout)
	}

	pub fn broken_pipe() -> Self {
		Self::new(RpcErrorKind::BrokenPipe)
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::with_message(RpcErrorKind::BadRequest, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::with_message(RpcErrorKind::Internal, message)
	}

	pub fn kind(&self) -> RpcErrorKind {
		self.kind
	}

	pub fn message(&self) -> Option<&str> {
		self.message.as_deref()
	}

	pub fn is_timeout(&self) -> bool {
		self.kind == RpcErrorKind::Timeout
	}
}

impl From<io::Error> for RpcError {
	fn from(e: io::Error) -> Self {
		let kind = match e.kind() {
			io::ErrorKind::TimedOut => RpcErrorKind::Timeout,
			io::ErrorKind::OutOfMemory => RpcErrorKind::MemoryError,
			_ => RpcErrorKind::BrokenPipe,
		};
		RpcError::with_message(kind, e.to_string())
	}
}

impl From<tokio::time::error::Elapsed> for RpcError {
	fn from(_: tokio::time::error::Elapsed) -> Self {
		RpcError::timeout()
	}
}
