//! Socket plumbing shared by the server, the client, and the proxy legs: a
//! rewindable stream (sniffed bytes are never lost), a unified plain/TLS
//! socket type, and the dual-stack listener.

pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsStream;

pin_project! {
	/// Combines a pre-read buffer with an IO object; reads drain the buffer
	/// first. Protocol sniffing reads a few bytes and rewinds them here so the
	/// next layer observes the stream from byte zero.
	#[derive(Debug)]
	pub struct Rewind<T> {
		pre: Option<Bytes>,
		#[pin]
		inner: T,
	}
}

impl<T> Rewind<T> {
	pub fn new(inner: T) -> Self {
		Rewind { pre: None, inner }
	}

	pub fn new_buffered(inner: T, pre: Bytes) -> Self {
		Rewind {
			pre: if pre.is_empty() { None } else { Some(pre) },
			inner,
		}
	}

	pub fn rewind(&mut self, pre: Bytes) {
		debug_assert!(self.pre.is_none());
		if !pre.is_empty() {
			self.pre = Some(pre);
		}
	}

	pub fn get_ref(&self) -> &T {
		&self.inner
	}
}

impl<T: AsyncRead> AsyncRead for Rewind<T> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.project();
		if let Some(mut pre) = this.pre.take() {
			if !pre.is_empty() {
				let n = std::cmp::min(pre.len(), buf.remaining());
				buf.put_slice(&pre[..n]);
				pre.advance(n);
				if !pre.is_empty() {
					*this.pre = Some(pre);
				}
				return Poll::Ready(Ok(()));
			}
		}
		this.inner.poll_read(cx, buf)
	}
}

impl<T: AsyncWrite> AsyncWrite for Rewind<T> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		self.project().inner.poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[io::IoSlice<'_>],
	) -> Poll<io::Result<usize>> {
		self.project().inner.poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}

/// One socket, possibly wrapped in TLS. Every connection role (RPC server
/// side, RPC client side, proxied upstream leg) runs over this type.
pub enum Io {
	Plain(Rewind<TcpStream>),
	Tls(Box<TlsStream<Rewind<TcpStream>>>),
}

impl Io {
	pub fn plain(stream: TcpStream) -> Self {
		Io::Plain(Rewind::new(stream))
	}

	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		match self {
			Io::Plain(s) => s.get_ref().peer_addr(),
			Io::Tls(s) => s.get_ref().0.get_ref().peer_addr(),
		}
	}

	pub fn is_tls(&self) -> bool {
		matches!(self, Io::Tls(_))
	}
}

impl AsyncRead for Io {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Io::Plain(s) => Pin::new(s).poll_read(cx, buf),
			Io::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Io {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.get_mut() {
			Io::Plain(s) => Pin::new(s).poll_write(cx, buf),
			Io::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Io::Plain(s) => Pin::new(s).poll_flush(cx),
			Io::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Io::Plain(s) => Pin::new(s).poll_shutdown(cx),
			Io::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

/// Bind the shared listener: a v6 socket with `v6_only` off so one acceptor
/// serves both address families. Hosts without IPv6 get a v4 listener.
pub fn listen(port: u16) -> io::Result<TcpListener> {
	match listen_dual_stack(port) {
		Ok(listener) => Ok(listener),
		Err(e) => {
			tracing::debug!(error = %e, "dual-stack bind failed, binding v4 only");
			listen_v4(port)
		},
	}
}

fn listen_dual_stack(port: u16) -> io::Result<TcpListener> {
	use socket2::{Domain, Protocol, Socket, Type};

	let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
	socket.set_only_v6(false)?;
	socket.set_reuse_address(true)?;
	let addr: SocketAddr = format!("[::]:{port}").parse().expect("valid wildcard addr");
	socket.bind(&addr.into())?;
	socket.listen(1024)?;
	socket.set_nonblocking(true)?;
	TcpListener::from_std(socket.into())
}

fn listen_v4(port: u16) -> io::Result<TcpListener> {
	use socket2::{Domain, Protocol, Socket, Type};

	let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
	socket.set_reuse_address(true)?;
	let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid wildcard addr");
	socket.bind(&addr.into())?;
	socket.listen(1024)?;
	socket.set_nonblocking(true)?;
	TcpListener::from_std(socket.into())
}

/// Open the upstream leg of a forward. `service` must be a numeric port.
pub async fn dial(host: &str, service: &str) -> io::Result<TcpStream> {
	let port: u16 = service
		.parse()
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad service port {service:?}")))?;
	let stream = TcpStream::connect((host, port)).await?;
	stream.set_nodelay(true)?;
	Ok(stream)
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn rewind_serves_prefix_before_inner() {
		let (client, mut server) = tokio::io::duplex(64);
		server.write_all(b" world").await.unwrap();

		let mut rw = Rewind::new_buffered(client, Bytes::from_static(b"hello"));
		let mut out = [0u8; 5];
		rw.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"hello");
		let mut rest = [0u8; 6];
		rw.read_exact(&mut rest).await.unwrap();
		assert_eq!(&rest, b" world");
	}

	#[tokio::test]
	async fn rewind_partial_reads() {
		let (client, _server) = tokio::io::duplex(64);
		let mut rw = Rewind::new_buffered(client, Bytes::from_static(b"abcd"));
		let mut one = [0u8; 1];
		rw.read_exact(&mut one).await.unwrap();
		assert_eq!(&one, b"a");
		let mut three = [0u8; 3];
		rw.read_exact(&mut three).await.unwrap();
		assert_eq!(&three, b"bcd");
	}

	#[tokio::test]
	async fn listener_accepts_v4_and_v6() {
		let listener = listen(0).unwrap();
		let addr = listener.local_addr().unwrap();
		let dual_stack = addr.is_ipv6();
		let port = addr.port();

		let expected = if dual_stack { 2 } else { 1 };
		let accept = tokio::spawn(async move {
			for _ in 0..expected {
				let (sock, _) = listener.accept().await.unwrap();
				drop(sock);
			}
		});
		TcpStream::connect(("127.0.0.1", port)).await.unwrap();
		if dual_stack {
			TcpStream::connect(("::1", port)).await.unwrap();
		}
		accept.await.unwrap();
	}
}
