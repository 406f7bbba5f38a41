//! Full-duplex splice between a downstream and an upstream socket. Each
//! direction copies independently; when one side hits EOF its buffered data
//! is flushed to the other before that half is shut down, so no bytes are
//! lost on half-close.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Chunk granularity for the copy buffers.
const CHUNK_SIZE: usize = 32 * 1024;
/// Grow the buffer when less than this much contiguous space is left.
const MIN_READ_RESERVE: usize = 1200;

/// Copy in both directions until both sides are done. Returns bytes moved
/// `(a→b, b→a)`. Ungraceful peer teardown (reset, broken pipe) counts as a
/// normal end of stream, matching what users expect of a proxy.
pub(crate) async fn copy_bidirectional<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite,
	B: AsyncRead + AsyncWrite,
{
	let (mut ra, mut wa) = tokio::io::split(a);
	let (mut rb, mut wb) = tokio::io::split(b);

	let a_to_b = async {
		let copied = ignore_io_errors(copy_chunks(&mut ra, &mut wb).await)?;
		trace!(copied, "downstream to upstream done");
		ignore_shutdown_errors(wb.shutdown().await)?;
		Ok::<u64, io::Error>(copied)
	};
	let b_to_a = async {
		let copied = ignore_io_errors(copy_chunks(&mut rb, &mut wa).await)?;
		trace!(copied, "upstream to downstream done");
		ignore_shutdown_errors(wa.shutdown().await)?;
		Ok::<u64, io::Error>(copied)
	};

	// join, not try_join: one side finishing must not cancel the other's
	// drain
	let (sent, received) = tokio::join!(a_to_b, b_to_a);
	Ok((sent?, received?))
}

async fn copy_chunks<R, W>(rd: &mut R, wr: &mut W) -> io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
	let mut total = 0u64;
	loop {
		if buf.capacity() - buf.len() < MIN_READ_RESERVE {
			buf.reserve(CHUNK_SIZE);
		}
		let n = rd.read_buf(&mut buf).await?;
		if n == 0 {
			break;
		}
		let chunk = buf.split().freeze();
		wr.write_all(&chunk).await?;
		wr.flush().await?;
		total += chunk.len() as u64;
	}
	Ok(total)
}

/// A peer can reset at any time; that is not a proxy failure.
fn ignore_io_errors(res: io::Result<u64>) -> io::Result<u64> {
	use io::ErrorKind::*;
	match res {
		Err(e) if matches!(e.kind(), NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe) => {
			trace!(err = %e, "splice leg ended ungracefully");
			Ok(0)
		},
		other => other,
	}
}

/// The peer may have shut down for us already.
fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
	use io::ErrorKind::*;
	match res {
		Err(e) if matches!(e.kind(), NotConnected | UnexpectedEof | BrokenPipe) => Ok(()),
		other => other,
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::{TcpListener, TcpStream};

	use super::*;

	#[tokio::test]
	async fn buffered_bytes_survive_half_close() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		// echo upstream that doubles each byte then closes
		let upstream = tokio::spawn(async move {
			let (mut s, _) = listener.accept().await.unwrap();
			let mut buf = Vec::new();
			s.read_to_end(&mut buf).await.unwrap();
			let doubled: Vec<u8> = buf.iter().flat_map(|b| [*b, *b]).collect();
			s.write_all(&doubled).await.unwrap();
		});

		let upstream_sock = TcpStream::connect(addr).await.unwrap();
		let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let proxy_addr = proxy_listener.local_addr().unwrap();
		let proxy = tokio::spawn(async move {
			let (client_side, _) = proxy_listener.accept().await.unwrap();
			copy_bidirectional(client_side, upstream_sock).await.unwrap()
		});

		let mut client = TcpStream::connect(proxy_addr).await.unwrap();
		let payload = vec![7u8; 100_000];
		client.write_all(&payload).await.unwrap();
		client.shutdown().await.unwrap();

		let mut out = Vec::new();
		client.read_to_end(&mut out).await.unwrap();
		assert_eq!(out.len(), payload.len() * 2);
		assert!(out.iter().all(|b| *b == 7));

		let (sent, received) = proxy.await.unwrap();
		assert_eq!(sent, payload.len() as u64);
		assert_eq!(received, out.len() as u64);
		upstream.await.unwrap();
	}
}
