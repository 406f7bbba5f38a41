//! Client side of a SOCKS5 (RFC 1928) CONNECT, with optional username and
//! password sub-negotiation (RFC 1929). Used on the upstream leg of a
//! forwarded connection when the pipe request asks for a SOCKS5 hop.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
	#[error("socks5 io: {0}")]
	Io(#[from] std::io::Error),
	#[error("socks5 peer speaks version {0}")]
	BadVersion(u8),
	#[error("socks5 proxy accepted none of our auth methods")]
	NoAcceptableAuth,
	#[error("socks5 credentials rejected")]
	AuthFailed,
	#[error("socks5 connect rejected with code {0}")]
	Rejected(u8),
	#[error("socks5 reply malformed")]
	BadReply,
	#[error("domain name longer than 255 bytes")]
	DomainTooLong,
}

/// Run the handshake over an already-connected proxy socket and ask it to
/// CONNECT to `host:port`.
pub(crate) async fn connect<S>(
	io: &mut S,
	host: &str,
	port: u16,
	auth: Option<(&str, &str)>,
) -> Result<(), Socks5Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	// greeting
	let mut greeting = vec![VERSION, 1, METHOD_NO_AUTH];
	if auth.is_some() {
		greeting[1] = 2;
		greeting.push(METHOD_USER_PASS);
	}
	io.write_all(&greeting).await?;

	let mut choice = [0u8; 2];
	io.read_exact(&mut choice).await?;
	if choice[0] != VERSION {
		return Err(Socks5Error::BadVersion(choice[0]));
	}
	match choice[1] {
		METHOD_NO_AUTH => {},
		METHOD_USER_PASS => {
			let Some((user, pass)) = auth else {
				return Err(Socks5Error::NoAcceptableAuth);
			};
			subnegotiate(io, user, pass).await?;
		},
		METHOD_UNACCEPTABLE => return Err(Socks5Error::NoAcceptableAuth),
		_ => return Err(Socks5Error::NoAcceptableAuth),
	}

	// CONNECT request
	let mut request = vec![VERSION, CMD_CONNECT, 0x00];
	if let Ok(v4) = host.parse::<Ipv4Addr>() {
		request.push(ATYP_IPV4);
		request.extend_from_slice(&v4.octets());
	} else if let Ok(v6) = host.parse::<Ipv6Addr>() {
		request.push(ATYP_IPV6);
		request.extend_from_slice(&v6.octets());
	} else {
		if host.len() > 255 {
			return Err(Socks5Error::DomainTooLong);
		}
		request.push(ATYP_DOMAIN);
		request.push(host.len() as u8);
		request.extend_from_slice(host.as_bytes());
	}
	request.extend_from_slice(&port.to_be_bytes());
	io.write_all(&request).await?;

	// reply: VER REP RSV ATYP BND.ADDR BND.PORT
	let mut head = [0u8; 4];
	io.read_exact(&mut head).await?;
	if head[0] != VERSION {
		return Err(Socks5Error::BadVersion(head[0]));
	}
	if head[1] != 0x00 {
		return Err(Socks5Error::Rejected(head[1]));
	}
	let bound_len = match head[3] {
		ATYP_IPV4 => 4,
		ATYP_IPV6 => 16,
		ATYP_DOMAIN => {
			let mut len = [0u8; 1];
			io.read_exact(&mut len).await?;
			len[0] as usize
		},
		_ => return Err(Socks5Error::BadReply),
	};
	let mut bound = vec![0u8; bound_len + 2];
	io.read_exact(&mut bound).await?;
	Ok(())
}

async fn subnegotiate<S>(io: &mut S, user: &str, pass: &str) -> Result<(), Socks5Error>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	if user.len() > 255 || pass.len() > 255 {
		return Err(Socks5Error::AuthFailed);
	}
	let mut msg = vec![0x01, user.len() as u8];
	msg.extend_from_slice(user.as_bytes());
	msg.push(pass.len() as u8);
	msg.extend_from_slice(pass.as_bytes());
	io.write_all(&msg).await?;

	let mut reply = [0u8; 2];
	io.read_exact(&mut reply).await?;
	if reply[1] != 0x00 {
		return Err(Socks5Error::AuthFailed);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Scripted SOCKS5 server for one handshake.
	async fn fake_proxy(
		expect_methods: &[u8],
		choose: u8,
		expect_connect_tail: &[u8],
		reply: &[u8],
	) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
		let (client, mut server) = tokio::io::duplex(512);
		let expect_methods = expect_methods.to_vec();
		let expect_tail = expect_connect_tail.to_vec();
		let reply = reply.to_vec();
		let task = tokio::spawn(async move {
			let mut greeting = vec![0u8; 2 + expect_methods.len()];
			server.read_exact(&mut greeting).await.unwrap();
			assert_eq!(greeting[0], VERSION);
			assert_eq!(&greeting[2..], &expect_methods);
			server.write_all(&[VERSION, choose]).await.unwrap();

			let mut req = vec![0u8; 4 + expect_tail.len()];
			server.read_exact(&mut req).await.unwrap();
			assert_eq!(&req[..3], &[VERSION, CMD_CONNECT, 0]);
			assert_eq!(&req[4..], &expect_tail);
			server.write_all(&reply).await.unwrap();
		});
		(client, task)
	}

	#[tokio::test]
	async fn connect_by_ipv4() {
		let mut tail = vec![127, 0, 0, 1];
		tail.extend_from_slice(&9000u16.to_be_bytes());
		let reply = [VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
		let (mut io, task) = fake_proxy(&[METHOD_NO_AUTH], METHOD_NO_AUTH, &tail, &reply).await;
		connect(&mut io, "127.0.0.1", 9000, None).await.unwrap();
		task.await.unwrap();
	}

	#[tokio::test]
	async fn connect_by_domain() {
		let mut tail = vec![7];
		tail.extend_from_slice(b"example");
		tail.extend_from_slice(&443u16.to_be_bytes());
		let reply = [VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
		let (mut io, task) = fake_proxy(&[METHOD_NO_AUTH], METHOD_NO_AUTH, &tail, &reply).await;
		connect(&mut io, "example", 443, None).await.unwrap();
		task.await.unwrap();
	}

	#[tokio::test]
	async fn rejected_connect_surfaces_code() {
		let mut tail = vec![127, 0, 0, 1];
		tail.extend_from_slice(&1u16.to_be_bytes());
		let reply = [VERSION, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
		let (mut io, task) = fake_proxy(&[METHOD_NO_AUTH], METHOD_NO_AUTH, &tail, &reply).await;
		let err = connect(&mut io, "127.0.0.1", 1, None).await.unwrap_err();
		assert!(matches!(err, Socks5Error::Rejected(0x05)));
		task.await.unwrap();
	}

	#[tokio::test]
	async fn user_pass_subnegotiation() {
		let (mut io, server_task) = {
			let (client, mut server) = tokio::io::duplex(512);
			let task = tokio::spawn(async move {
				let mut greeting = [0u8; 4];
				server.read_exact(&mut greeting).await.unwrap();
				assert_eq!(greeting, [VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]);
				server.write_all(&[VERSION, METHOD_USER_PASS]).await.unwrap();

				let mut auth = [0u8; 7];
				server.read_exact(&mut auth).await.unwrap();
				assert_eq!(auth, [0x01, 2, b'a', b'b', 2, b'c', b'd']);
				server.write_all(&[0x01, 0x00]).await.unwrap();

				let mut req = [0u8; 4 + 4 + 2];
				server.read_exact(&mut req).await.unwrap();
				server
					.write_all(&[VERSION, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
					.await
					.unwrap();
			});
			(client, task)
		};
		connect(&mut io, "10.0.0.1", 80, Some(("ab", "cd"))).await.unwrap();
		server_task.await.unwrap();
	}
}
