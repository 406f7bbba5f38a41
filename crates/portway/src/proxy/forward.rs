//! The composable forward pipeline for pipe-selected legs, applied in the
//! fixed order SOCKS5 → TLS → WebSocket → raw splice. Stages are skipped
//! when their option is disabled or nothing is configured for them.

use tokio_rustls::TlsStream;
use tracing::debug;

use crate::config::{ProxySetup, TlsLevel};
use crate::proxy::pipe::{ForwardOption, ForwardProtocol, PipeRequest};
use crate::proxy::socks5::{self, Socks5Error};
use crate::proxy::splice;
use crate::proxy::websocket::{self, WsError};
use crate::transport::{self, tls, Io, Rewind};

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
	#[error("upstream dial: {0}")]
	Dial(std::io::Error),
	#[error("bad destination port {0:?}")]
	BadPort(String),
	#[error(transparent)]
	Socks5(#[from] Socks5Error),
	#[error("upstream tls: {0}")]
	Tls(String),
	#[error(transparent)]
	Websocket(#[from] WsError),
	#[error("splice: {0}")]
	Splice(std::io::Error),
}

pub(crate) async fn run_forward(
	client: Io,
	request: &PipeRequest,
	setup: &ProxySetup,
) -> Result<(), ForwardError> {
	let socks5_cfg = match request.socks5 {
		ForwardOption::Disabled => None,
		_ => setup.forward.socks5.as_ref(),
	};

	// with a SOCKS5 hop we dial the proxy and let it reach the destination
	let (dial_host, dial_service) = match socks5_cfg {
		Some(cfg) => (cfg.host.as_str(), cfg.port.as_str()),
		None => (request.dst_host.as_str(), request.dst_service.as_str()),
	};
	let mut tcp = transport::dial(dial_host, dial_service)
		.await
		.map_err(ForwardError::Dial)?;

	if let Some(cfg) = socks5_cfg {
		let port: u16 = request
			.dst_service
			.parse()
			.map_err(|_| ForwardError::BadPort(request.dst_service.clone()))?;
		let auth = cfg
			.username
			.as_deref()
			.zip(cfg.password.as_deref());
		socks5::connect(&mut tcp, &request.dst_host, port, auth).await?;
	}

	let tls_cfg = match request.tls {
		ForwardOption::Disabled => None,
		_ => setup
			.forward
			.tls
			.as_ref()
			.filter(|cfg| cfg.level != TlsLevel::None),
	};
	let mut upstream = match tls_cfg {
		Some(cfg) => {
			let connector = tls::connector(cfg)
				.map_err(|e| ForwardError::Tls(e.to_string()))?
				.expect("level checked above");
			let name =
				tls::server_name(&request.dst_host).map_err(|e| ForwardError::Tls(e.to_string()))?;
			let stream = connector
				.connect(name, Rewind::new(tcp))
				.await
				.map_err(|e| ForwardError::Tls(e.to_string()))?;
			Io::Tls(Box::new(TlsStream::Client(stream)))
		},
		None => Io::plain(tcp),
	};

	if request.protocol == ForwardProtocol::Websocket {
		websocket::client_upgrade(&mut upstream, &request.route_path, &request.dst_host).await?;
	}

	let (sent, received) = splice::copy_bidirectional(client, upstream)
		.await
		.map_err(ForwardError::Splice)?;
	debug!(sent, received, "forward complete");
	Ok(())
}
