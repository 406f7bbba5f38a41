//! rustls glue: acceptor/connector construction from config paths, and the
//! three-byte record sniff that lets TLS and plaintext clients share a port.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{ClientTlsConfig, TlsLevel, TlsServerConfig};

/// Bytes a connection must show before we commit to a TLS handshake.
pub const SNIFF_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSniff {
	/// TLS handshake record with a plausible version; hand the bytes to the
	/// TLS stack.
	ClientHello,
	/// Not a TLS record at all; fall back to plaintext framing.
	Plaintext,
	/// TLS record with a version outside SSL 3.0..TLS 1.2; hard close.
	Malformed,
}

/// Classify the first three bytes of a connection. A handshake record starts
/// `0x16`, followed by the record version `03 00`..`03 03`.
pub fn classify(prefix: &[u8; SNIFF_LEN]) -> TlsSniff {
	if prefix[0] != 0x16 {
		return TlsSniff::Plaintext;
	}
	if prefix[1] == 0x03 && prefix[2] <= 0x03 {
		TlsSniff::ClientHello
	} else {
		TlsSniff::Malformed
	}
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: String,
		source: std::io::Error,
	},
	#[error("no private key in {0}")]
	NoKey(String),
	#[error("no certificates in {0}")]
	NoCerts(String),
	#[error("tls config rejected: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("client verifier rejected: {0}")]
	Verifier(#[from] rustls::server::VerifierBuilderError),
	#[error("no trust roots available: {0}")]
	NoRoots(String),
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let file = File::open(path).map_err(|source| TlsError::Read {
		path: path.display().to_string(),
		source,
	})?;
	let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
		.collect::<Result<_, _>>()
		.map_err(|source| TlsError::Read {
			path: path.display().to_string(),
			source,
		})?;
	if certs.is_empty() {
		return Err(TlsError::NoCerts(path.display().to_string()));
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
	let file = File::open(path).map_err(|source| TlsError::Read {
		path: path.display().to_string(),
		source,
	})?;
	rustls_pemfile::private_key(&mut BufReader::new(file))
		.map_err(|source| TlsError::Read {
			path: path.display().to_string(),
			source,
		})?
		.ok_or_else(|| TlsError::NoKey(path.display().to_string()))
}

fn root_store_from(path: &Path) -> Result<RootCertStore, TlsError> {
	let mut roots = RootCertStore::empty();
	for cert in load_certs(path)? {
		roots.add(cert)?;
	}
	Ok(roots)
}

pub fn acceptor(cfg: &TlsServerConfig) -> Result<TlsAcceptor, TlsError> {
	let certs = load_certs(&cfg.cert_path)?;
	let key = load_key(&cfg.key_path)?;
	let builder = match &cfg.client_ca_path {
		Some(ca) => {
			let roots = root_store_from(ca)?;
			let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;
			rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
		},
		None => rustls::ServerConfig::builder().with_no_client_auth(),
	};
	let config = builder.with_single_cert(certs, key)?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn connector(cfg: &ClientTlsConfig) -> Result<Option<TlsConnector>, TlsError> {
	if cfg.level == TlsLevel::None {
		return Ok(None);
	}
	let builder = rustls::ClientConfig::builder();
	let builder = match cfg.level {
		TlsLevel::Required => match &cfg.ca_path {
			Some(ca) => builder.with_root_certificates(root_store_from(ca)?),
			None => builder.with_root_certificates(system_roots()?),
		},
		// Optional keeps the handshake but skips verification, mirroring the
		// server's plaintext-fallback leniency.
		_ => builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify::new())),
	};
	let config = match (&cfg.cert_path, &cfg.key_path) {
		(Some(cert), Some(key)) => builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?,
		_ => builder.with_no_client_auth(),
	};
	Ok(Some(TlsConnector::from(Arc::new(config))))
}

fn system_roots() -> Result<RootCertStore, TlsError> {
	let mut roots = RootCertStore::empty();
	let result = rustls_native_certs::load_native_certs();
	for cert in result.certs {
		let _ = roots.add(cert);
	}
	if roots.is_empty() {
		return Err(TlsError::NoRoots(
			result
				.errors
				.first()
				.map(|e| e.to_string())
				.unwrap_or_else(|| "no native certs found".to_string()),
		));
	}
	Ok(roots)
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, rustls::Error> {
	ServerName::try_from(host.to_string()).map_err(|_| rustls::Error::General("bad server name".into()))
}

#[derive(Debug)]
struct NoVerify(Arc<CryptoProvider>);

impl NoVerify {
	fn new() -> Self {
		NoVerify(Arc::new(rustls::crypto::ring::default_provider()))
	}
}

impl ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self
			.0
			.signature_verification_algorithms
			.supported_schemes()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sniff_classification() {
		assert_eq!(classify(&[0x16, 0x03, 0x01]), TlsSniff::ClientHello);
		assert_eq!(classify(&[0x16, 0x03, 0x00]), TlsSniff::ClientHello);
		assert_eq!(classify(&[0x16, 0x03, 0x03]), TlsSniff::ClientHello);
		assert_eq!(classify(&[0x16, 0x03, 0x04]), TlsSniff::Malformed);
		assert_eq!(classify(&[0x16, 0x02, 0x01]), TlsSniff::Malformed);
		assert_eq!(classify(&[0x27, 0x00, 0x00]), TlsSniff::Plaintext);
		assert_eq!(classify(&[b'G', b'E', b'T']), TlsSniff::Plaintext);
	}
}
