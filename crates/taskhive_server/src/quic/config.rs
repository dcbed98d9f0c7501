#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use taskhive_protocol::version;

/// Where the endpoint's certificate comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
	/// Generated at startup for `localhost`. Development only.
	SelfSigned,

	/// PEM certificate chain and private key on disk.
	PemFiles { cert: PathBuf, key: PathBuf },
}

impl TlsSource {
	/// Files when both paths are configured, otherwise a self-signed cert.
	pub fn from_paths(cert: Option<&Path>, key: Option<&Path>) -> Self {
		match (cert, key) {
			(Some(cert), Some(key)) => TlsSource::PemFiles {
				cert: cert.to_path_buf(),
				key: key.to_path_buf(),
			},
			_ => TlsSource::SelfSigned,
		}
	}
}

/// Listening side of the chat transport.
#[derive(Debug, Clone)]
pub struct ChatEndpointConfig {
	pub bind_addr: SocketAddr,
	pub tls: TlsSource,
}

/// A bound endpoint plus the generated certificate when one was made.
pub struct BoundEndpoint {
	pub endpoint: Endpoint,
	pub self_signed_der: Option<Vec<u8>>,
}

impl ChatEndpointConfig {
	pub fn new(bind_addr: SocketAddr, tls: TlsSource) -> Self {
		Self { bind_addr, tls }
	}

	pub fn bind(&self) -> anyhow::Result<BoundEndpoint> {
		let (chain, key, self_signed_der) = match &self.tls {
			TlsSource::SelfSigned => {
				let (chain, key) = self_signed_identity()?;
				let der = chain.first().map(|c| c.to_vec());
				(chain, key, der)
			}
			TlsSource::PemFiles { cert, key } => (load_cert_chain(cert)?, load_private_key(key)?, None),
		};

		let endpoint = Endpoint::server(chat_server_config(chain, key)?, self.bind_addr)
			.with_context(|| format!("bind chat endpoint on {}", self.bind_addr))?;
		Ok(BoundEndpoint {
			endpoint,
			self_signed_der,
		})
	}
}

/// Chat ALPN only, and exactly one bidirectional stream per connection.
fn chat_server_config(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<ServerConfig> {
	let mut tls = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(chain, key)
		.context("build rustls server config")?;
	tls.alpn_protocols = vec![version::ALPN.to_vec()];

	let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).context("rustls config is not usable for QUIC")?;

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));

	let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
	server_config.transport_config(Arc::new(transport));
	Ok(server_config)
}

fn self_signed_identity() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
	let generated =
		rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;
	let cert = CertificateDer::from(generated.cert.der().to_vec());
	let key = PrivateKeyDer::try_from(generated.signing_key.serialize_der())
		.map_err(|e| anyhow!("self-signed key: {e}"))?;
	Ok((vec![cert], key))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let chain = certs(&mut BufReader::new(&pem[..]))
		.collect::<Result<Vec<_>, _>>()
		.context("parse tls certs")?;

	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}
	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	private_key(&mut BufReader::new(&pem[..]))
		.context("parse tls key")?
		.ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
