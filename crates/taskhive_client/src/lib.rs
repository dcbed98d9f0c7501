#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use quinn::{Endpoint, TransportConfig, VarInt};
use taskhive_protocol::{
	ChatUrl, DEFAULT_MAX_FRAME_SIZE, ErrorCode, FramingError, Hello, HistoryEvent, InboundMessage, QuicEndpoint, Route,
	ServerEvent, decode_json, encode_frame, encode_payload_frame, try_decode_frame_from_buffer, version,
};
use tracing::{debug, info};

/// Local development server.
pub const DEFAULT_SERVER_ENDPOINT_QUIC: &str = "quic://127.0.0.1:18203";

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal); also the TLS server name.
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Token sent in the hello; resolved to a principal by the server.
	pub auth_token: String,

	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Config for `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let e = QuicEndpoint::parse(endpoint).map_err(|e| ClientError::Protocol(e.to_string()))?;
		Ok(Self::for_endpoint(&e))
	}

	/// Config and route for `quic://host:port/ws/...`.
	pub fn from_chat_url(url: &str) -> Result<(Self, Route), ClientError> {
		let url = ChatUrl::parse(url).map_err(|e| ClientError::Protocol(e.to_string()))?;
		Ok((Self::for_endpoint(&url.endpoint), url.route))
	}

	fn for_endpoint(e: &QuicEndpoint) -> Self {
		Self {
			server_host: e.server_name().to_string(),
			server_port: e.port,
			server_addr: e.to_socket_addr_if_ip_literal().ok(),
			..Self::default()
		}
	}

	pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
		self.auth_token = token.into();
		self
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: Some(SocketAddr::from(([127, 0, 0, 1], 18203))),
			auth_token: String::new(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	/// The server sent an error event instead of history.
	#[error("refused by server: {code}: {message}")]
	Refused { code: ErrorCode, message: String },

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected event ordering or shape.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("io error: {0}")]
	Io(String),
}

/// One chat connection bound to a single room.
pub struct ChatClient {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl ChatClient {
	/// Connect, send the hello for `route`, and wait for the history replay.
	pub async fn connect(cfg: ClientConfig, route: &Route) -> Result<(Self, HistoryEvent), ClientError> {
		Self::connect_path(cfg, &route.path()).await
	}

	/// Like [`ChatClient::connect`] with an unparsed route path.
	pub async fn connect_path(cfg: ClientConfig, path: &str) -> Result<(Self, HistoryEvent), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), path, "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening chat stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;

		let mut client = Self {
			conn,
			send,
			recv,
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
		};

		let hello = Hello {
			auth_token: cfg.auth_token,
			path: path.to_string(),
		};
		let frame = encode_frame(&hello, client.max_frame_bytes)?;
		client.write_frame(&frame).await?;

		let first = tokio::time::timeout(connect_timeout, client.next_event())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for history after {connect_timeout:?}")))??;

		match first {
			Some(ServerEvent::History(mut history)) => {
				while history.more {
					let next = tokio::time::timeout(connect_timeout, client.next_event())
						.await
						.map_err(|_| ClientError::Protocol("timeout waiting for the rest of history".to_string()))??;
					match next {
						Some(ServerEvent::History(part)) => {
							history.messages.extend(part.messages);
							history.more = part.more;
						}
						other => {
							return Err(ClientError::Protocol(format!(
								"expected more history, got {other:?}"
							)));
						}
					}
				}
				debug!(messages = history.messages.len(), "received history");
				Ok((client, history))
			}
			Some(ServerEvent::Error(err)) => Err(ClientError::Refused {
				code: err.code,
				message: err.message,
			}),
			Some(ServerEvent::Chat(_)) => Err(ClientError::Protocol("expected history, got chat message".to_string())),
			None => Err(ClientError::Protocol("stream closed before history".to_string())),
		}
	}

	/// Send `{"message": text}`.
	pub async fn send_message(&mut self, text: &str) -> Result<(), ClientError> {
		let msg = InboundMessage {
			message: text.to_string(),
		};
		let frame = encode_frame(&msg, self.max_frame_bytes)?;
		self.write_frame(&frame).await
	}

	/// Frame and send an arbitrary payload, valid JSON or not.
	pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), ClientError> {
		let frame = encode_payload_frame(payload, self.max_frame_bytes)?;
		self.write_frame(&frame).await
	}

	/// Next server event; `None` once the server finishes the stream.
	pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			if let Some(payload) = try_decode_frame_from_buffer(&mut self.buf, self.max_frame_bytes)? {
				return Ok(Some(decode_json::<ServerEvent>(&payload)?));
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					debug!("chat stream closed by server");
					return Ok(None);
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	pub fn remote_address(&self) -> SocketAddr {
		self.conn.remote_address()
	}

	/// Finish the send side and close the connection.
	pub fn close(mut self, code: u32, reason: &str) {
		let _ = self.send.finish();
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ClientError> {
		self.send.write_all(frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
		Ok(())
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![version::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	// One chat stream per connection.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert!(cfg.max_frame_bytes > 0);
		assert!(cfg.auth_token.is_empty());
	}

	#[test]
	fn chat_url_splits_into_config_and_route() {
		let (cfg, route) = ClientConfig::from_chat_url("quic://127.0.0.1:4433/ws/private/10/5/").expect("url");
		assert_eq!(cfg.server_host, "127.0.0.1");
		assert_eq!(cfg.server_port, 4433);
		assert_eq!(cfg.server_addr, Some(SocketAddr::from(([127, 0, 0, 1], 4433))));
		assert_eq!(route.path(), "ws/private/10/5/");
	}

	#[test]
	fn dns_endpoint_leaves_address_unresolved() {
		let cfg = ClientConfig::from_quic_endpoint("quic://chat.example.com:443")
			.expect("endpoint")
			.with_auth_token("tok");
		assert_eq!(cfg.server_host, "chat.example.com");
		assert!(cfg.server_addr.is_none());
		assert_eq!(cfg.auth_token, "tok");
		assert!(ClientConfig::from_quic_endpoint("quic://host:1/ws/group/1/").is_err());
	}
}
