#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use quinn::{Endpoint, ServerConfig};
use serde::Serialize;
use taskhive_client::{ChatClient, ClientConfig, ClientError};
use taskhive_domain::PrincipalId;
use taskhive_protocol::{
	ChatBroadcast, DEFAULT_MAX_FRAME_SIZE, ErrorCode, ErrorEvent, Hello, HistoryEntry, HistoryEvent, InboundMessage,
	Route, ServerEvent, decode_json, encode_frame, try_decode_frame_from_buffer, version,
};
use tokio::sync::oneshot;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("TASKHIVE_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn pid(n: i64) -> PrincipalId {
	PrincipalId::new(n).expect("valid PrincipalId")
}

fn make_quic_server(bind_addr: SocketAddr) -> anyhow::Result<Endpoint> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert_chain = vec![rustls::pki_types::CertificateDer::from(ck.cert.der().to_vec())];
	let key = rustls::pki_types::PrivateKeyDer::try_from(ck.signing_key.serialize_der())
		.map_err(anyhow::Error::msg)
		.context("parse private key der")?;

	let mut tls_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;
	tls_config.alpn_protocols = vec![version::ALPN.to_vec()];

	let server_config = ServerConfig::with_crypto(Arc::new(quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)?));
	Endpoint::server(server_config, bind_addr).context("bind quinn endpoint")
}

async fn send_event<T: Serialize>(send: &mut quinn::SendStream, ev: &T) -> anyhow::Result<()> {
	let frame = encode_frame(ev, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	send.write_all(&frame).await.context("write frame")?;
	Ok(())
}

async fn read_payload(recv: &mut quinn::RecvStream, buf: &mut BytesMut) -> anyhow::Result<bytes::Bytes> {
	let mut tmp = [0u8; 4096];
	loop {
		if let Some(payload) = try_decode_frame_from_buffer(buf, DEFAULT_MAX_FRAME_SIZE)? {
			return Ok(payload);
		}
		let n = recv
			.read(&mut tmp)
			.await
			.context("server read")?
			.ok_or_else(|| anyhow!("client finished stream early"))?;
		buf.extend_from_slice(&tmp[..n]);
	}
}

/// What the scripted server observed from the client.
#[derive(Debug)]
struct Observed {
	hello: Hello,
	message: Option<InboundMessage>,
}

/// Accept one connection, read the hello, then either refuse or replay one message,
/// push one broadcast and read one inbound message.
async fn run_scripted_server(
	endpoint: Endpoint,
	refuse_with: Option<ErrorCode>,
	ready_tx: oneshot::Sender<SocketAddr>,
) -> anyhow::Result<Observed> {
	let _ = ready_tx.send(endpoint.local_addr().context("server local_addr")?);

	let connecting = endpoint.accept().await.ok_or_else(|| anyhow!("endpoint closed"))?;
	let connection = connecting.await.context("accept quic connection")?;
	let (mut send, mut recv) = connection.accept_bi().await.context("accept_bi")?;

	let mut buf = BytesMut::new();
	let hello: Hello = decode_json(&read_payload(&mut recv, &mut buf).await?)?;
	tracing::info!(path = %hello.path, "server: received hello");

	if let Some(code) = refuse_with {
		send_event(&mut send, &ErrorEvent::new(code, "scripted refusal")).await?;
		let _ = send.finish();
		let _ = tokio::time::timeout(Duration::from_secs(5), connection.closed()).await;
		return Ok(Observed { hello, message: None });
	}

	let history = HistoryEvent::new(vec![HistoryEntry {
		sender: "bob".to_string(),
		sender_id: pid(10),
		content: "earlier".to_string(),
		timestamp: chrono::Utc::now(),
	}]);
	send_event(&mut send, &history).await?;
	send_event(
		&mut send,
		&ChatBroadcast {
			message: "live".to_string(),
			sender: "bob".to_string(),
			sender_id: pid(10),
		},
	)
	.await?;

	let message = InboundMessage::parse(&read_payload(&mut recv, &mut buf).await?)?;
	let _ = send.finish();
	// Keep the connection up until the client hangs up so it can observe the finished stream.
	let _ = tokio::time::timeout(Duration::from_secs(5), connection.closed()).await;

	Ok(Observed {
		hello,
		message: Some(message),
	})
}

async fn start(
	refuse_with: Option<ErrorCode>,
) -> anyhow::Result<(ClientConfig, tokio::task::JoinHandle<anyhow::Result<Observed>>)> {
	init_test_logging();
	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let endpoint = make_quic_server("127.0.0.1:0".parse().context("parse bind addr")?)?;
	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task = tokio::spawn(run_scripted_server(endpoint, refuse_with, ready_tx));
	let server_addr = ready_rx.await.context("server ready")?;

	let cfg = ClientConfig {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		connect_timeout: Duration::from_secs(5),
		..ClientConfig::default()
	}
	.with_auth_token("secret-token");

	Ok((cfg, server_task))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_sends_hello_and_reads_history_then_broadcasts() -> anyhow::Result<()> {
	let (cfg, server_task) = start(None).await?;

	let (mut client, history) = ChatClient::connect(cfg, &Route::Private { a: pid(5), b: pid(10) })
		.await
		.context("client connect")?;
	assert_eq!(history.messages.len(), 1);
	assert_eq!(history.messages[0].content, "earlier");

	let ev = tokio::time::timeout(Duration::from_secs(5), client.next_event())
		.await
		.context("timeout waiting for broadcast")??;
	match ev {
		Some(ServerEvent::Chat(chat)) => {
			assert_eq!(chat.message, "live");
			assert_eq!(chat.sender_id, pid(10));
		}
		other => panic!("expected chat event, got: {other:?}"),
	}

	client.send_message("pong").await?;

	let end = tokio::time::timeout(Duration::from_secs(5), client.next_event())
		.await
		.context("timeout waiting for end of stream")??;
	assert!(end.is_none());
	client.close(0, "done");

	let observed = server_task.await.context("server join")??;
	assert_eq!(observed.hello.auth_token, "secret-token");
	assert_eq!(observed.hello.path, "ws/private/5/10/");
	assert_eq!(observed.message.map(|m| m.message).as_deref(), Some("pong"));
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refusal_surfaces_error_code() -> anyhow::Result<()> {
	let (cfg, server_task) = start(Some(ErrorCode::NotFound)).await?;

	let err = ChatClient::connect(cfg, &Route::Group { room: "7".parse()? })
		.await
		.err()
		.context("expected refusal")?;
	match err {
		ClientError::Refused { code, message } => {
			assert_eq!(code, ErrorCode::NotFound);
			assert_eq!(message, "scripted refusal");
		}
		other => panic!("expected refusal, got: {other}"),
	}

	let observed = server_task.await.context("server join")??;
	assert_eq!(observed.hello.path, "ws/group/7/");
	assert!(observed.message.is_none());
	Ok(())
}
