#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use taskhive_protocol::{
	DEFAULT_MAX_FRAME_SIZE, ErrorCode, ErrorEvent, Hello, Route, decode_json, encode_frame,
	try_decode_frame_from_buffer,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::broadcast::{ConnId, ListenerItem};
use crate::server::identity::IdentityProvider;
use crate::server::session::{ChatSession, SessionContext, SessionError};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// How long a new connection may take to send its `Hello`.
	pub hello_timeout: Duration,

	/// Decoded frames buffered between the stream reader and the session loop.
	pub inbound_channel_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			hello_timeout: Duration::from_secs(10),
			inbound_channel_capacity: 64,
		}
	}
}

/// QUIC application close code for a refusal.
pub fn close_code(code: ErrorCode) -> u32 {
	match code {
		ErrorCode::BadRoute => 4000,
		ErrorCode::Unauthorized => 4001,
		ErrorCode::NotFound => 4004,
		ErrorCode::Persistence => 4500,
	}
}

/// Serve one chat connection: handshake, history, then relay until either side closes.
pub async fn handle_connection(
	conn_id: ConnId,
	connection: quinn::Connection,
	ctx: SessionContext,
	identity: Arc<dyn IdentityProvider>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("taskhive_chat_open_connections").decrement(1.0);
		}
	}

	metrics::gauge!("taskhive_chat_open_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept chat bidirectional stream")?;

	let max_frame_bytes = settings.max_frame_bytes;
	let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(settings.inbound_channel_capacity.max(1));
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("chat stream read failed")),
			};

			metrics::counter!("taskhive_chat_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer(&mut buf, max_frame_bytes) {
					Ok(Some(payload)) => {
						if frame_tx.send(payload).await.is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("taskhive_chat_frame_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode chat frame"));
					}
				}
			}
		}
	});

	let hello = match tokio::time::timeout(settings.hello_timeout, frame_rx.recv()).await {
		Ok(Some(payload)) => match decode_json::<Hello>(&payload) {
			Ok(hello) => hello,
			Err(e) => {
				warn!(conn_id, error = %e, "invalid hello frame");
				refuse(&connection, &mut send, ErrorCode::BadRoute, "invalid hello frame", max_frame_bytes).await;
				reader_task.abort();
				return Ok(());
			}
		},
		Ok(None) => {
			debug!(conn_id, "connection closed before hello");
			return finish_reader(conn_id, reader_task).await;
		}
		Err(_) => {
			warn!(conn_id, timeout = ?settings.hello_timeout, "hello timeout");
			connection.close(quinn::VarInt::from_u32(close_code(ErrorCode::BadRoute)), b"hello timeout");
			reader_task.abort();
			return Ok(());
		}
	};

	let principal = match identity.resolve(&hello.auth_token) {
		Ok(p) => p,
		Err(e) => {
			warn!(conn_id, error = %e, "unauthorized");
			refuse(&connection, &mut send, ErrorCode::Unauthorized, &e.to_string(), max_frame_bytes).await;
			reader_task.abort();
			return Ok(());
		}
	};

	let route = match Route::parse_path(&hello.path) {
		Ok(r) => r,
		Err(e) => {
			warn!(conn_id, principal = %principal.id, error = %e, "bad route");
			refuse(&connection, &mut send, ErrorCode::BadRoute, &e.to_string(), max_frame_bytes).await;
			reader_task.abort();
			return Ok(());
		}
	};

	info!(conn_id, principal = %principal.id, route = %route, "received hello");

	let mut session = ChatSession::new(ctx, conn_id, principal);
	let history = match session.accept(&route).await {
		Ok(h) => h,
		Err(e) => {
			warn!(conn_id, route = %route, error = %e, "session refused");
			refuse(&connection, &mut send, e.code(), &e.to_string(), max_frame_bytes).await;
			reader_task.abort();
			return Ok(());
		}
	};

	let history = match history.split_to_fit(max_frame_bytes) {
		Ok(events) => events,
		Err(e) => {
			warn!(conn_id, route = %route, error = %e, "history cannot be framed");
			session.close();
			refuse(
				&connection,
				&mut send,
				ErrorCode::Persistence,
				"history cannot be replayed",
				max_frame_bytes,
			)
			.await;
			reader_task.abort();
			return Ok(());
		}
	};
	for event in &history {
		send_event(&mut send, event, max_frame_bytes)
			.await
			.context("send history")?;
	}

	let loop_result = async {
		loop {
			tokio::select! {
				frame = frame_rx.recv() => {
					let Some(payload) = frame else {
						debug!(conn_id, "chat stream ended by peer");
						break;
					};

					match session.receive(&payload).await {
						Ok(_) => {}
						Err(SessionError::MalformedPayload(_) | SessionError::Persistence(_)) => {}
						Err(e) => {
							warn!(conn_id, error = %e, "session stopped accepting messages");
							break;
						}
					}
				}

				item = session.next_item() => {
					match item {
						Some(ListenerItem::Chat(ev)) => match encode_frame(&ev, max_frame_bytes) {
							Ok(frame) => write_frame(&mut send, &frame).await?,
							Err(e) => warn!(conn_id, error = %e, "skipping broadcast that does not fit a frame"),
						},
						Some(ListenerItem::Lagged { dropped }) => {
							warn!(conn_id, dropped, "listener lagged; broadcasts were dropped");
						}
						None => break,
					}
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	session.close();
	let _ = send.finish();
	reader_task.abort();
	let _ = reader_task.await;

	loop_result
}

async fn finish_reader(conn_id: ConnId, reader_task: tokio::task::JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
	match reader_task.await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => {
			debug!(conn_id, error = %e, "reader stopped");
			Ok(())
		}
		Err(e) => Err(anyhow!(e).context("reader task panicked")),
	}
}

/// Send one error frame, wait briefly for the peer to read it, then close.
async fn refuse(
	connection: &quinn::Connection,
	send: &mut quinn::SendStream,
	code: ErrorCode,
	message: &str,
	max_frame_bytes: usize,
) {
	metrics::counter!("taskhive_chat_refused_total", "code" => code.as_str()).increment(1);

	if send_event(send, &ErrorEvent::new(code, message), max_frame_bytes)
		.await
		.is_ok()
		&& send.finish().is_ok()
	{
		let _ = tokio::time::timeout(Duration::from_secs(2), send.stopped()).await;
	}

	connection.close(quinn::VarInt::from_u32(close_code(code)), code.as_str().as_bytes());
}

async fn send_event<T: Serialize>(send: &mut quinn::SendStream, event: &T, max_frame_bytes: usize) -> anyhow::Result<()> {
	let frame = encode_frame(event, max_frame_bytes).map_err(|e| anyhow!(e))?;
	write_frame(send, &frame).await
}

async fn write_frame(send: &mut quinn::SendStream, frame: &[u8]) -> anyhow::Result<()> {
	metrics::counter!("taskhive_chat_frames_out_total").increment(1);
	metrics::counter!("taskhive_chat_bytes_out_total").increment(frame.len() as u64);

	send.write_all(frame).await.context("stream write")?;
	Ok(())
}
