#![forbid(unsafe_code)]

use taskhive_client::{ChatClient, ClientConfig, DEFAULT_SERVER_ENDPOINT_QUIC};
use taskhive_protocol::{Route, ServerEvent};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: taskhive_client [--connect quic://host:port] --route ws/private/<a>/<b>/ | ws/group/<id>/\n\
\x20      taskhive_client --url quic://host:port/ws/group/<id>/\n\
\n\
Options:\n\
\t--connect  Server endpoint (default: {DEFAULT_SERVER_ENDPOINT_QUIC})\n\
\t--route    Room route\n\
\t--url      Endpoint and route in one\n\
\t--token    Auth token (default: $TASKHIVE_CLIENT_AUTH_TOKEN)\n\
\t--help     Show this help\n\
\n\
Lines read from stdin are sent as chat messages.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,taskhive_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_args() -> (ClientConfig, Route) {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();
	let mut route: Option<String> = None;
	let mut url: Option<String> = None;
	let mut token = std::env::var("TASKHIVE_CLIENT_AUTH_TOKEN")
		.ok()
		.map(|v| v.trim().to_string())
		.unwrap_or_default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = it.next().unwrap_or_else(|| usage_and_exit()),
			"--route" => route = it.next(),
			"--url" => url = it.next(),
			"--token" => token = it.next().unwrap_or_else(|| usage_and_exit()),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (cfg, route) = match (url, route) {
		(Some(url), None) => ClientConfig::from_chat_url(&url).unwrap_or_else(|e| {
			eprintln!("Invalid --url value: {url}\n{e}");
			usage_and_exit();
		}),
		(None, Some(route)) => {
			let cfg = ClientConfig::from_quic_endpoint(&endpoint).unwrap_or_else(|e| {
				eprintln!("Invalid --connect value: {endpoint}\n{e}");
				usage_and_exit();
			});
			let route = Route::parse_path(&route).unwrap_or_else(|e| {
				eprintln!("Invalid --route value: {route}\n{e}");
				usage_and_exit();
			});
			(cfg, route)
		}
		_ => {
			eprintln!("exactly one of --url or --route is required");
			usage_and_exit();
		}
	};

	(cfg.with_auth_token(token), route)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (cfg, route) = parse_args();

	let (mut client, history) = ChatClient::connect(cfg, &route).await?;
	info!(route = %route, messages = history.messages.len(), "joined room");
	for m in &history.messages {
		println!("[{}] {}: {}", m.timestamp.to_rfc3339(), m.sender, m.content);
	}

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			line = lines.next_line() => {
				match line? {
					Some(line) if line.trim().is_empty() => {}
					Some(line) => client.send_message(&line).await?,
					None => break,
				}
			}
			event = client.next_event() => {
				match event? {
					Some(ServerEvent::Chat(ev)) => println!("{} ({}): {}", ev.sender, ev.sender_id, ev.message),
					Some(ServerEvent::Error(err)) => {
						warn!(code = %err.code, message = %err.message, "server error");
						break;
					}
					Some(ServerEvent::History(_)) => warn!("unexpected history event"),
					None => {
						info!("server closed the stream");
						break;
					}
				}
			}
		}
	}

	client.close(0, "bye");
	Ok(())
}
