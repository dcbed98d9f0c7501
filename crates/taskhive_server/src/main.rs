#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use taskhive_domain::{OrganizationId, Principal, PrincipalId, RoomId};
use taskhive_protocol::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::config::{BoundEndpoint, ChatEndpointConfig, TlsSource};
use crate::server::broadcast::{BroadcastConfig, BroadcastRegistry};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::directory::RoomDirectory;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::identity::{ChainedIdentityProvider, HmacIdentityProvider, IdentityProvider, StaticIdentityProvider};
use crate::server::session::SessionContext;
use crate::server::store::connect_store;

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: taskhive_server [--config path] [--bind quic://host:port]\n\
\x20      taskhive_server [--config path] <command> [args]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: quic://127.0.0.1:18203)\n\
\t          Format: quic://host:port\n\
\t--config   Config file (default: ~/.taskhive/chat.toml)\n\
\t--help     Show this help\n\
\n\
Commands:\n\
\tcreate-group [--name NAME] [--org ID] --members ID,ID,...\n\
\tadd-members --room ID --members ID,ID,...\n\
\trooms --principal ID\n\
\tmint-token --id ID --name NAME [--org ID] [--ttl-secs SECS]\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug)]
enum Command {
	Serve { bind: SocketAddr },
	CreateGroup {
		name: Option<String>,
		organization: Option<OrganizationId>,
		members: Vec<PrincipalId>,
	},
	AddMembers {
		room: RoomId,
		members: Vec<PrincipalId>,
	},
	Rooms {
		principal: PrincipalId,
	},
	MintToken {
		principal: Principal,
		ttl_secs: u64,
	},
}

#[derive(Debug)]
struct Args {
	config_path: Option<PathBuf>,
	command: Command,
}

fn parse_id<T: std::str::FromStr>(flag: &str, v: Option<String>) -> T
where
	T::Err: std::fmt::Display,
{
	let v = v.unwrap_or_else(|| usage_and_exit());
	v.trim().parse().unwrap_or_else(|e| {
		eprintln!("{flag}: {e}");
		usage_and_exit();
	})
}

fn parse_args() -> Args {
	let mut bind_endpoint = "quic://127.0.0.1:18203".to_string();
	let mut config_path = None;
	let mut command_name: Option<String> = None;

	let mut name = None;
	let mut organization = None;
	let mut members = Vec::new();
	let mut room = None;
	let mut principal = None;
	let mut ttl_secs = DEFAULT_TOKEN_TTL_SECS;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			"--name" => name = it.next(),
			"--org" => organization = Some(parse_id::<OrganizationId>("--org", it.next())),
			"--member" => members.push(parse_id::<PrincipalId>("--member", it.next())),
			"--members" => {
				let list = it.next().unwrap_or_else(|| usage_and_exit());
				for v in list.split(',').filter(|v| !v.trim().is_empty()) {
					members.push(parse_id::<PrincipalId>("--members", Some(v.to_string())));
				}
			}
			"--room" => room = Some(parse_id::<RoomId>("--room", it.next())),
			"--principal" | "--id" => principal = Some(parse_id::<PrincipalId>(&arg, it.next())),
			"--ttl" | "--ttl-secs" => ttl_secs = parse_id::<u64>("--ttl", it.next()),
			"create-group" | "add-members" | "rooms" | "mint-token" if command_name.is_none() => {
				command_name = Some(arg.clone());
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let command = match command_name.as_deref() {
		None => {
			let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
				eprintln!("{e}");
				usage_and_exit();
			});
			let bind = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
				eprintln!("{e}");
				usage_and_exit();
			});
			Command::Serve { bind }
		}
		Some("create-group") => {
			if members.is_empty() {
				eprintln!("create-group needs --members");
				usage_and_exit();
			}
			Command::CreateGroup {
				name,
				organization,
				members,
			}
		}
		Some("add-members") => {
			let Some(room) = room else {
				eprintln!("add-members needs --room");
				usage_and_exit();
			};
			if members.is_empty() {
				eprintln!("add-members needs --members");
				usage_and_exit();
			}
			Command::AddMembers { room, members }
		}
		Some("rooms") => {
			let Some(principal) = principal else {
				eprintln!("rooms needs --principal");
				usage_and_exit();
			};
			Command::Rooms { principal }
		}
		Some("mint-token") => {
			let (Some(id), Some(name)) = (principal, name) else {
				eprintln!("mint-token needs --id and --name");
				usage_and_exit();
			};
			Command::MintToken {
				principal: Principal::new(id, name).with_organization(organization),
				ttl_secs,
			}
		}
		Some(_) => usage_and_exit(),
	};

	Args { config_path, command }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,taskhive_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("taskhive_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_identity(cfg: &ServerConfig) -> Arc<dyn IdentityProvider> {
	let mut chain = ChainedIdentityProvider::new();

	if let Some(secret) = cfg.identity.hmac_secret.clone() {
		chain = chain.with(Arc::new(HmacIdentityProvider::new(secret)));
		info!("identity: hmac tokens enabled");
	}

	if !cfg.identity.static_tokens.is_empty() {
		let table = StaticIdentityProvider::new(cfg.identity.static_tokens.iter().cloned());
		info!(tokens = cfg.identity.static_tokens.len(), "identity: static tokens enabled");
		chain = chain.with(Arc::new(table));
	}

	if chain.is_empty() {
		warn!("identity: no provider configured; every connection will be refused");
	}

	Arc::new(chain)
}

async fn run_command(cfg: &ServerConfig, command: Command) -> anyhow::Result<()> {
	if let Command::MintToken { principal, ttl_secs } = &command {
		let secret = cfg
			.identity
			.hmac_secret
			.clone()
			.ok_or_else(|| anyhow!("mint-token needs identity.hmac_secret (or TASKHIVE_AUTH_HMAC_SECRET)"))?;
		println!("{}", HmacIdentityProvider::new(secret).mint(principal, *ttl_secs));
		return Ok(());
	}

	let store = connect_store(cfg.persistence.database_url.as_deref()).await?;
	let directory = RoomDirectory::new(store);

	match command {
		Command::CreateGroup {
			name,
			organization,
			members,
		} => {
			let room = directory.create_group(name.as_deref(), organization, &members).await?;
			println!("{}\t{}", room.id, room.display_name());
		}
		Command::AddMembers { room, members } => {
			let all = directory.add_members(room, &members).await?;
			let all = all.iter().map(ToString::to_string).collect::<Vec<_>>();
			println!("{room}\t{}", all.join(","));
		}
		Command::Rooms { principal } => {
			for summary in directory.rooms_for(principal).await? {
				let last = summary
					.last_message_at
					.map(|t| t.to_rfc3339())
					.unwrap_or_else(|| "-".to_string());
				let other = summary
					.other_member
					.map(|p| p.to_string())
					.unwrap_or_else(|| "-".to_string());
				println!("{}\t{}\t{}\t{}", summary.room.id, summary.room.display_name(), other, last);
			}
		}
		Command::Serve { .. } | Command::MintToken { .. } => {}
	}

	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = match args.command {
		Command::Serve { bind } => bind,
		command => return run_command(&server_cfg, command).await,
	};

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store = connect_store(server_cfg.persistence.database_url.as_deref())
		.await
		.context("open chat store")?;
	let registry = BroadcastRegistry::new(BroadcastConfig {
		listener_queue_capacity: server_cfg.server.listener_queue_capacity,
		debug_logs: server_cfg.server.debug_broadcast_logs,
	});

	let health_state = HealthState::new(Arc::clone(&store), registry.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let tls = TlsSource::from_paths(
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	);
	if let TlsSource::PemFiles { cert, key } = &tls {
		info!(cert = %cert.display(), key = %key.display(), "loading TLS cert/key");
	}
	let BoundEndpoint {
		endpoint,
		self_signed_der,
	} = ChatEndpointConfig::new(bind_addr, tls).bind()?;
	match self_signed_der {
		Some(der) => info!(
			bind = %bind_addr,
			cert_der_len = der.len(),
			"taskhive_server: QUIC endpoint ready (dev self-signed cert)"
		),
		None => info!(bind = %bind_addr, "taskhive_server: QUIC endpoint ready"),
	}

	let identity = build_identity(&server_cfg);
	let ctx = SessionContext::new(store, registry).with_max_frame_bytes(server_cfg.server.max_frame_bytes);
	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		hello_timeout: server_cfg.server.hello_timeout,
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("taskhive_chat_connections_total").increment(1);

		let ctx = ctx.clone();
		let identity = Arc::clone(&identity);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, ctx, identity, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
