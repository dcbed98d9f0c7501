#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use taskhive_domain::{OrganizationId, Principal, PrincipalId};
use taskhive_protocol::DEFAULT_MAX_FRAME_SIZE;
use tracing::{info, warn};

use crate::server::identity::SecretString;

/// Default config path: `~/.taskhive/chat.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".taskhive").join("chat.toml"))
}

/// Load the server config from TOML (missing file means defaults) and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub identity: IdentitySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	pub hello_timeout: Duration,
	/// Per-listener broadcast queue bound.
	pub listener_queue_capacity: usize,
	pub debug_broadcast_logs: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			hello_timeout: Duration::from_secs(10),
			listener_queue_capacity: 1024,
			debug_broadcast_logs: false,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:...`, `postgres:...`, or unset for the in-memory store.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IdentitySettings {
	/// HMAC secret for stateless `v1.` tokens.
	pub hmac_secret: Option<SecretString>,
	/// Fixed development tokens.
	pub static_tokens: Vec<(String, Principal)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	identity: FileIdentitySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	hello_timeout_secs: Option<u64>,
	listener_queue_capacity: Option<usize>,
	debug_broadcast_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIdentitySettings {
	hmac_secret: Option<String>,

	#[serde(default)]
	static_tokens: Vec<FileStaticToken>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileStaticToken {
	token: String,
	id: i64,
	name: String,
	org: Option<i64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();

		let mut static_tokens = Vec::with_capacity(file.identity.static_tokens.len());
		for entry in file.identity.static_tokens {
			let token = entry.token.trim().to_string();
			if token.is_empty() {
				warn!(id = entry.id, "identity config: ignoring static token with empty value");
				continue;
			}
			let id = PrincipalId::new(entry.id).with_context(|| format!("static token for id {}", entry.id))?;
			let org = entry
				.org
				.map(OrganizationId::new)
				.transpose()
				.with_context(|| format!("static token org for id {}", entry.id))?;
			static_tokens.push((token, Principal::new(id, entry.name).with_organization(org)));
		}

		Ok(Self {
			server: ServerSettings {
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(defaults.max_frame_bytes),
				hello_timeout: file
					.server
					.hello_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.hello_timeout),
				listener_queue_capacity: file
					.server
					.listener_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.listener_queue_capacity),
				debug_broadcast_logs: file.server.debug_broadcast_logs.unwrap_or(false),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
			identity: IdentitySettings {
				hmac_secret: non_empty(file.identity.hmac_secret).map(SecretString::new),
				static_tokens,
			},
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Apply `TASKHIVE_*` overrides read through `lookup`.
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| non_empty(lookup(key));

	if let Some(v) = text("TASKHIVE_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("TASKHIVE_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("TASKHIVE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("TASKHIVE_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("TASKHIVE_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = text("TASKHIVE_HELLO_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.server.hello_timeout = Duration::from_secs(secs);
		info!(secs, "server config: hello_timeout overridden by env");
	}

	if let Some(v) = text("TASKHIVE_LISTENER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.listener_queue_capacity = capacity;
		info!(capacity, "server config: listener_queue_capacity overridden by env");
	}

	if let Some(v) = text("TASKHIVE_DEBUG_BROADCAST_LOGS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.debug_broadcast_logs = enabled;
		info!(enabled, "server config: debug_broadcast_logs overridden by env");
	}

	if let Some(v) = text("TASKHIVE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = text("TASKHIVE_AUTH_HMAC_SECRET") {
		cfg.identity.hmac_secret = Some(SecretString::new(v));
		info!("identity: hmac_secret overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> ServerConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("toml");
		ServerConfig::from_file(file).expect("config")
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.hello_timeout, Duration::from_secs(10));
		assert_eq!(cfg.server.listener_queue_capacity, 1024);
		assert!(cfg.persistence.database_url.is_none());
		assert!(cfg.identity.hmac_secret.is_none());
	}

	#[test]
	fn sections_are_read() {
		let cfg = parse(
			r#"
			[server]
			health_bind = "127.0.0.1:18280"
			hello_timeout_secs = 3
			listener_queue_capacity = 8

			[persistence]
			database_url = "sqlite://chat.db"

			[identity]
			hmac_secret = "s3cret"

			[[identity.static_tokens]]
			token = "dev-alice"
			id = 5
			name = "alice"
			org = 2

			[[identity.static_tokens]]
			token = "   "
			id = 6
			name = "ignored"
			"#,
		);

		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:18280"));
		assert_eq!(cfg.server.hello_timeout, Duration::from_secs(3));
		assert_eq!(cfg.server.listener_queue_capacity, 8);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite://chat.db"));
		assert_eq!(cfg.identity.hmac_secret.as_ref().map(SecretString::expose), Some("s3cret"));
		assert_eq!(cfg.identity.static_tokens.len(), 1);
		let (token, principal) = &cfg.identity.static_tokens[0];
		assert_eq!(token, "dev-alice");
		assert_eq!(principal.username, "alice");
		assert_eq!(principal.organization.map(OrganizationId::get), Some(2));
	}

	#[test]
	fn static_token_with_bad_id_is_an_error() {
		let file: FileConfig = toml::from_str(
			r#"
			[[identity.static_tokens]]
			token = "x"
			id = 0
			name = "zero"
			"#,
		)
		.expect("toml");
		assert!(ServerConfig::from_file(file).is_err());
	}

	#[test]
	fn env_overrides_win_and_ignore_garbage() {
		let env = HashMap::from([
			("TASKHIVE_DATABASE_URL", "postgres://db/chat"),
			("TASKHIVE_HELLO_TIMEOUT_SECS", "abc"),
			("TASKHIVE_LISTENER_QUEUE_CAPACITY", "16"),
			("TASKHIVE_AUTH_HMAC_SECRET", " from-env "),
			("TASKHIVE_HEALTH_BIND", "   "),
		]);

		let mut cfg = parse("[server]\nhealth_bind = \"127.0.0.1:1\"\n");
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.persistence.database_url.as_deref(), Some("postgres://db/chat"));
		assert_eq!(cfg.server.hello_timeout, Duration::from_secs(10));
		assert_eq!(cfg.server.listener_queue_capacity, 16);
		assert_eq!(cfg.identity.hmac_secret.as_ref().map(SecretString::expose), Some("from-env"));
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:1"));
	}
}
