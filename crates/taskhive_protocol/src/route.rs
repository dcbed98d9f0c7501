#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;

use taskhive_domain::{ParseIdError, PrincipalId, RoomId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
	#[error("empty route")]
	Empty,

	#[error("unknown route (expected ws/private/<a>/<b>/ or ws/group/<id>/): {0}")]
	Unknown(String),

	#[error("invalid id in route {path}: {source}")]
	BadId {
		path: String,
		#[source]
		source: ParseIdError,
	},

	#[error("invalid endpoint: {0}")]
	Endpoint(String),
}

/// Where a connection wants to chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
	Private { a: PrincipalId, b: PrincipalId },
	Group { room: RoomId },
}

impl Route {
	/// Parse `ws/private/<a>/<b>/` or `ws/group/<id>/`. Leading and trailing slashes are optional.
	pub fn parse_path(path: &str) -> Result<Self, RouteError> {
		let trimmed = path.trim().trim_start_matches('/').trim_end_matches('/');
		if trimmed.is_empty() {
			return Err(RouteError::Empty);
		}

		let segments = trimmed.split('/').collect::<Vec<_>>();
		let bad_id = |source: ParseIdError| RouteError::BadId {
			path: path.to_string(),
			source,
		};

		match segments.as_slice() {
			["ws", "private", a, b] => Ok(Route::Private {
				a: a.parse().map_err(bad_id)?,
				b: b.parse().map_err(bad_id)?,
			}),
			["ws", "group", room] => Ok(Route::Group {
				room: room.parse().map_err(bad_id)?,
			}),
			_ => Err(RouteError::Unknown(path.to_string())),
		}
	}

	/// Canonical path form, always with a trailing slash.
	pub fn path(&self) -> String {
		match self {
			Route::Private { a, b } => format!("ws/private/{a}/{b}/"),
			Route::Group { room } => format!("ws/group/{room}/"),
		}
	}
}

impl fmt::Display for Route {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.path())
	}
}

/// Parsed `quic://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	/// Returns `host:port` (IPv6 stays bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Host without IPv6 brackets, suitable for TLS server names.
	pub fn server_name(&self) -> &str {
		self.host.trim_start_matches('[').trim_end_matches(']')
	}

	/// Convert to `SocketAddr` only if the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, RouteError> {
		self.hostport().parse().map_err(|_| {
			RouteError::Endpoint(format!(
				"host must be an IP literal (DNS names not supported here): {}",
				self.host
			))
		})
	}

	/// Parse `quic://host:port` with no path.
	pub fn parse(s: &str) -> Result<Self, RouteError> {
		let (endpoint, rest) = split_url(s)?;
		if !rest.is_empty() {
			return Err(RouteError::Endpoint(format!(
				"expected quic://host:port without path/query/fragment: {s}"
			)));
		}
		Ok(endpoint)
	}
}

impl fmt::Display for QuicEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "quic://{}:{}", self.host, self.port)
	}
}

/// A full chat address such as `quic://127.0.0.1:18203/ws/group/7/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUrl {
	pub endpoint: QuicEndpoint,
	pub route: Route,
}

impl ChatUrl {
	pub fn parse(s: &str) -> Result<Self, RouteError> {
		let (endpoint, rest) = split_url(s)?;
		if rest.contains('?') || rest.contains('#') {
			return Err(RouteError::Endpoint(format!("query/fragment not supported: {s}")));
		}
		let route = Route::parse_path(rest)?;
		Ok(Self { endpoint, route })
	}
}

impl fmt::Display for ChatUrl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.endpoint, self.route.path())
	}
}

fn split_url(s: &str) -> Result<(QuicEndpoint, &str), RouteError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(RouteError::Endpoint(
			"endpoint must be non-empty (expected quic://host:port)".to_string(),
		));
	}

	let rest = s
		.strip_prefix("quic://")
		.ok_or_else(|| RouteError::Endpoint(format!("expected quic://host:port: {s}")))?;

	let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
	let (authority, tail) = rest.split_at(authority_end);

	let (host, port_str) = authority
		.rsplit_once(':')
		.ok_or_else(|| RouteError::Endpoint(format!("missing :port (expected quic://host:port): {s}")))?;

	let host = host.trim();
	if host.is_empty() {
		return Err(RouteError::Endpoint(format!("missing host: {s}")));
	}

	if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
		return Err(RouteError::Endpoint(format!(
			"IPv6 must be bracketed like quic://[::1]:18203: {s}"
		)));
	}

	let port = port_str
		.trim()
		.parse::<u16>()
		.ok()
		.filter(|p| *p != 0)
		.ok_or_else(|| RouteError::Endpoint(format!("invalid port (expected 1..=65535): {s}")))?;

	Ok((
		QuicEndpoint {
			host: host.to_string(),
			port,
		},
		tail,
	))
}
