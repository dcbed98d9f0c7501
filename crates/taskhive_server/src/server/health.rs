#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::broadcast::BroadcastRegistry;
use crate::server::store::ChatStore;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	store: Arc<dyn ChatStore>,
	registry: BroadcastRegistry,
}

impl HealthState {
	pub fn new(store: Arc<dyn ChatStore>, registry: BroadcastRegistry) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			store,
			registry,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Started and the store answers.
	pub async fn check_ready(&self) -> bool {
		if !self.is_ready() {
			return false;
		}
		match self.store.ping().await {
			Ok(()) => true,
			Err(e) => {
				warn!(error = %e, "readiness: store ping failed");
				false
			}
		}
	}

	/// `{"<group key>": <listeners>, ...}`
	pub fn rooms_json(&self) -> String {
		serde_json::to_string(&self.registry.listener_counts()).unwrap_or_else(|_| "{}".to_string())
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	let resp = match req.uri().path() {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.check_ready().await {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/rooms" => {
			let mut resp = respond(StatusCode::OK, state.rooms_json());
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	};
	Ok(resp)
}
