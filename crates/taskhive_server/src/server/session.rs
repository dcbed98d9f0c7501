#![forbid(unsafe_code)]

use std::sync::Arc;

use taskhive_domain::{Principal, Room, RoomId, StoredMessage};
use taskhive_protocol::{
	ChatBroadcast, DEFAULT_MAX_FRAME_SIZE, ErrorCode, HistoryEvent, InboundMessage, PayloadError, Route,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::broadcast::{BroadcastRegistry, ConnId, ListenerItem, Registration};
use crate::server::resolver::{ResolveError, RoomResolver};
use crate::server::store::{ChatStore, StoreError};

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
	pub resolver: RoomResolver,
	pub store: Arc<dyn ChatStore>,
	pub registry: BroadcastRegistry,

	/// Largest frame a message may need on the way out.
	pub max_frame_bytes: usize,
}

impl SessionContext {
	pub fn new(store: Arc<dyn ChatStore>, registry: BroadcastRegistry) -> Self {
		Self {
			resolver: RoomResolver::new(Arc::clone(&store)),
			store,
			registry,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}

	pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
		self.max_frame_bytes = max_frame_bytes;
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Pending,
	Active,
	Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error("room {0} not found")]
	NotFound(RoomId),

	#[error("malformed payload: {0}")]
	MalformedPayload(#[from] PayloadError),

	#[error("persistence failed: {0}")]
	Persistence(#[from] StoreError),

	#[error("session is {0:?}, operation not allowed")]
	InvalidState(SessionState),
}

impl From<ResolveError> for SessionError {
	fn from(e: ResolveError) -> Self {
		match e {
			ResolveError::NotFound(id) => SessionError::NotFound(id),
			ResolveError::Persistence(e) => SessionError::Persistence(e),
		}
	}
}

impl SessionError {
	/// Wire code used when refusing a connection.
	///
	/// Only `accept` errors refuse. `MalformedPayload` comes from `receive` alone and
	/// never reaches the wire; it maps to `BAD_ROUTE` only to keep the match total.
	pub fn code(&self) -> ErrorCode {
		match self {
			SessionError::NotFound(_) => ErrorCode::NotFound,
			SessionError::MalformedPayload(_) => ErrorCode::BadRoute,
			SessionError::Persistence(_) | SessionError::InvalidState(_) => ErrorCode::Persistence,
		}
	}
}

/// One connection's chat lifecycle: `Pending` → `Active` → `Closed`.
///
/// Transport-agnostic; the QUIC glue feeds it payloads and drains
/// [`ChatSession::next_item`].
pub struct ChatSession {
	ctx: SessionContext,
	conn_id: ConnId,
	principal: Principal,
	state: SessionState,
	room: Option<Room>,
	registration: Option<Registration>,
	inbox: Option<mpsc::Receiver<ListenerItem>>,
}

impl ChatSession {
	pub fn new(ctx: SessionContext, conn_id: ConnId, principal: Principal) -> Self {
		Self {
			ctx,
			conn_id,
			principal,
			state: SessionState::Pending,
			room: None,
			registration: None,
			inbox: None,
		}
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn principal(&self) -> &Principal {
		&self.principal
	}

	pub fn room(&self) -> Option<&Room> {
		self.room.as_ref()
	}

	/// Resolve the room, join its group and load history.
	///
	/// Any failure leaves the session `Closed` and unregistered.
	pub async fn accept(&mut self, route: &Route) -> Result<HistoryEvent, SessionError> {
		if self.state != SessionState::Pending {
			return Err(SessionError::InvalidState(self.state));
		}

		match self.try_accept(route).await {
			Ok(history) => {
				self.state = SessionState::Active;
				metrics::gauge!("taskhive_chat_active_sessions").increment(1.0);
				Ok(history)
			}
			Err(e) => {
				self.close();
				Err(e)
			}
		}
	}

	async fn try_accept(&mut self, route: &Route) -> Result<HistoryEvent, SessionError> {
		let room = self.ctx.resolver.resolve(route, self.principal.organization).await?;
		let key = room.group_key();

		let (handle, inbox) = self.ctx.registry.listener(self.conn_id);
		let registration = self.ctx.registry.register(key.clone(), handle);

		// Registered before the history read so nothing sent in between is missed.
		self.registration = Some(registration);
		self.inbox = Some(inbox);

		let messages = self.ctx.store.list_messages(room.id).await?;

		info!(
			conn_id = self.conn_id,
			room = %room.id,
			group = %key,
			principal = %self.principal.id,
			history = messages.len(),
			"session active"
		);

		let history = HistoryEvent::from_stored(&messages);
		self.room = Some(room);
		Ok(history)
	}

	/// Handle one inbound payload: parse, persist, then fan out to the room.
	///
	/// Text that could not be broadcast or replayed within the frame limit is
	/// rejected before it is stored. Errors are local to this payload; the
	/// session stays `Active`.
	pub async fn receive(&mut self, payload: &[u8]) -> Result<StoredMessage, SessionError> {
		let (Some(room), Some(registration)) = (self.room.as_ref(), self.registration.as_ref()) else {
			return Err(SessionError::InvalidState(self.state));
		};
		if self.state != SessionState::Active {
			return Err(SessionError::InvalidState(self.state));
		}

		let max_frame_bytes = self.ctx.max_frame_bytes;
		let parsed = InboundMessage::parse(payload).and_then(|m| {
			m.ensure_fits(&self.principal.username, self.principal.id, max_frame_bytes)?;
			Ok(m)
		});
		let inbound = match parsed {
			Ok(m) => m,
			Err(e) => {
				metrics::counter!("taskhive_chat_malformed_payloads_total").increment(1);
				debug!(conn_id = self.conn_id, error = %e, "discarding malformed payload");
				return Err(e.into());
			}
		};

		let turn = registration.turn();
		let _turn = turn.lock().await;

		let stored = match self.ctx.store.create_message(&self.principal, &inbound.message, room.id).await {
			Ok(m) => m,
			Err(e) => {
				metrics::counter!("taskhive_chat_persist_failures_total").increment(1);
				warn!(conn_id = self.conn_id, room = %room.id, error = %e, "failed to persist message");
				return Err(e.into());
			}
		};

		let report = self.ctx.registry.send(registration.key(), &ChatBroadcast::from(&stored));
		metrics::counter!("taskhive_chat_messages_total").increment(1);
		debug!(
			conn_id = self.conn_id,
			room = %room.id,
			message_id = %stored.id,
			delivered = report.delivered,
			dropped = report.dropped,
			"message broadcast"
		);

		Ok(stored)
	}

	/// Next item from the group queue; `None` once the session is closed.
	pub async fn next_item(&mut self) -> Option<ListenerItem> {
		match self.inbox.as_mut() {
			Some(inbox) => inbox.recv().await,
			None => None,
		}
	}

	/// Leave the group and move to `Closed`. Safe to call any number of times.
	pub fn close(&mut self) -> bool {
		if self.state == SessionState::Closed {
			return false;
		}

		if self.state == SessionState::Active {
			metrics::gauge!("taskhive_chat_active_sessions").decrement(1.0);
		}

		if let Some(mut registration) = self.registration.take() {
			registration.release();
		}
		self.inbox = None;
		self.state = SessionState::Closed;

		debug!(conn_id = self.conn_id, principal = %self.principal.id, "session closed");
		true
	}
}

impl Drop for ChatSession {
	fn drop(&mut self) {
		self.close();
	}
}
