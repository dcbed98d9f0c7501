#![forbid(unsafe_code)]

//! JSON events exchanged over a chat connection.
//!
//! Server → client events share one stream, so [`ServerEvent`] decodes any of
//! them. History and error frames carry a `type` discriminator; chat
//! broadcasts do not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhive_domain::{PrincipalId, StoredMessage};
use thiserror::Error;

use crate::framing::FramingError;

/// First client frame: identity token and routing path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
	pub auth_token: String,
	pub path: String,
}

/// Inbound payload problems. Always local to one event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
	#[error("payload is not valid json: {0}")]
	InvalidJson(String),

	#[error("payload has no string `message` field")]
	MissingMessage,

	#[error("message would need a {len} byte frame, limit is {max}")]
	TooLarge { len: usize, max: usize },
}

/// Client → server chat payload: `{"message": <text>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
	pub message: String,
}

impl InboundMessage {
	/// Parse a raw frame payload. Extra fields are ignored; empty text is accepted.
	pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
		let value: serde_json::Value =
			serde_json::from_slice(payload).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

		match value.get("message") {
			Some(serde_json::Value::String(text)) => Ok(Self { message: text.clone() }),
			_ => Err(PayloadError::MissingMessage),
		}
	}

	/// Check that this text, sent by `sender`, still fits in one frame both as a
	/// broadcast and as a single replayed history entry.
	pub fn ensure_fits(&self, sender: &str, sender_id: PrincipalId, max_frame_size: usize) -> Result<(), PayloadError> {
		let broadcast = ChatBroadcast {
			message: self.message.clone(),
			sender: sender.to_string(),
			sender_id,
		};
		let replay = HistoryEvent {
			kind: HistoryTag::History,
			messages: vec![HistoryEntry {
				sender: sender.to_string(),
				sender_id,
				content: self.message.clone(),
				timestamp: DateTime::<Utc>::MAX_UTC,
			}],
			more: true,
		};

		let len = json_len(&broadcast).max(json_len(&replay));
		if len > max_frame_size {
			return Err(PayloadError::TooLarge {
				len,
				max: max_frame_size,
			});
		}
		Ok(())
	}
}

fn json_len<T: Serialize>(value: &T) -> usize {
	serde_json::to_vec(value).map_or(usize::MAX, |v| v.len())
}

fn is_false(v: &bool) -> bool {
	!*v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HistoryTag {
	#[default]
	#[serde(rename = "history")]
	History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorTag {
	#[default]
	#[serde(rename = "error")]
	Error,
}

/// One replayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub sender: String,
	pub sender_id: PrincipalId,
	pub content: String,
	pub timestamp: DateTime<Utc>,
}

impl From<&StoredMessage> for HistoryEntry {
	fn from(msg: &StoredMessage) -> Self {
		Self {
			sender: msg.sender_name.clone(),
			sender_id: msg.sender_id,
			content: msg.content.clone(),
			timestamp: msg.created_at,
		}
	}
}

/// `{"type": "history", "messages": [...]}`, the first frame of an accepted connection.
///
/// A history too long for one frame is replayed as consecutive events; all but
/// the last carry `"more": true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
	#[serde(rename = "type")]
	pub kind: HistoryTag,
	pub messages: Vec<HistoryEntry>,
	#[serde(default, skip_serializing_if = "is_false")]
	pub more: bool,
}

impl HistoryEvent {
	pub fn new(messages: Vec<HistoryEntry>) -> Self {
		Self {
			kind: HistoryTag::History,
			messages,
			more: false,
		}
	}

	/// Split into events whose JSON payloads each fit in `max_frame_size`, order kept.
	///
	/// An empty history yields one empty event. Fails only if a single entry cannot fit alone.
	pub fn split_to_fit(self, max_frame_size: usize) -> Result<Vec<HistoryEvent>, FramingError> {
		let continued = |messages: Vec<HistoryEntry>| HistoryEvent {
			kind: HistoryTag::History,
			messages,
			more: true,
		};
		let base = serde_json::to_vec(&continued(Vec::new()))?.len();

		let mut events = Vec::new();
		let mut current = Vec::new();
		let mut len = base;

		for entry in self.messages {
			let entry_len = serde_json::to_vec(&entry)?.len();
			if base + entry_len > max_frame_size {
				return Err(FramingError::FrameTooLarge {
					len: base + entry_len,
					max: max_frame_size,
				});
			}

			// One comma between array elements.
			let added = entry_len + usize::from(!current.is_empty());
			if len + added > max_frame_size {
				events.push(continued(std::mem::take(&mut current)));
				len = base + entry_len;
			} else {
				len += added;
			}
			current.push(entry);
		}

		events.push(HistoryEvent::new(current));
		Ok(events)
	}

	pub fn from_stored(messages: &[StoredMessage]) -> Self {
		Self::new(messages.iter().map(HistoryEntry::from).collect())
	}
}

/// Fan-out event for one chat message: `{"message", "sender", "sender_id"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBroadcast {
	pub message: String,
	pub sender: String,
	pub sender_id: PrincipalId,
}

impl From<&StoredMessage> for ChatBroadcast {
	fn from(msg: &StoredMessage) -> Self {
		Self {
			message: msg.content.clone(),
			sender: msg.sender_name.clone(),
			sender_id: msg.sender_id,
		}
	}
}

/// Refusal codes sent before the server closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	Unauthorized,
	BadRoute,
	NotFound,
	Persistence,
}

impl ErrorCode {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCode::Unauthorized => "UNAUTHORIZED",
			ErrorCode::BadRoute => "BAD_ROUTE",
			ErrorCode::NotFound => "NOT_FOUND",
			ErrorCode::Persistence => "PERSISTENCE",
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `{"type": "error", "code": <CODE>, "message": <text>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
	#[serde(rename = "type")]
	pub kind: ErrorTag,
	pub code: ErrorCode,
	pub message: String,
}

impl ErrorEvent {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			kind: ErrorTag::Error,
			code,
			message: message.into(),
		}
	}
}

/// Any server → client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEvent {
	History(HistoryEvent),
	Error(ErrorEvent),
	Chat(ChatBroadcast),
}

impl From<HistoryEvent> for ServerEvent {
	fn from(ev: HistoryEvent) -> Self {
		ServerEvent::History(ev)
	}
}

impl From<ErrorEvent> for ServerEvent {
	fn from(ev: ErrorEvent) -> Self {
		ServerEvent::Error(ev)
	}
}

impl From<ChatBroadcast> for ServerEvent {
	fn from(ev: ChatBroadcast) -> Self {
		ServerEvent::Chat(ev)
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;
	use serde_json::json;

	use super::*;

	fn pid(n: i64) -> PrincipalId {
		PrincipalId::new(n).unwrap()
	}

	#[test]
	fn inbound_accepts_extra_fields_and_empty_text() {
		let msg = InboundMessage::parse(br#"{"message": "", "extra": 1}"#).unwrap();
		assert_eq!(msg.message, "");
	}

	#[test]
	fn inbound_rejects_missing_or_non_string_message() {
		assert_eq!(
			InboundMessage::parse(br#"{"text": "hi"}"#).unwrap_err(),
			PayloadError::MissingMessage
		);
		assert_eq!(
			InboundMessage::parse(br#"{"message": 5}"#).unwrap_err(),
			PayloadError::MissingMessage
		);
		assert_eq!(InboundMessage::parse(br#"["hi"]"#).unwrap_err(), PayloadError::MissingMessage);
		assert!(matches!(
			InboundMessage::parse(b"not json").unwrap_err(),
			PayloadError::InvalidJson(_)
		));
	}

	#[test]
	fn broadcast_has_exact_wire_shape() {
		let ev = ServerEvent::from(ChatBroadcast {
			message: "hi".to_string(),
			sender: "alice".to_string(),
			sender_id: pid(5),
		});
		assert_eq!(
			serde_json::to_value(&ev).unwrap(),
			json!({"message": "hi", "sender": "alice", "sender_id": 5})
		);
	}

	#[test]
	fn history_has_type_tag_and_iso_timestamps() {
		let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
		let ev = HistoryEvent::new(vec![HistoryEntry {
			sender: "bob".to_string(),
			sender_id: pid(10),
			content: "yo".to_string(),
			timestamp: ts,
		}]);

		let value = serde_json::to_value(&ev).unwrap();
		assert_eq!(value["type"], "history");
		assert_eq!(value["messages"][0]["sender_id"], 10);
		assert_eq!(value["messages"][0]["timestamp"], "2024-03-01T12:30:00Z");
	}

	fn entry(n: usize) -> HistoryEntry {
		HistoryEntry {
			sender: "bob".to_string(),
			sender_id: pid(10),
			content: format!("message number {n}"),
			timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
		}
	}

	#[test]
	fn short_history_stays_one_event_without_more_flag() {
		let events = HistoryEvent::new(vec![entry(1), entry(2)]).split_to_fit(1024).unwrap();
		assert_eq!(events.len(), 1);
		assert!(!events[0].more);

		let value = serde_json::to_value(&events[0]).unwrap();
		assert!(value.get("more").is_none());
	}

	#[test]
	fn long_history_splits_into_frames_that_fit() {
		let max = 512;
		let all = (0..100).map(entry).collect::<Vec<_>>();
		let events = HistoryEvent::new(all.clone()).split_to_fit(max).unwrap();
		assert!(events.len() > 1);

		for (i, ev) in events.iter().enumerate() {
			assert!(serde_json::to_vec(ev).unwrap().len() <= max, "event {i} too large");
			assert_eq!(ev.more, i + 1 < events.len());
			assert!(!ev.messages.is_empty());
		}

		let replayed = events.into_iter().flat_map(|ev| ev.messages).collect::<Vec<_>>();
		assert_eq!(replayed, all);
	}

	#[test]
	fn empty_history_is_one_empty_event() {
		let events = HistoryEvent::new(Vec::new()).split_to_fit(64).unwrap();
		assert_eq!(events, vec![HistoryEvent::new(Vec::new())]);
	}

	#[test]
	fn entry_larger_than_a_frame_cannot_be_split() {
		let err = HistoryEvent::new(vec![entry(1)]).split_to_fit(40).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { max: 40, .. }));
	}

	#[test]
	fn text_that_fits_inbound_can_still_be_too_large_to_deliver() {
		let max = 256;
		let text = "x".repeat(230);
		let inbound = serde_json::to_vec(&InboundMessage { message: text.clone() }).unwrap();
		assert!(inbound.len() <= max);

		let msg = InboundMessage { message: text };
		assert!(matches!(
			msg.ensure_fits("alice", pid(5), max),
			Err(PayloadError::TooLarge { max: 256, .. })
		));
		assert!(msg.ensure_fits("alice", pid(5), 1024).is_ok());
	}

	#[test]
	fn accepted_text_always_fits_as_broadcast_and_replay() {
		let max = 400;
		let mut longest = String::new();
		while (InboundMessage { message: format!("{longest}y") }).ensure_fits("alice", pid(5), max).is_ok() {
			longest.push('y');
		}

		let broadcast = ChatBroadcast {
			message: longest.clone(),
			sender: "alice".to_string(),
			sender_id: pid(5),
		};
		assert!(serde_json::to_vec(&broadcast).unwrap().len() <= max);

		let replay = HistoryEvent::new(vec![HistoryEntry {
			sender: "alice".to_string(),
			sender_id: pid(5),
			content: longest,
			timestamp: Utc::now(),
		}]);
		assert_eq!(replay.split_to_fit(max).unwrap().len(), 1);
	}

	#[test]
	fn server_event_decodes_each_shape() {
		let history: ServerEvent = serde_json::from_value(json!({"type": "history", "messages": []})).unwrap();
		assert!(matches!(history, ServerEvent::History(ref h) if h.messages.is_empty()));

		let error: ServerEvent =
			serde_json::from_value(json!({"type": "error", "code": "NOT_FOUND", "message": "no room"})).unwrap();
		assert!(matches!(error, ServerEvent::Error(ref e) if e.code == ErrorCode::NotFound));

		let chat: ServerEvent =
			serde_json::from_value(json!({"message": "hi", "sender": "a", "sender_id": 1})).unwrap();
		assert!(matches!(chat, ServerEvent::Chat(ref c) if c.message == "hi"));
	}
}
