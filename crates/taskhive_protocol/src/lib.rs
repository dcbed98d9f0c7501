#![forbid(unsafe_code)]

pub mod framing;
pub mod route;
pub mod wire;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, decode_json, encode_frame, encode_frame_default,
	encode_frame_into, encode_payload_frame, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use route::{ChatUrl, QuicEndpoint, Route, RouteError};
pub use wire::{
	ChatBroadcast, ErrorCode, ErrorEvent, Hello, HistoryEntry, HistoryEvent, InboundMessage, PayloadError, ServerEvent,
};

/// Protocol version constants.
pub mod version {
	/// ALPN identifier negotiated on every connection.
	pub const ALPN: &[u8] = b"taskhive-chat-v1";
}
