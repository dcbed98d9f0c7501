use bytes::BytesMut;
use proptest::prelude::*;
use taskhive_domain::PrincipalId;
use taskhive_protocol::{
	ChatBroadcast, DEFAULT_MAX_FRAME_SIZE, ErrorCode, ErrorEvent, FramingError, Hello, HistoryEvent, InboundMessage,
	ServerEvent, decode_frame, decode_json, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

fn broadcast(text: &str) -> ServerEvent {
	ServerEvent::Chat(ChatBroadcast {
		message: text.to_string(),
		sender: "alice".to_string(),
		sender_id: PrincipalId::new(5).unwrap(),
	})
}

#[test]
fn hello_frame_decodes_from_slice() {
	let hello = Hello {
		auth_token: "tok".to_string(),
		path: "ws/group/7/".to_string(),
	};

	let frame = encode_frame(&hello, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (payload, consumed) = decode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(frame.len(), frame_len_from_payload_len(payload.len()));
	assert_eq!(decode_json::<Hello>(payload).expect("json"), hello);
}

#[test]
fn try_decode_from_buffer_incremental() {
	let ev = broadcast("hello");
	let frame = encode_frame_default(&ev).expect("encode");

	let mut buf = BytesMut::new();
	buf.extend_from_slice(&frame[..2]);
	assert!(
		try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[2..frame.len() - 1]);
	assert!(
		try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[frame.len() - 1..]);
	let payload = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("complete frame");

	assert!(buf.is_empty());
	assert_eq!(decode_json::<ServerEvent>(&payload).expect("json"), ev);
}

#[test]
fn back_to_back_frames_keep_order() {
	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, &HistoryEvent::new(Vec::new()), DEFAULT_MAX_FRAME_SIZE).expect("history");
	encode_frame_into(&mut buf, &broadcast("one"), DEFAULT_MAX_FRAME_SIZE).expect("one");
	encode_frame_into(&mut buf, &broadcast("two"), DEFAULT_MAX_FRAME_SIZE).expect("two");

	let mut out = Vec::new();
	while let Some(payload) = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("ok") {
		out.push(decode_json::<ServerEvent>(&payload).expect("json"));
	}

	assert_eq!(out.len(), 3);
	assert!(matches!(out[0], ServerEvent::History(_)));
	assert_eq!(out[1], broadcast("one"));
	assert_eq!(out[2], broadcast("two"));
}

#[test]
fn malformed_payload_is_separable_from_framing() {
	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, &serde_json::json!({"text": "oops"}), DEFAULT_MAX_FRAME_SIZE).expect("encode");
	encode_frame_into(&mut buf, &serde_json::json!({"message": "fine"}), DEFAULT_MAX_FRAME_SIZE).expect("encode");

	let first = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("framing ok")
		.expect("frame");
	assert!(InboundMessage::parse(&first).is_err());

	let second = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("framing ok")
		.expect("frame");
	assert_eq!(InboundMessage::parse(&second).expect("parse").message, "fine");
}

#[test]
fn error_event_respects_small_frame_limit() {
	let ev = ErrorEvent::new(ErrorCode::NotFound, "x".repeat(256));
	match encode_frame(&ev, 64).unwrap_err() {
		FramingError::FrameTooLarge { len, max } => {
			assert_eq!(max, 64);
			assert!(len > 256);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn any_split_point_yields_the_same_event(text in ".{0,64}", split in 0usize..128) {
		let ev = broadcast(&text);
		let frame = encode_frame_default(&ev).unwrap();
		let split = split.min(frame.len());

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&frame[..split]);
		let early = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
		prop_assert_eq!(early.is_some(), split == frame.len());

		buf.extend_from_slice(&frame[split..]);
		let payload = match early {
			Some(p) => p,
			None => try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap(),
		};
		prop_assert_eq!(decode_json::<ServerEvent>(&payload).unwrap(), ev);
	}
}
