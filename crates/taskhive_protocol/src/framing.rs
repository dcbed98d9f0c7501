#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Encode a value as JSON into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload = serde_json::to_vec(msg)?;
	encode_payload_frame(&payload, max_frame_size)
}

/// Length-prefix an already encoded payload.
pub fn encode_payload_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(frame_len_from_payload_len(payload.len()));
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(payload);
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<T: Serialize>(msg: &T) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<T: Serialize>(buf: &mut BytesMut, msg: &T, max_frame_size: usize) -> Result<(), FramingError> {
	let payload = serde_json::to_vec(msg)?;
	if payload.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload.len(),
			max: max_frame_size,
		});
	}

	buf.reserve(frame_len_from_payload_len(payload.len()));
	buf.put_u32(payload.len() as u32);
	buf.put_slice(&payload);
	Ok(())
}

/// Compute total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	4 + payload_len
}

/// Split a single frame off the start of `src`, returning its raw payload and bytes consumed.
///
/// The payload is not parsed; callers decide whether bad JSON is fatal.
pub fn decode_frame(src: &[u8], max_frame_size: usize) -> Result<(&[u8], usize), FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	Ok((&src[4..need], need))
}

/// Try to split a single frame payload off a growable buffer.
pub fn try_decode_frame_from_buffer(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	let _ = frame.split_to(4);
	Ok(Some(frame.freeze()))
}

/// Parse a frame payload as JSON.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FramingError> {
	Ok(serde_json::from_slice(payload)?)
}
