//! gRPC-Web framing (spec §6) and the self-approve envelope/decode helpers recovered from
//! `original_source/backend/mirea_api/self_approve_attendance.py` (SPEC_FULL.md §2).
//!
//! Protobuf schema knowledge stays out of scope: encoding only ever wraps a single opaque
//! GUID string, and decoding only ever recovers UTF-8 text runs, never field semantics.

// crates.io
use base64::{Engine, engine::general_purpose::STANDARD};
// self
use crate::_prelude::*;

/// 1-byte frame flag meaning "this frame carries a data message".
pub const FLAG_DATA: u8 = 0x00;
/// 1-byte frame flag meaning "this frame carries trailing metadata".
pub const FLAG_TRAILER: u8 = 0x80;

/// One gRPC-Web frame: a flag byte, the payload, and the payload's declared length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
	/// [`FLAG_DATA`] or [`FLAG_TRAILER`].
	pub flag: u8,
	/// Frame payload, opaque to this module.
	pub payload: Vec<u8>,
}

/// Wraps `payload` in a single data frame: flag byte + 4-byte big-endian length + payload.
pub fn encode_frame(flag: u8, payload: &[u8]) -> Vec<u8> {
	let mut framed = Vec::with_capacity(5 + payload.len());

	framed.push(flag);
	framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	framed.extend_from_slice(payload);

	framed
}

/// Splits a gRPC-Web byte stream into its frames (spec §6: 1-byte flag, 4-byte big-endian
/// length, payload — repeated until the buffer is exhausted). Returns frames decoded so
/// far if the stream is truncated mid-frame, matching the tolerant behavior of the
/// original decoder.
pub fn decode_frames(stream: &[u8]) -> Vec<Frame> {
	let mut frames = Vec::new();
	let mut offset = 0;

	while offset + 5 <= stream.len() {
		let flag = stream[offset];
		let len = u32::from_be_bytes(
			stream[offset + 1..offset + 5].try_into().expect("exactly 4 bytes sliced"),
		) as usize;
		let payload_start = offset + 5;
		let payload_end = payload_start + len;

		if payload_end > stream.len() {
			break;
		}

		frames.push(Frame { flag, payload: stream[payload_start..payload_end].to_vec() });
		offset = payload_end;
	}

	frames
}

/// Wraps a GUID into the fixed protobuf envelope the self-approve call expects, then
/// base64-encodes it for `application/grpc-web-text` transport. The envelope is a tiny
/// fixed shape (`0x0A, len, guid_bytes`), itself wrapped in a one-frame gRPC-Web message —
/// not general protobuf encoding, just this one message's known wire bytes.
pub fn encode_guid_request(guid: &str) -> String {
	let guid_bytes = guid.as_bytes();
	let mut message = Vec::with_capacity(2 + guid_bytes.len());

	message.push(0x0A);
	message.push(guid_bytes.len() as u8);
	message.extend_from_slice(guid_bytes);

	let framed = encode_frame(FLAG_DATA, &message);

	STANDARD.encode(framed)
}

/// Recovers human-readable text segments from a base64 `application/grpc-web-text`
/// response body, without decoding protobuf field structure. Scans the frame payloads for
/// UTF-8 runs that look like natural-language text (Cyrillic or Latin letters, spaces,
/// punctuation) and joins the distinct runs with `" | "`, matching the original decoder's
/// output shape.
pub fn decode_text_response(encoded: &str) -> Result<String, String> {
	let decoded = STANDARD.decode(encoded.trim()).map_err(|e| format!("invalid base64: {e}"))?;
	let frames = decode_frames(&decoded);
	let mut parts = Vec::new();

	for frame in &frames {
		if frame.flag == FLAG_TRAILER {
			continue;
		}

		for run in extract_text_runs(&frame.payload) {
			if !parts.contains(&run) {
				parts.push(run);
			}
		}
	}

	Ok(parts.join(" | "))
}

/// Scans arbitrary bytes for maximal runs of UTF-8 text, discarding anything shorter than
/// two characters (protobuf tag/length bytes rarely decode to more than a single
/// printable character by accident).
fn extract_text_runs(bytes: &[u8]) -> Vec<String> {
	let mut runs = Vec::new();
	let mut current = String::new();
	let mut i = 0;

	while i < bytes.len() {
		let remainder = &bytes[i..];

		if let Some(ch) = decode_one_char(remainder) {
			let (c, width) = ch;

			if is_text_char(c) {
				current.push(c);
				i += width;
				continue;
			}
		}

		if current.chars().count() >= 2 {
			runs.push(std::mem::take(&mut current));
		} else {
			current.clear();
		}

		i += 1;
	}

	if current.chars().count() >= 2 {
		runs.push(current);
	}

	runs
}

fn decode_one_char(bytes: &[u8]) -> Option<(char, usize)> {
	let first = *bytes.first()?;
	let width = if first < 0x80 {
		1
	} else if first >> 5 == 0b110 {
		2
	} else if first >> 4 == 0b1110 {
		3
	} else if first >> 3 == 0b11110 {
		4
	} else {
		return None;
	};

	if bytes.len() < width {
		return None;
	}

	std::str::from_utf8(&bytes[..width]).ok()?.chars().next().map(|c| (c, width))
}

fn is_text_char(c: char) -> bool {
	c.is_alphabetic() || c == ' ' || c == '-' || c == '.' || c == ','
}
