//! Bot Bridge (spec §4.I): classifies inbound chat messages for an authenticated user and
//! normalizes them into Session Broker calls. Two shapes arrive: a bare OTP code, or the
//! text payload of a decoded authenticator-export QR code (`otpauth-migration://` or
//! `otpauth://totp/`). Decoding the QR image itself is the chat-bot HTTP surface's job
//! (out of core scope, spec §6); this module only ever sees the URI text it recovered.

// crates.io
use base64::{Engine, engine::general_purpose::STANDARD};
// self
use crate::{
	_prelude::*,
	auth::UserId,
	broker::{Broker, SubmitCodeOutcome},
	upstream::UpstreamClient,
};

/// A small allow-list of Upstream TOTP issuer substrings, matched case-insensitively
/// (spec §4.I.2). Generalized past the one real institution name this was distilled from:
/// any authenticator export tagged as belonging to this broker's own identity provider.
const UPSTREAM_ISSUER_PATTERNS: &[&str] = &["upstream", "keycloak-edu", "sso-portal"];

/// One inbound chat message, already classified by shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
	/// A bare numeric (or alphanumeric) one-time code, destined for `submit_code`.
	OtpCode(String),
	/// The decoded text of an authenticator-export QR code: either an
	/// `otpauth-migration://offline?data=...` URI or a plain `otpauth://totp/...` URI.
	TotpUri(String),
}

/// What handling an [`InboundMessage`] resulted in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeOutcome {
	/// The code was forwarded to `submit_code`; carries its outcome unchanged.
	SubmittedCode(SubmitCodeOutcome),
	/// A TOTP seed was extracted and stored via `set_totp_seed`.
	TotpSeedStored,
}

/// Classifies and dispatches inbound chat messages (spec §4.I).
pub struct BotBridge<U: UpstreamClient> {
	broker: Arc<Broker<U>>,
}
impl<U: UpstreamClient> BotBridge<U> {
	/// Builds a bridge delegating to `broker`.
	pub fn new(broker: Arc<Broker<U>>) -> Self {
		Self { broker }
	}

	/// Handles one inbound message for `user`, forwarding to the broker as appropriate.
	pub async fn handle_message(
		&self,
		user: UserId,
		message: InboundMessage,
		now: OffsetDateTime,
	) -> Result<BridgeOutcome> {
		match message {
			InboundMessage::OtpCode(code) => {
				let outcome = self.broker.submit_code(user, code.trim(), now).await?;

				Ok(BridgeOutcome::SubmittedCode(outcome))
			},
			InboundMessage::TotpUri(uri) => {
				let (secret, _issuer) = parse_totp_payload(&uri)?;

				self.broker.set_totp_seed(user, &secret).await?;

				Ok(BridgeOutcome::TotpSeedStored)
			},
		}
	}
}

/// One OTP entry recovered from a Google Authenticator migration payload: a raw secret and
/// its issuer (or account name, when no issuer field was set).
struct MigrationEntry {
	secret: Vec<u8>,
	issuer: String,
}

/// Parses either authenticator-export URI shape and returns `(secret_base32, issuer)`.
///
/// For a migration payload carrying more than one entry, the issuer allow-list selects
/// among them; ties against the allow-list with no match are an error unless exactly one
/// entry exists, in which case it passes through regardless of issuer (spec §4.I.2).
pub fn parse_totp_payload(uri: &str) -> Result<(String, Option<String>)> {
	if let Some(query) = uri.strip_prefix("otpauth-migration://offline?").or_else(|| {
		uri.strip_prefix("otpauth-migration://").and_then(|rest| rest.split_once('?').map(|(_, q)| q))
	}) {
		return parse_migration_uri(query);
	}

	if uri.starts_with("otpauth://totp/") {
		return parse_plain_otpauth_uri(uri);
	}

	Err(Error::validation("unrecognized authenticator URI scheme"))
}

fn parse_migration_uri(query: &str) -> Result<(String, Option<String>)> {
	let data_param = query_params(query)
		.into_iter()
		.find(|(key, _)| key == "data")
		.map(|(_, value)| value)
		.ok_or_else(|| Error::validation("migration URI is missing its `data` parameter"))?;

	let decoded = percent_decode(&data_param);
	let raw = STANDARD
		.decode(decoded.as_bytes())
		.map_err(|e| Error::validation(format!("migration payload is not valid base64: {e}")))?;
	let entries = decode_migration_message(&raw)?;

	if entries.is_empty() {
		return Err(Error::validation("migration payload contained no OTP entries"));
	}

	if let Some(matched) = entries.iter().find(|entry| is_upstream_totp(&entry.issuer)) {
		return Ok((base32_encode_no_padding(&matched.secret), Some(matched.issuer.clone())));
	}

	if let [only] = entries.as_slice() {
		return Ok((base32_encode_no_padding(&only.secret), Some(only.issuer.clone())));
	}

	Err(Error::validation(format!(
		"found {} OTP entries but none matched the expected issuer",
		entries.len()
	)))
}

fn parse_plain_otpauth_uri(uri: &str) -> Result<(String, Option<String>)> {
	let query = uri.split_once('?').map(|(_, q)| q).unwrap_or_default();
	let params = query_params(query);
	let secret = params
		.iter()
		.find(|(key, _)| key == "secret")
		.map(|(_, value)| value.clone())
		.ok_or_else(|| Error::validation("otpauth URI is missing its `secret` parameter"))?;
	let issuer = params.iter().find(|(key, _)| key == "issuer").map(|(_, value)| percent_decode(value)).or_else(|| {
		let label = uri.strip_prefix("otpauth://totp/")?.split('?').next()?;
		let label = percent_decode(label);

		label.split_once(':').map(|(issuer, _)| issuer.to_owned())
	});

	Ok((secret, issuer))
}

/// Splits a query string into raw `(key, value)` pairs, undoing `+` → space only (callers
/// percent-decode the values they actually use).
fn query_params(query: &str) -> Vec<(String, String)> {
	query
		.split('&')
		.filter(|pair| !pair.is_empty())
		.map(|pair| match pair.split_once('=') {
			Some((key, value)) => (key.replace('+', " "), value.replace('+', " ")),
			None => (pair.replace('+', " "), String::new()),
		})
		.collect()
}

fn percent_decode(input: &str) -> String {
	let bytes = input.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;

	while i < bytes.len() {
		if bytes[i] == b'%' && i + 2 < bytes.len() {
			if let Ok(value) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
				out.push(value);
				i += 3;
				continue;
			}
		}

		out.push(bytes[i]);
		i += 1;
	}

	String::from_utf8_lossy(&out).into_owned()
}

/// Case-insensitive substring match against [`UPSTREAM_ISSUER_PATTERNS`].
fn is_upstream_totp(issuer: &str) -> bool {
	let issuer = issuer.to_lowercase();

	UPSTREAM_ISSUER_PATTERNS.iter().any(|pattern| issuer.contains(pattern))
}

/// Encodes `bytes` as unpadded RFC 4648 base32 (the shape TOTP seeds are conventionally
/// shared in; `totp-rs`'s decoder accepts it directly). Hand-rolled rather than pulling in
/// a dedicated crate: this is the only place in the broker that needs base32, mirroring how
/// [`crate::upstream::grpc_web`] hand-rolls its own narrow wire format instead of reaching
/// for a general protobuf codec.
fn base32_encode_no_padding(bytes: &[u8]) -> String {
	const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

	let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
	let mut buffer: u64 = 0;
	let mut bits = 0u32;

	for &byte in bytes {
		buffer = (buffer << 8) | u64::from(byte);
		bits += 8;

		while bits >= 5 {
			bits -= 5;
			let index = ((buffer >> bits) & 0x1F) as usize;

			out.push(ALPHABET[index] as char);
		}
	}

	if bits > 0 {
		let index = ((buffer << (5 - bits)) & 0x1F) as usize;

		out.push(ALPHABET[index] as char);
	}

	out
}

/// Minimal protobuf field reader for the one fixed `MIGRATION_TYPEDEF` shape the original
/// importer used (spec §4.I.2, SPEC_FULL.md): repeated field 1 (`OtpParameters` messages),
/// each carrying field 1 (secret bytes), field 2 (name), field 3 (issuer). Every other field
/// in the original schema (algorithm, digits, type) is read and discarded — this broker
/// never needs anything but the secret and a display issuer.
fn decode_migration_message(data: &[u8]) -> Result<Vec<MigrationEntry>> {
	let top = decode_fields(data)?;
	let mut entries = Vec::new();

	for (field_number, value) in top {
		if field_number != 1 {
			continue;
		}

		let FieldValue::Bytes(message_bytes) = value else { continue };
		let fields = decode_fields(&message_bytes)?;
		let mut secret = None;
		let mut name = String::new();
		let mut issuer = String::new();

		for (inner_number, inner_value) in fields {
			match (inner_number, inner_value) {
				(1, FieldValue::Bytes(bytes)) => secret = Some(bytes),
				(2, FieldValue::Bytes(bytes)) => name = String::from_utf8_lossy(&bytes).into_owned(),
				(3, FieldValue::Bytes(bytes)) => issuer = String::from_utf8_lossy(&bytes).into_owned(),
				_ => {},
			}
		}

		let Some(secret) = secret else { continue };
		let issuer = if issuer.is_empty() {
			name.split_once(':').map(|(issuer, _)| issuer.to_owned()).unwrap_or(name)
		} else {
			issuer
		};

		entries.push(MigrationEntry { secret, issuer });
	}

	Ok(entries)
}

/// One decoded protobuf field value: this reader only distinguishes varints (wire type 0)
/// from length-delimited bytes (wire type 2) — every field this module cares about is one
/// of those two shapes, and any other wire type is skipped without interpretation.
enum FieldValue {
	Varint(u64),
	Bytes(Vec<u8>),
}

fn decode_fields(data: &[u8]) -> Result<Vec<(u32, FieldValue)>> {
	let mut fields = Vec::new();
	let mut offset = 0;

	while offset < data.len() {
		let (tag, tag_len) = read_varint(&data[offset..])
			.ok_or_else(|| Error::validation("truncated protobuf tag in migration payload"))?;
		offset += tag_len;

		let field_number = (tag >> 3) as u32;
		let wire_type = tag & 0x7;

		match wire_type {
			0 => {
				let (value, len) = read_varint(&data[offset..])
					.ok_or_else(|| Error::validation("truncated varint in migration payload"))?;

				offset += len;
				fields.push((field_number, FieldValue::Varint(value)));
			},
			2 => {
				let (len, len_len) = read_varint(&data[offset..])
					.ok_or_else(|| Error::validation("truncated length prefix in migration payload"))?;

				offset += len_len;
				let len = len as usize;

				if offset + len > data.len() {
					return Err(Error::validation("length-delimited field runs past end of buffer"));
				}

				fields.push((field_number, FieldValue::Bytes(data[offset..offset + len].to_vec())));
				offset += len;
			},
			_ => return Err(Error::validation(format!("unsupported protobuf wire type {wire_type}"))),
		}
	}

	Ok(fields)
}

fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
	let mut value = 0u64;
	let mut shift = 0u32;

	for (i, &byte) in data.iter().enumerate() {
		value |= u64::from(byte & 0x7F) << shift;

		if byte & 0x80 == 0 {
			return Some((value, i + 1));
		}

		shift += 7;

		if shift >= 64 {
			return None;
		}
	}

	None
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
		loop {
			let byte = (value & 0x7F) as u8;

			value >>= 7;

			if value == 0 {
				out.push(byte);
				break;
			}

			out.push(byte | 0x80);
		}
	}

	fn encode_length_delimited(field_number: u32, payload: &[u8], out: &mut Vec<u8>) {
		encode_varint(u64::from(field_number << 3 | 2), out);
		encode_varint(payload.len() as u64, out);
		out.extend_from_slice(payload);
	}

	fn encode_otp_parameter(secret: &[u8], name: &str, issuer: &str) -> Vec<u8> {
		let mut message = Vec::new();

		encode_length_delimited(1, secret, &mut message);
		encode_length_delimited(2, name.as_bytes(), &mut message);
		encode_length_delimited(3, issuer.as_bytes(), &mut message);

		message
	}

	fn encode_migration_message(entries: &[(&[u8], &str, &str)]) -> Vec<u8> {
		let mut out = Vec::new();

		for (secret, name, issuer) in entries {
			let entry = encode_otp_parameter(secret, name, issuer);

			encode_length_delimited(1, &entry, &mut out);
		}

		out
	}

	#[test]
	fn base32_encodes_without_padding() {
		assert_eq!(base32_encode_no_padding(b"hello"), "NBSWY3DP");
		assert_eq!(base32_encode_no_padding(&[]), "");
	}

	#[test]
	fn plain_otpauth_uri_extracts_secret_and_issuer() {
		let uri = "otpauth://totp/Upstream%20SSO:student%40example.com?secret=JBSWY3DPEHPK3PXP&issuer=Upstream%20SSO";
		let (secret, issuer) = parse_totp_payload(uri).expect("should parse");

		assert_eq!(secret, "JBSWY3DPEHPK3PXP");
		assert_eq!(issuer.as_deref(), Some("Upstream SSO"));
	}

	#[test]
	fn plain_otpauth_uri_without_issuer_param_falls_back_to_label() {
		let uri = "otpauth://totp/MyOrg:alice?secret=ABCDEFGH";
		let (secret, issuer) = parse_totp_payload(uri).expect("should parse");

		assert_eq!(secret, "ABCDEFGH");
		assert_eq!(issuer.as_deref(), Some("MyOrg"));
	}

	#[test]
	fn plain_otpauth_uri_missing_secret_is_rejected() {
		let uri = "otpauth://totp/MyOrg:alice?issuer=MyOrg";

		assert!(parse_totp_payload(uri).is_err());
	}

	#[test]
	fn migration_payload_with_single_entry_passes_through_regardless_of_issuer() {
		let message = encode_migration_message(&[(b"rawsecret", "student@example.com", "SomeOtherApp")]);
		let data_b64 = STANDARD.encode(message);
		let uri = format!("otpauth-migration://offline?data={}", urlencode(&data_b64));

		let (secret, issuer) = parse_totp_payload(&uri).expect("single entry should pass through");

		assert_eq!(secret, base32_encode_no_padding(b"rawsecret"));
		assert_eq!(issuer.as_deref(), Some("SomeOtherApp"));
	}

	#[test]
	fn migration_payload_selects_the_upstream_entry_among_several() {
		let message = encode_migration_message(&[
			(b"othersecret", "bob@example.com", "GitHub"),
			(b"upstreamsecret", "bob@example.com", "Upstream SSO"),
		]);
		let data_b64 = STANDARD.encode(message);
		let uri = format!("otpauth-migration://offline?data={}", urlencode(&data_b64));

		let (secret, issuer) = parse_totp_payload(&uri).expect("should find the Upstream entry");

		assert_eq!(secret, base32_encode_no_padding(b"upstreamsecret"));
		assert_eq!(issuer.as_deref(), Some("Upstream SSO"));
	}

	#[test]
	fn migration_payload_with_several_entries_and_no_match_is_an_error() {
		let message = encode_migration_message(&[
			(b"a", "bob@example.com", "GitHub"),
			(b"b", "bob@example.com", "Google"),
		]);
		let data_b64 = STANDARD.encode(message);
		let uri = format!("otpauth-migration://offline?data={}", urlencode(&data_b64));

		assert!(parse_totp_payload(&uri).is_err());
	}

	#[test]
	fn migration_payload_with_no_entries_is_an_error() {
		let data_b64 = STANDARD.encode(Vec::<u8>::new());
		let uri = format!("otpauth-migration://offline?data={}", urlencode(&data_b64));

		assert!(parse_totp_payload(&uri).is_err());
	}

	#[test]
	fn unrecognized_scheme_is_rejected() {
		assert!(parse_totp_payload("https://example.com").is_err());
	}

	#[test]
	fn issuer_allow_list_is_case_insensitive() {
		assert!(is_upstream_totp("UPSTREAM SSO"));
		assert!(is_upstream_totp("Keycloak-EDU"));
		assert!(!is_upstream_totp("GitHub"));
	}

	fn urlencode(input: &str) -> String {
		let mut out = String::with_capacity(input.len());

		for byte in input.bytes() {
			match byte {
				b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
				_ => out.push_str(&format!("%{byte:02X}")),
			}
		}

		out
	}
}
