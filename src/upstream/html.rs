//! Challenge-page classification and field extraction (spec §4.B.1, §4.B.2).
//!
//! Upstream's SSO surface renders one of four HTML shapes after a credential or code
//! submission: a redirect away from the SSO host (success), a TOTP challenge form, an
//! email-code challenge form, or the original login form re-rendered with an error banner
//! (bad credentials). Everything here is read-only string inspection; nothing in this
//! module performs I/O.

// std
use std::sync::LazyLock;
// crates.io
use regex::Regex;
// self
use crate::{_prelude::*, error::CredentialOption};

static LOGIN_ACTION_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#""loginAction"\s*:\s*"([^"]+)""#).expect("static regex"));
static FORM_ACTION_RE: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r#"(?i)<form[^>]*\baction="([^"]*)""#).expect("static regex"));
static SELECTED_CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r#""selectedCredentialId"\s*:\s*"([^"]+)""#).expect("static regex")
});
static CREDENTIALS_RE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r#""userOtpCredentials"\s*:\s*(\[[^\]]*\])"#).expect("static regex")
});

const TOTP_MARKERS: &[&str] = &["kc-totp-login-form", "name=\"otp\"", "totp-form"];
const EMAIL_CODE_MARKERS: &[&str] = &["kc-email-code-form", "name=\"email_code\"", "emailCodeForm"];
const BAD_CREDENTIALS_MARKERS: &[&str] =
	&["kc-feedback-text", "invalidUserMessage", "Invalid username or password"];

/// Outcome of inspecting a response body for a known Upstream HTML shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
	/// The response redirected away from the SSO host; the exchange is complete.
	Success,
	/// A TOTP challenge form was rendered.
	Totp {
		/// Relative or absolute form `action` to submit the code to.
		submit_action: Option<String>,
		/// Upstream's preselected credential id, if present.
		credential_id: Option<String>,
		/// Alternative credentials parsed out of `userOtpCredentials`.
		available_credentials: Vec<CredentialOption>,
	},
	/// An email one-time-code challenge form was rendered.
	EmailCode {
		/// Relative or absolute form `action` to submit the code to.
		submit_action: Option<String>,
	},
	/// The login form was re-rendered with an invalid-credentials banner.
	BadCredentials,
	/// None of the known shapes matched; the caller should treat this as a transient
	/// Upstream failure rather than guess.
	Unknown,
}

/// Classifies a response body already known to have stayed on `sso_host` (the caller is
/// responsible for checking the final URL's host first and short-circuiting to
/// [`Classification::Success`] otherwise).
pub fn classify(body: &str) -> Classification {
	if contains_any(body, BAD_CREDENTIALS_MARKERS) {
		return Classification::BadCredentials;
	}

	if contains_any(body, TOTP_MARKERS) {
		return Classification::Totp {
			submit_action: extract_form_action(body),
			credential_id: extract_selected_credential_id(body),
			available_credentials: extract_available_credentials(body),
		};
	}

	if contains_any(body, EMAIL_CODE_MARKERS) {
		return Classification::EmailCode { submit_action: extract_form_action(body) };
	}

	Classification::Unknown
}

fn contains_any(body: &str, markers: &[&str]) -> bool {
	markers.iter().any(|marker| body.contains(marker))
}

/// Extracts the form submission target, preferring the JSON-embedded `loginAction` field
/// (Keycloak's templates inline it for client-side validation) and falling back to the
/// rendered `<form action="...">`.
pub fn extract_form_action(body: &str) -> Option<String> {
	LOGIN_ACTION_RE
		.captures(body)
		.or_else(|| FORM_ACTION_RE.captures(body))
		.and_then(|captures| captures.get(1))
		.map(|m| decode_js_string(m.as_str()))
}

fn extract_selected_credential_id(body: &str) -> Option<String> {
	SELECTED_CREDENTIAL_RE.captures(body).and_then(|c| c.get(1)).map(|m| decode_js_string(m.as_str()))
}

#[derive(Deserialize)]
struct RawCredential {
	id: String,
	#[serde(default)]
	user_label: Option<String>,
}

fn extract_available_credentials(body: &str) -> Vec<CredentialOption> {
	let Some(captures) = CREDENTIALS_RE.captures(body) else {
		return Vec::new();
	};
	let Some(raw_json) = captures.get(1) else {
		return Vec::new();
	};

	serde_json::from_str::<Vec<RawCredential>>(&decode_js_string(raw_json.as_str()))
		.unwrap_or_default()
		.into_iter()
		.map(|raw| CredentialOption { label: raw.user_label.unwrap_or_else(|| raw.id.clone()), id: raw.id })
		.collect()
}

/// Undoes the JSON/JS string escaping Keycloak's templates apply when inlining values
/// (`\/` for `/`, `\uXXXX` for non-ASCII) without pulling in a full JS-string parser.
fn decode_js_string(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars().peekable();

	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}

		match chars.peek() {
			Some('/') => {
				out.push('/');
				chars.next();
			},
			Some('u') => {
				chars.next();

				let hex: String = chars.by_ref().take(4).collect();

				if let Some(decoded) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
					out.push(decoded);
				}
			},
			Some(other) => {
				out.push(*other);
				chars.next();
			},
			None => out.push('\\'),
		}
	}

	out
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn classifies_totp_form_with_login_action_and_credentials() {
		let body = r#"
			<div id="kc-totp-login-form">
				<script>var settings = {"loginAction":"https:\/\/sso.example.test\/auth?x=1",
				"selectedCredentialId":"cred-1",
				"userOtpCredentials":[{"id":"cred-1","user_label":"Phone"},{"id":"cred-2","user_label":"Backup"}]};
				</script>
			</div>
		"#;
		let classification = classify(body);

		match classification {
			Classification::Totp { submit_action, credential_id, available_credentials } => {
				assert_eq!(submit_action.as_deref(), Some("https://sso.example.test/auth?x=1"));
				assert_eq!(credential_id.as_deref(), Some("cred-1"));
				assert_eq!(available_credentials.len(), 2);
				assert_eq!(available_credentials[0].id, "cred-1");
				assert_eq!(available_credentials[1].label, "Backup");
			},
			other => panic!("Expected Totp classification, got {other:?}"),
		}
	}

	#[test]
	fn classifies_email_code_form() {
		let body = r#"<form id="kc-email-code-form" action="https://sso.example.test/auth?x=2"></form>"#;

		assert_eq!(
			classify(body),
			Classification::EmailCode { submit_action: Some("https://sso.example.test/auth?x=2".into()) }
		);
	}

	#[test]
	fn classifies_bad_credentials_banner() {
		let body = r#"<span class="kc-feedback-text">Invalid username or password.</span>"#;

		assert_eq!(classify(body), Classification::BadCredentials);
	}

	#[test]
	fn classifies_unknown_shape_as_unknown() {
		assert_eq!(classify("<html><body>maintenance</body></html>"), Classification::Unknown);
	}

	#[test]
	fn extract_form_action_falls_back_to_rendered_form() {
		let body = r#"<form id="kc-form-login" action="https://sso.example.test/login-actions/authenticate?x=3" method="post"></form>"#;

		assert_eq!(
			extract_form_action(body),
			Some("https://sso.example.test/login-actions/authenticate?x=3".into())
		);
	}
}
