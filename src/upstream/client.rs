//! Reqwest-backed [`UpstreamClient`] (spec §4.B). Redirects are followed by hand so every
//! hop's `Set-Cookie` headers are captured into our own [`SessionCookies`] model instead of
//! being absorbed into a client-owned jar we couldn't read back out of.

// std
use std::time::Duration as StdDuration;
// crates.io
use reqwest::{
	Method as ReqwestMethod, StatusCode,
	header::{COOKIE, LOCATION, ORIGIN, REFERER, SET_COOKIE, USER_AGENT},
	redirect::Policy,
};
// self
use crate::{
	_prelude::*,
	error::{ChallengeKind, ConfigError},
	store::{Cookie, SessionCookies},
	upstream::{CallOutcome, EmptyPredicate, LoginOutcome, Method, UpstreamClient, UpstreamFuture, html},
};

const DEFAULT_LOGIN_PAGE_URL: &str = "https://sso.upstream.example/realms/university/protocol/openid-connect/auth?client_id=mobile&response_type=code&redirect_uri=https%3A%2F%2Fattendance.upstream.example%2Fcallback";
const MAX_REDIRECTS: u8 = 10;

struct RawResponse {
	cookies: SessionCookies,
	body: String,
	final_url: Url,
}

/// Upstream transport built on `reqwest`. Each public operation is a bounded, hand-rolled
/// redirect loop rather than `reqwest`'s automatic follower, because the broker needs the
/// full cookie set accumulated across every hop (spec §6: "persisted verbatim").
pub struct ReqwestUpstreamClient {
	client: ReqwestClient,
	login_page_url: Url,
	sso_host: String,
}
impl ReqwestUpstreamClient {
	/// Builds a client with a process-default timeout and the built-in SSO entry point.
	pub fn new(http_timeout_seconds: u64) -> Result<Self, ConfigError> {
		let client = Self::build_client(http_timeout_seconds)?;

		Ok(Self::with_client(client))
	}

	/// Wraps an already-configured `reqwest::Client`, using the built-in SSO entry point.
	/// Tests that point the client at a mock server should use [`Self::with_login_page`]
	/// instead.
	pub fn with_client(client: ReqwestClient) -> Self {
		Self::with_login_page(
			client,
			Url::parse(DEFAULT_LOGIN_PAGE_URL).expect("default login page URL is valid"),
		)
	}

	/// Wraps an already-configured `reqwest::Client` with an explicit SSO entry point.
	pub fn with_login_page(client: ReqwestClient, login_page_url: Url) -> Self {
		let sso_host = login_page_url.host_str().unwrap_or_default().to_owned();

		Self { client, login_page_url, sso_host }
	}

	fn build_client(timeout_seconds: u64) -> Result<ReqwestClient, ConfigError> {
		ReqwestClient::builder()
			.redirect(Policy::none())
			.timeout(StdDuration::from_secs(timeout_seconds))
			.build()
			.map_err(|e| ConfigError::HttpClientBuild { detail: e.to_string() })
	}

	async fn fetch(
		&self,
		method: ReqwestMethod,
		url: Url,
		cookies: &SessionCookies,
		mut form: Option<&[(&str, &str)]>,
		user_agent: &str,
	) -> Result<RawResponse> {
		let mut current_url = url;
		let mut jar = cookies.clone();

		for _ in 0..MAX_REDIRECTS {
			let origin = format!(
				"{}://{}",
				current_url.scheme(),
				current_url.host_str().unwrap_or_default()
			);
			let mut builder = self
				.client
				.request(method.clone(), current_url.clone())
				.header(USER_AGENT, user_agent)
				.header(ORIGIN, origin.clone())
				.header(REFERER, origin);

			if !jar.is_empty() {
				builder = builder.header(COOKIE, cookie_header_value(&jar));
			}
			if let Some(fields) = form {
				builder = builder.form(fields);
			}

			let response = builder
				.send()
				.await
				.map_err(|e| Error::transient(format!("Upstream request failed: {e}")))?;

			jar = merge_set_cookie_headers(&jar, &response, &current_url);

			if response.status().is_redirection() {
				let location = response
					.headers()
					.get(LOCATION)
					.and_then(|v| v.to_str().ok())
					.ok_or_else(|| Error::transient("Upstream redirected without a Location header."))?;

				current_url = current_url
					.join(location)
					.map_err(|e| Error::transient(format!("Upstream redirect target is invalid: {e}")))?;
				form = None;

				continue;
			}

			let final_url = current_url;
			let body = response
				.text()
				.await
				.map_err(|e| Error::transient(format!("Failed to read Upstream response body: {e}")))?;

			return Ok(RawResponse { cookies: jar, body, final_url });
		}

		Err(Error::transient("Upstream SSO exchange exceeded the redirect limit."))
	}

	fn classify_login_response(&self, response: RawResponse, wrong_code: bool) -> Result<LoginOutcome> {
		if response.final_url.host_str() != Some(self.sso_host.as_str()) {
			return Ok(LoginOutcome::Success { cookies: response.cookies });
		}

		match html::classify(&response.body) {
			html::Classification::Success => Ok(LoginOutcome::Success { cookies: response.cookies }),
			html::Classification::BadCredentials => Ok(LoginOutcome::BadCredentials),
			html::Classification::Totp { submit_action, credential_id, available_credentials } => {
				let submit_url = self.resolve_submit_action(submit_action, &response.final_url)?;

				Ok(LoginOutcome::TotpChallenge {
					continuation_cookies: response.cookies,
					submit_url,
					credential_id,
					available_credentials,
					wrong_code,
				})
			},
			html::Classification::EmailCode { submit_action } => {
				let submit_url = self.resolve_submit_action(submit_action, &response.final_url)?;

				Ok(LoginOutcome::EmailCodeChallenge {
					continuation_cookies: response.cookies,
					submit_url,
					wrong_code,
				})
			},
			html::Classification::Unknown =>
				Err(Error::transient("Unrecognized Upstream SSO response shape.")),
		}
	}

	fn resolve_submit_action(&self, action: Option<String>, base: &Url) -> Result<Url> {
		let action = action
			.ok_or_else(|| Error::transient("Upstream challenge page did not include a submit action."))?;

		base.join(&action).map_err(|e| Error::transient(format!("invalid challenge submit action: {e}")))
	}
}
impl UpstreamClient for ReqwestUpstreamClient {
	fn begin_login<'a>(
		&'a self,
		login: &'a str,
		password: &'a str,
		user_agent: &'a str,
	) -> UpstreamFuture<'a, LoginOutcome> {
		Box::pin(async move {
			let entry = self
				.fetch(ReqwestMethod::GET, self.login_page_url.clone(), &SessionCookies::default(), None, user_agent)
				.await?;

			if entry.final_url.host_str() != Some(self.sso_host.as_str()) {
				return Ok(LoginOutcome::Success { cookies: entry.cookies });
			}

			let action = html::extract_form_action(&entry.body).ok_or_else(|| {
				Error::transient("Login form action not found on Upstream's SSO entry page.")
			})?;
			let action_url = entry
				.final_url
				.join(&action)
				.map_err(|e| Error::transient(format!("invalid login form action: {e}")))?;
			let form = [("username", login), ("password", password), ("login", "Вход")];
			let post = self.fetch(ReqwestMethod::POST, action_url, &entry.cookies, Some(&form), user_agent).await?;

			self.classify_login_response(post, false)
		})
	}

	fn submit_code<'a>(
		&'a self,
		kind: ChallengeKind,
		code: &'a str,
		continuation_cookies: &'a SessionCookies,
		submit_url: &'a Url,
		credential_id: Option<&'a str>,
		user_agent: &'a str,
	) -> UpstreamFuture<'a, LoginOutcome> {
		Box::pin(async move {
			let field_name = match kind {
				ChallengeKind::Totp => "otp",
				ChallengeKind::EmailCode => "email_code",
			};
			let mut form: Vec<(&str, &str)> = vec![(field_name, code), ("login", "Вход")];

			if let Some(credential_id) = credential_id {
				form.push(("selectedCredentialId", credential_id));
			}

			let response = self
				.fetch(ReqwestMethod::POST, submit_url.clone(), continuation_cookies, Some(&form), user_agent)
				.await?;

			self.classify_login_response(response, true)
		})
	}

	fn call<'a>(
		&'a self,
		method: Method,
		url: &'a Url,
		cookies: &'a SessionCookies,
		headers: &'a [(String, String)],
		body: Option<&'a [u8]>,
		user_agent: &'a str,
		empty_if: Option<EmptyPredicate<'a>>,
	) -> UpstreamFuture<'a, CallOutcome> {
		Box::pin(async move {
			let reqwest_method = match method {
				Method::Get => ReqwestMethod::GET,
				Method::Post => ReqwestMethod::POST,
			};
			let mut builder = self
				.client
				.request(reqwest_method, url.clone())
				.header(USER_AGENT, user_agent)
				.header(COOKIE, cookie_header_value(cookies));

			for (name, value) in headers {
				builder = builder.header(name.as_str(), value.as_str());
			}
			if let Some(bytes) = body {
				builder = builder.body(bytes.to_vec());
			}

			let response = match builder.send().await {
				Ok(response) => response,
				Err(e) => return Ok(CallOutcome::Transport { detail: format!("Upstream call failed: {e}") }),
			};

			if response.status() == StatusCode::UNAUTHORIZED {
				return Ok(CallOutcome::Unauthorized);
			}
			if !response.status().is_success() {
				return Ok(CallOutcome::Transport {
					detail: format!("Upstream responded with status {}", response.status()),
				});
			}

			let bytes = match response.bytes().await {
				Ok(bytes) => bytes.to_vec(),
				Err(e) =>
					return Ok(CallOutcome::Transport {
						detail: format!("Failed to read Upstream response body: {e}"),
					}),
			};

			if let Some(predicate) = empty_if {
				if predicate(&bytes) {
					return Ok(CallOutcome::Empty);
				}
			}

			Ok(CallOutcome::Ok { bytes })
		})
	}
}

fn cookie_header_value(cookies: &SessionCookies) -> String {
	cookies.iter().map(|c| format!("{}={}", c.name, c.value)).collect::<Vec<_>>().join("; ")
}

fn merge_set_cookie_headers(
	existing: &SessionCookies,
	response: &reqwest::Response,
	request_url: &Url,
) -> SessionCookies {
	let mut by_name: BTreeMap<String, Cookie> =
		existing.iter().cloned().map(|c| (c.name.clone(), c)).collect();

	for raw in response.headers().get_all(SET_COOKIE) {
		if let Ok(raw_str) = raw.to_str() {
			if let Some(cookie) = parse_set_cookie(raw_str, request_url) {
				by_name.insert(cookie.name.clone(), cookie);
			}
		}
	}

	by_name.into_values().collect()
}

fn parse_set_cookie(raw: &str, request_url: &Url) -> Option<Cookie> {
	let mut parts = raw.split(';').map(str::trim);
	let (name, value) = parts.next()?.split_once('=')?;
	let mut cookie = Cookie {
		name: name.trim().to_owned(),
		value: value.trim().to_owned(),
		domain: request_url.host_str().unwrap_or_default().to_owned(),
		path: "/".to_owned(),
		secure: false,
		http_only: false,
		expires_at: None,
	};

	for attr in parts {
		let mut kv = attr.splitn(2, '=');
		let key = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
		let value = kv.next().map(str::trim);

		match key.as_str() {
			"domain" =>
				if let Some(value) = value {
					cookie.domain = value.trim_start_matches('.').to_owned();
				},
			"path" =>
				if let Some(value) = value {
					cookie.path = value.to_owned();
				},
			"secure" => cookie.secure = true,
			"httponly" => cookie.http_only = true,
			"max-age" =>
				if let Some(seconds) = value.and_then(|v| v.parse::<i64>().ok()) {
					cookie.expires_at = Some(OffsetDateTime::now_utc() + Duration::seconds(seconds));
				},
			_ => {},
		}
	}

	Some(cookie)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn parse_set_cookie_reads_name_value_and_attributes() {
		let cookie = parse_set_cookie(
			"KC_RESTART=abc123; Path=/realms/university; Domain=.sso.upstream.example; Secure; HttpOnly; Max-Age=300",
			&Url::parse("https://sso.upstream.example/realms/university/login").unwrap(),
		)
		.expect("should parse");

		assert_eq!(cookie.name, "KC_RESTART");
		assert_eq!(cookie.value, "abc123");
		assert_eq!(cookie.path, "/realms/university");
		assert_eq!(cookie.domain, "sso.upstream.example");
		assert!(cookie.secure);
		assert!(cookie.http_only);
		assert!(cookie.expires_at.is_some());
	}

	#[test]
	fn parse_set_cookie_defaults_domain_and_path() {
		let cookie = parse_set_cookie(
			"session=xyz",
			&Url::parse("https://sso.upstream.example/login").unwrap(),
		)
		.expect("should parse");

		assert_eq!(cookie.domain, "sso.upstream.example");
		assert_eq!(cookie.path, "/");
		assert!(!cookie.secure);
	}

	#[test]
	fn cookie_header_value_joins_pairs() {
		let cookies: SessionCookies = vec![
			Cookie {
				name: "a".into(),
				value: "1".into(),
				domain: "x".into(),
				path: "/".into(),
				secure: false,
				http_only: false,
				expires_at: None,
			},
			Cookie {
				name: "b".into(),
				value: "2".into(),
				domain: "x".into(),
				path: "/".into(),
				secure: false,
				http_only: false,
				expires_at: None,
			},
		]
		.into_iter()
		.collect();

		assert_eq!(cookie_header_value(&cookies), "a=1; b=2");
	}

	#[test]
	fn with_login_page_derives_sso_host() {
		let client = ReqwestUpstreamClient::with_login_page(
			ReqwestClient::new(),
			Url::parse("https://mock.test.local:4321/auth").unwrap(),
		);

		assert_eq!(client.sso_host, "mock.test.local");
	}
}
