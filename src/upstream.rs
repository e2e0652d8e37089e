//! Upstream Client (spec §4.B): a stateless HTTP client for SSO login, OTP submission,
//! and resource calls against the third-party portal. Every call is a pure function of
//! its inputs; no session state lives in this module (the Session Cache and Challenge
//! Coordinator own that).

pub mod client;
pub mod grpc_web;
pub mod html;
pub mod user_agent;

pub use client::ReqwestUpstreamClient;

// self
use crate::{
	_prelude::*,
	error::{ChallengeKind, CredentialOption},
	store::SessionCookies,
};

/// Future returned by every [`UpstreamClient`] operation.
pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// HTTP method for [`UpstreamClient::call`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
	/// GET.
	Get,
	/// POST.
	Post,
}

/// Result of [`UpstreamClient::begin_login`] or [`UpstreamClient::submit_code`]
/// (spec §4.B.1, §4.B.2). A closed tagged union so the compiler enforces handling of
/// every Upstream outcome (spec §9 design note).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
	/// A fresh set of session cookies; the SSO exchange is complete.
	Success {
		/// Cookies accumulated across the exchange.
		cookies: SessionCookies,
	},
	/// Upstream wants a TOTP code.
	TotpChallenge {
		/// Half-finished cookie jar required to submit the code.
		continuation_cookies: SessionCookies,
		/// Absolute URL the code must be POSTed to.
		submit_url: Url,
		/// Upstream's selected (often default) credential id, if present.
		credential_id: Option<String>,
		/// Alternative credentials parsed from `userOtpCredentials`.
		available_credentials: Vec<CredentialOption>,
		/// True when this outcome is a re-classification of a wrong code resubmission.
		wrong_code: bool,
	},
	/// Upstream wants an emailed one-time code.
	EmailCodeChallenge {
		/// Half-finished cookie jar required to submit the code.
		continuation_cookies: SessionCookies,
		/// Absolute URL the code must be POSTed to.
		submit_url: Url,
		/// True when this outcome is a re-classification of a wrong code resubmission.
		wrong_code: bool,
	},
	/// Upstream rejected the username/password pair.
	BadCredentials,
}
impl LoginOutcome {
	/// The [`ChallengeKind`] this outcome represents, if it is a challenge.
	pub fn challenge_kind(&self) -> Option<ChallengeKind> {
		match self {
			Self::TotpChallenge { .. } => Some(ChallengeKind::Totp),
			Self::EmailCodeChallenge { .. } => Some(ChallengeKind::EmailCode),
			_ => None,
		}
	}
}

/// Result of [`UpstreamClient::call`] (spec §4.B.3). The client's only responsibility
/// is transport and status classification; higher-level meaning lives in the Session
/// Broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
	/// 2xx response whose body the caller did not ask to be treated as empty.
	Ok {
		/// Raw response bytes.
		bytes: Vec<u8>,
	},
	/// HTTP 401 (or an equivalent Upstream indicator).
	Unauthorized,
	/// 2xx response whose body the caller's `empty_if` predicate flagged as missing.
	Empty,
	/// Network/timeout/transport-level failure.
	Transport {
		/// Human-readable detail, safe to log.
		detail: String,
	},
}

/// Predicate deciding whether a 2xx body should be reported as [`CallOutcome::Empty`].
/// The trigger is per-call (spec §4.B.3): the identity probe treats an empty display
/// name as dead, while a schedule fetch may not.
pub type EmptyPredicate<'a> = &'a (dyn Fn(&[u8]) -> bool + Sync);

/// Contract implemented by Upstream Client transports.
pub trait UpstreamClient
where
	Self: Send + Sync,
{
	/// Performs the fixed SSO sequence described in spec §4.B.1.
	fn begin_login<'a>(
		&'a self,
		login: &'a str,
		password: &'a str,
		user_agent: &'a str,
	) -> UpstreamFuture<'a, LoginOutcome>;

	/// Submits a second-factor code against a previously-issued challenge (spec §4.B.2).
	fn submit_code<'a>(
		&'a self,
		kind: ChallengeKind,
		code: &'a str,
		continuation_cookies: &'a SessionCookies,
		submit_url: &'a Url,
		credential_id: Option<&'a str>,
		user_agent: &'a str,
	) -> UpstreamFuture<'a, LoginOutcome>;

	/// A generic authenticated call against Upstream (spec §4.B.3).
	fn call<'a>(
		&'a self,
		method: Method,
		url: &'a Url,
		cookies: &'a SessionCookies,
		headers: &'a [(String, String)],
		body: Option<&'a [u8]>,
		user_agent: &'a str,
		empty_if: Option<EmptyPredicate<'a>>,
	) -> UpstreamFuture<'a, CallOutcome>;
}
