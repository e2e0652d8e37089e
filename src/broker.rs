//! Session Broker (spec §4.G): the façade every other module and collaborator calls
//! through. Each public operation below follows the template from spec §4.G verbatim —
//! try the cached session, rebuild on miss/401/dead-session, resolve a TOTP challenge
//! automatically when possible, and otherwise persist a PendingChallenge and surface
//! [`Error::ChallengeRequired`] — never raw Upstream bytes or HTTP statuses.

// std
use std::sync::LazyLock;
// self
use crate::{
	_prelude::*,
	auth::UserId,
	cache::SessionCache,
	challenge::ChallengeCoordinator,
	error::{ChallengeKind, ChallengeOrigin, CredentialOption},
	marking::parser,
	notify::NotificationLimiter,
	obs::{FlowKind, FlowOutcome, FlowSpan, record_flow_outcome},
	secret_store::SecretStore,
	store::{BrokerStore, SessionCookies, UserRecord},
	totp::AutoTotpResolver,
	upstream::{CallOutcome, EmptyPredicate, LoginOutcome, Method, UpstreamClient, grpc_web, user_agent},
};

static IDENTITY_URL: LazyLock<Url> = LazyLock::new(|| {
	Url::parse("https://attendance.upstream.example/rtu_tc.rtu_attend.app.UserService/GetMeInfo")
		.expect("static URL")
});
static GROUPS_URL: LazyLock<Url> = LazyLock::new(|| {
	Url::parse(
		"https://attendance.upstream.example/rtu_tc.rtu_attend.app.UserService/GetAvailableVisitingLogsOfStudent",
	)
	.expect("static URL")
});
static SELF_APPROVE_URL: LazyLock<Url> = LazyLock::new(|| {
	Url::parse("https://attendance.upstream.example/rtu_tc.attendance.api.StudentService/SelfApproveAttendance")
		.expect("static URL")
});
static SCHEDULE_URL: LazyLock<Url> = LazyLock::new(|| {
	Url::parse("https://attendance.upstream.example/rtu_tc.rtu_attend.app.ScheduleService/GetSchedule")
		.expect("static URL")
});

/// Fixed request body the identity probe sends (a single-field protobuf message naming
/// the calling application, base64-encoded for `grpc-web-text` transport — wire-compatible
/// constant recovered from `original_source/backend/mirea_api/get_me_info.py`).
const IDENTITY_REQUEST_BODY_BASE64: &str =
	"AAAAACwKKGh0dHBzOi8vYXR0ZW5kYW5jZS1hcHAubWlyZWEucnUvc2VydmljZXMYAQ==";

/// Outcome of [`Broker::submit_code`] (spec §4.G.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitCodeOutcome {
	/// The code was accepted; the session is now live. `groups` is populated only when
	/// the completed challenge originated from an interactive login (spec §4.G.2).
	Success {
		/// The user's groups, fetched only for `origin == Login`.
		groups: Option<Vec<String>>,
	},
	/// Upstream rejected the code; the row was rotated in place and the caller may retry.
	WrongCode {
		/// Alternative credentials still available for this challenge, if any.
		credentials: Vec<CredentialOption>,
	},
}

/// The Session Broker façade (spec §4.G), generic over the Upstream transport so tests
/// can substitute a mock client without touching the broker logic.
pub struct Broker<U: UpstreamClient> {
	upstream: Arc<U>,
	store: Arc<dyn BrokerStore>,
	secrets: Arc<SecretStore>,
	cache: Arc<SessionCache>,
	coordinator: Arc<ChallengeCoordinator>,
	notifier: Arc<NotificationLimiter>,
	resolver: Arc<AutoTotpResolver>,
}
impl<U: UpstreamClient> Broker<U> {
	/// Wires every broker collaborator together.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		upstream: Arc<U>,
		store: Arc<dyn BrokerStore>,
		secrets: Arc<SecretStore>,
		cache: Arc<SessionCache>,
		coordinator: Arc<ChallengeCoordinator>,
		notifier: Arc<NotificationLimiter>,
		resolver: Arc<AutoTotpResolver>,
	) -> Self {
		Self { upstream, store, secrets, cache, coordinator, notifier, resolver }
	}

	/// Interactive first-time credential submission (spec §4.G.1). Never notifies out of
	/// band on a challenge — the caller is already on screen.
	pub async fn submit_login(
		&self,
		user: UserId,
		login: &str,
		password: &str,
		user_agent: Option<String>,
		now: OffsetDateTime,
	) -> Result<Vec<String>> {
		let span = FlowSpan::new(FlowKind::Login, "submit_login");
		record_flow_outcome(FlowKind::Login, FlowOutcome::Attempt);

		let result = span
			.instrument(async {
				let user_agent = user_agent.unwrap_or_else(user_agent::generate_random_mobile_user_agent);
				let outcome = self.upstream.begin_login(login, password, &user_agent).await?;

				match outcome {
					LoginOutcome::Success { cookies } => {
						self.cache.store(user, cookies.clone()).await?;

						let fio = self.get_identity(user, false, now).await?;

						self.persist_credentials(user, login, password, Some(user_agent.clone())).await?;
						self.update_fio(user, fio).await?;

						let groups = self.fetch_groups_list(&cookies, &user_agent).await?;

						if let Some(first) = groups.first() {
							self.update_group(user, first.clone()).await?;
						}

						Ok(groups)
					},
					LoginOutcome::TotpChallenge {
						continuation_cookies,
						submit_url,
						credential_id,
						available_credentials,
						..
					} => {
						// Credentials passed the password step; persist them optimistically
						// even if the challenge is never resolved (spec §4.G.1).
						self.persist_credentials(user, login, password, Some(user_agent.clone())).await?;

						if let Some(groups) = self
							.try_auto_totp(
								user,
								&continuation_cookies,
								&submit_url,
								credential_id.as_deref(),
								&user_agent,
								now,
							)
							.await?
						{
							return Ok(groups);
						}

						self.coordinator
							.put(
								user,
								ChallengeKind::Totp,
								ChallengeOrigin::Login,
								continuation_cookies,
								submit_url,
								credential_id,
								available_credentials.clone(),
								user_agent,
								now,
							)
							.await?;

						Err(Error::ChallengeRequired {
							kind: ChallengeKind::Totp,
							origin: ChallengeOrigin::Login,
							message: None,
							credentials: available_credentials,
						})
					},
					LoginOutcome::EmailCodeChallenge { continuation_cookies, submit_url, .. } => {
						self.persist_credentials(user, login, password, Some(user_agent.clone())).await?;
						self.coordinator
							.put(
								user,
								ChallengeKind::EmailCode,
								ChallengeOrigin::Login,
								continuation_cookies,
								submit_url,
								None,
								vec![],
								user_agent,
								now,
							)
							.await?;

						Err(Error::ChallengeRequired {
							kind: ChallengeKind::EmailCode,
							origin: ChallengeOrigin::Login,
							message: None,
							credentials: vec![],
						})
					},
					LoginOutcome::BadCredentials => Err(Error::CredentialsInvalid),
				}
			})
			.await;

		record_flow_outcome(FlowKind::Login, if result.is_ok() { FlowOutcome::Success } else { FlowOutcome::Failure });

		result
	}

	/// Completes a pending second-factor challenge (spec §4.G.2).
	pub async fn submit_code(&self, user: UserId, code: &str, now: OffsetDateTime) -> Result<SubmitCodeOutcome> {
		let span = FlowSpan::new(FlowKind::SubmitCode, "submit_code");
		record_flow_outcome(FlowKind::SubmitCode, FlowOutcome::Attempt);

		let result = span
			.instrument(async {
				let challenge = self.coordinator.get(user, now).await?.ok_or(Error::NoActiveChallenge)?;
				let outcome = self
					.upstream
					.submit_code(
						challenge.kind,
						code,
						&challenge.continuation_cookies,
						&challenge.submit_url,
						challenge.credential_id.as_deref(),
						&challenge.user_agent,
					)
					.await?;

				match outcome {
					LoginOutcome::Success { cookies } => {
						self.cache.store(user, cookies.clone()).await?;
						self.coordinator.delete(user).await?;

						if let Some(credential_id) = challenge.credential_id.clone() {
							self.maybe_confirm_auto_totp_credential(user, credential_id).await?;
						}

						let groups = if challenge.origin == ChallengeOrigin::Login {
							let groups = self.fetch_groups_list(&cookies, &challenge.user_agent).await?;

							if let Some(first) = groups.first() {
								self.update_group(user, first.clone()).await?;
							}

							let fio = self.get_identity(user, false, now).await.ok();

							if let Some(fio) = fio {
								self.update_fio(user, fio).await?;
							}

							Some(groups)
						} else {
							None
						};

						Ok(SubmitCodeOutcome::Success { groups })
					},
					LoginOutcome::TotpChallenge { continuation_cookies, submit_url, available_credentials, .. } => {
						let updated = self
							.coordinator
							.update_after_wrong_code(user, continuation_cookies, submit_url, available_credentials, now)
							.await?;

						Ok(SubmitCodeOutcome::WrongCode { credentials: updated.available_credentials })
					},
					LoginOutcome::EmailCodeChallenge { continuation_cookies, submit_url, .. } => {
						let updated = self
							.coordinator
							.update_after_wrong_code(user, continuation_cookies, submit_url, vec![], now)
							.await?;

						Ok(SubmitCodeOutcome::WrongCode { credentials: updated.available_credentials })
					},
					LoginOutcome::BadCredentials => Err(Error::CredentialsInvalid),
				}
			})
			.await;

		record_flow_outcome(
			FlowKind::SubmitCode,
			if result.is_ok() { FlowOutcome::Success } else { FlowOutcome::Failure },
		);

		result
	}

	/// Fetches the user's display name via the identity probe, rebuilding the session as
	/// needed (spec §4.G template). `background` controls whether a fresh challenge fires
	/// an out-of-band notification (spec §7: background flows notify, interactive flows
	/// never do).
	pub async fn get_identity(&self, user: UserId, background: bool, now: OffsetDateTime) -> Result<String> {
		let span = FlowSpan::new(FlowKind::SessionCall, "get_identity");

		span.instrument(async {
			let user_agent = self.resolve_user_agent(user).await?;
			let body = IDENTITY_REQUEST_BODY_BASE64.as_bytes();
			let headers = grpc_web_headers();
			let empty_if: EmptyPredicate =
				&|bytes: &[u8]| decode_grpc_web_text(bytes).map(|s| s.trim().is_empty()).unwrap_or(true);

			if let Some(cookies) = self.cache.load(user).await? {
				match self
					.upstream
					.call(Method::Post, &IDENTITY_URL, &cookies, &headers, Some(body), &user_agent, Some(empty_if))
					.await?
				{
					CallOutcome::Ok { bytes } => return decode_grpc_web_text(&bytes).map_err(Error::transient),
					CallOutcome::Transport { detail } => return Err(Error::transient(detail)),
					CallOutcome::Unauthorized | CallOutcome::Empty => self.cache.invalidate(user).await?,
				}
			}

			let cookies = self.rebuild_session(user, &user_agent, background, now).await?;

			self.cache.store(user, cookies.clone()).await?;

			match self
				.upstream
				.call(Method::Post, &IDENTITY_URL, &cookies, &headers, Some(body), &user_agent, Some(empty_if))
				.await?
			{
				CallOutcome::Ok { bytes } => decode_grpc_web_text(&bytes).map_err(Error::transient),
				CallOutcome::Transport { detail } => Err(Error::transient(detail)),
				// Boundary behavior (spec §8): an empty identity probe right after a fresh
				// SSO means the credentials themselves are bad, not a transient failure.
				CallOutcome::Unauthorized | CallOutcome::Empty => Err(Error::CredentialsInvalid),
			}
		})
		.await
	}

	/// Performs one self-approve call for `token` and returns the decoded text response
	/// (spec §4.H.2 "parse the Upstream response body"; parsing the `{group, subject}`
	/// pair out of it is the Mass-Marking Engine's job, not the broker's).
	pub async fn self_approve(
		&self,
		user: UserId,
		token: &str,
		background: bool,
		now: OffsetDateTime,
	) -> Result<String> {
		let span = FlowSpan::new(FlowKind::SessionCall, "self_approve");

		span.instrument(async {
			let body = grpc_web::encode_guid_request(token);
			let bytes = self
				.call(user, Method::Post, &SELF_APPROVE_URL, &grpc_web_headers(), Some(body.as_bytes()), background, now)
				.await?;

			decode_grpc_web_text(&bytes).map_err(Error::transient)
		})
		.await
	}

	/// Fetches the raw schedule response bytes (spec §2 data-flow note lists `fetch_schedule`
	/// alongside `get_identity`/`self_approve` as a broker operation). Schedule parsing sits
	/// above the broker and is out of scope (spec §1).
	pub async fn fetch_schedule(&self, user: UserId, background: bool, now: OffsetDateTime) -> Result<Vec<u8>> {
		self.call(user, Method::Get, &SCHEDULE_URL, &[], None, background, now).await
	}

	/// Persists an encrypted TOTP seed for a user (Bot Bridge entry point, spec §4.I). Any
	/// previously confirmed `totp_credential_id` is cleared since it was tied to the old
	/// seed's registration.
	pub async fn set_totp_seed(&self, user: UserId, seed: &str) -> Result<()> {
		let mut record = self.store.get_user(user).await?.unwrap_or_default();

		record.totp_seed_ciphertext = Some(self.secrets.encrypt(seed));
		record.totp_credential_id = None;

		self.store.put_user(user, record).await?;

		Ok(())
	}

	/// Generic session-backed Upstream call template (spec §4.G): try the cache, rebuild
	/// on miss/401/dead-session, retry at most once (spec §7 propagation policy).
	pub async fn call(
		&self,
		user: UserId,
		method: Method,
		url: &Url,
		headers: &[(String, String)],
		body: Option<&[u8]>,
		background: bool,
		now: OffsetDateTime,
	) -> Result<Vec<u8>> {
		let user_agent = self.resolve_user_agent(user).await?;

		if let Some(cookies) = self.cache.load(user).await? {
			match self.upstream.call(method, url, &cookies, headers, body, &user_agent, None).await? {
				CallOutcome::Ok { bytes } => return Ok(bytes),
				CallOutcome::Transport { detail } => return Err(Error::transient(detail)),
				CallOutcome::Unauthorized | CallOutcome::Empty => self.cache.invalidate(user).await?,
			}
		}

		let cookies = self.rebuild_session(user, &user_agent, background, now).await?;

		self.cache.store(user, cookies.clone()).await?;

		match self.upstream.call(method, url, &cookies, headers, body, &user_agent, None).await? {
			CallOutcome::Ok { bytes } => Ok(bytes),
			CallOutcome::Transport { detail } => Err(Error::transient(detail)),
			CallOutcome::Unauthorized | CallOutcome::Empty =>
				Err(Error::transient("Upstream rejected a freshly rebuilt session.")),
		}
	}

	/// Rebuilds a user's session from stored credentials, serialized per user so at most
	/// one SSO attempt is ever in flight for them (spec §5, §9 design note). Short-circuits
	/// to `ChallengeRequired` without a fresh SSO attempt if one is already pending — this
	/// is the anti-spam invariant from spec §4.D.1.
	async fn rebuild_session(
		&self,
		user: UserId,
		user_agent: &str,
		background: bool,
		now: OffsetDateTime,
	) -> Result<SessionCookies> {
		self.coordinator
			.exclusive(user, || async {
				if let Some(existing) = self.coordinator.get(user, now).await? {
					if background {
						let _ = self.notifier.maybe_notify(user, existing.kind, now).await;
					}

					return Err(Error::ChallengeRequired {
						kind: existing.kind,
						origin: ChallengeOrigin::Refresh,
						message: None,
						credentials: existing.available_credentials,
					});
				}

				let record = self.store.get_user(user).await?.ok_or(Error::UserNotFound)?;
				let login = record.login.clone().filter(|l| !l.is_empty());
				let password_ciphertext = record.password_ciphertext.clone();
				let (login, password_ciphertext) = match (login, password_ciphertext) {
					(Some(login), Some(password_ciphertext)) => (login, password_ciphertext),
					_ => return Err(Error::CredentialsInvalid),
				};
				let password = self.secrets.decrypt(&password_ciphertext)?;
				let outcome = self.upstream.begin_login(&login, &password, user_agent).await?;

				match outcome {
					LoginOutcome::Success { cookies } => Ok(cookies),
					LoginOutcome::TotpChallenge {
						continuation_cookies,
						submit_url,
						credential_id,
						available_credentials,
						..
					} => {
						if let Some(cookies) = self
							.try_auto_totp_cookies(
								user,
								&record,
								&continuation_cookies,
								&submit_url,
								credential_id.as_deref(),
								user_agent,
								now,
							)
							.await?
						{
							return Ok(cookies);
						}

						self.coordinator
							.put(
								user,
								ChallengeKind::Totp,
								ChallengeOrigin::Refresh,
								continuation_cookies,
								submit_url,
								credential_id,
								available_credentials.clone(),
								user_agent.to_owned(),
								now,
							)
							.await?;

						if background {
							let _ = self.notifier.maybe_notify(user, ChallengeKind::Totp, now).await;
						}

						Err(Error::ChallengeRequired {
							kind: ChallengeKind::Totp,
							origin: ChallengeOrigin::Refresh,
							message: None,
							credentials: available_credentials,
						})
					},
					LoginOutcome::EmailCodeChallenge { continuation_cookies, submit_url, .. } => {
						self.coordinator
							.put(
								user,
								ChallengeKind::EmailCode,
								ChallengeOrigin::Refresh,
								continuation_cookies,
								submit_url,
								None,
								vec![],
								user_agent.to_owned(),
								now,
							)
							.await?;

						if background {
							let _ = self.notifier.maybe_notify(user, ChallengeKind::EmailCode, now).await;
						}

						Err(Error::ChallengeRequired {
							kind: ChallengeKind::EmailCode,
							origin: ChallengeOrigin::Refresh,
							message: None,
							credentials: vec![],
						})
					},
					LoginOutcome::BadCredentials => Err(Error::CredentialsInvalid),
				}
			})
			.await
	}

	/// Attempts auto-2FA during a session rebuild, returning freshly cached cookies on
	/// success and persisting a newly confirmed `totp_credential_id` when none was stored.
	#[allow(clippy::too_many_arguments)]
	async fn try_auto_totp_cookies(
		&self,
		user: UserId,
		record: &UserRecord,
		continuation_cookies: &SessionCookies,
		submit_url: &Url,
		challenge_credential_id: Option<&str>,
		user_agent: &str,
		now: OffsetDateTime,
	) -> Result<Option<SessionCookies>> {
		let Some(seed_ciphertext) = record.totp_seed_ciphertext.as_ref() else { return Ok(None) };
		let Ok(seed) = self.secrets.decrypt(seed_ciphertext) else { return Ok(None) };
		let Some(outcome) = self
			.resolver
			.try_resolve(
				self.upstream.as_ref(),
				&seed,
				record.totp_credential_id.as_deref(),
				challenge_credential_id,
				continuation_cookies,
				submit_url,
				user_agent,
				now,
			)
			.await?
		else {
			return Ok(None);
		};

		if record.totp_credential_id.is_none() {
			if let Some(credential_id) = outcome.credential_id.clone() {
				self.maybe_confirm_auto_totp_credential(user, credential_id).await.ok();
			}
		}

		Ok(Some(outcome.cookies))
	}

	/// Interactive-login variant of auto-2FA resolution: returns the fetched groups list
	/// on success instead of bare cookies, since the login flow needs both.
	async fn try_auto_totp(
		&self,
		user: UserId,
		continuation_cookies: &SessionCookies,
		submit_url: &Url,
		challenge_credential_id: Option<&str>,
		user_agent: &str,
		now: OffsetDateTime,
	) -> Result<Option<Vec<String>>> {
		let Some(record) = self.store.get_user(user).await? else { return Ok(None) };
		let Some(seed_ciphertext) = record.totp_seed_ciphertext.as_ref() else { return Ok(None) };
		let Ok(seed) = self.secrets.decrypt(seed_ciphertext) else { return Ok(None) };
		let Some(outcome) = self
			.resolver
			.try_resolve(
				self.upstream.as_ref(),
				&seed,
				record.totp_credential_id.as_deref(),
				challenge_credential_id,
				continuation_cookies,
				submit_url,
				user_agent,
				now,
			)
			.await?
		else {
			return Ok(None);
		};

		self.cache.store(user, outcome.cookies.clone()).await?;

		if record.totp_credential_id.is_none() {
			if let Some(credential_id) = outcome.credential_id {
				self.maybe_confirm_auto_totp_credential(user, credential_id).await?;
			}
		}

		let groups = self.fetch_groups_list(&outcome.cookies, user_agent).await?;

		if let Some(first) = groups.first() {
			self.update_group(user, first.clone()).await?;
		}

		Ok(Some(groups))
	}

	async fn maybe_confirm_auto_totp_credential(&self, user: UserId, credential_id: String) -> Result<()> {
		let mut record = self.store.get_user(user).await?.unwrap_or_default();

		if record.totp_credential_id.is_none() {
			record.totp_credential_id = Some(credential_id);
			self.store.put_user(user, record).await?;
		}

		Ok(())
	}

	async fn persist_credentials(
		&self,
		user: UserId,
		login: &str,
		password: &str,
		user_agent: Option<String>,
	) -> Result<()> {
		let mut record = self.store.get_user(user).await?.unwrap_or_default();

		record.login = Some(login.to_owned());
		record.password_ciphertext = Some(self.secrets.encrypt(password));

		if record.user_agent.is_none() {
			record.user_agent = user_agent;
		}

		self.store.put_user(user, record).await?;

		Ok(())
	}

	async fn update_group(&self, user: UserId, group: String) -> Result<()> {
		let mut record = self.store.get_user(user).await?.unwrap_or_default();

		record.group = Some(group);
		self.store.put_user(user, record).await?;

		Ok(())
	}

	async fn update_fio(&self, user: UserId, fio: String) -> Result<()> {
		let mut record = self.store.get_user(user).await?.unwrap_or_default();

		record.fio = Some(fio);
		self.store.put_user(user, record).await?;

		Ok(())
	}

	async fn resolve_user_agent(&self, user: UserId) -> Result<String> {
		if let Some(record) = self.store.get_user(user).await? {
			if let Some(ua) = record.user_agent {
				return Ok(ua);
			}
		}

		Ok(user_agent::generate_random_mobile_user_agent())
	}

	/// Fetches and parses the user's groups list using already-live cookies (called right
	/// after a successful SSO exchange, so no rebuild template is needed here).
	async fn fetch_groups_list(&self, cookies: &SessionCookies, user_agent: &str) -> Result<Vec<String>> {
		match self
			.upstream
			.call(Method::Post, &GROUPS_URL, cookies, &grpc_web_headers(), None, user_agent, None)
			.await?
		{
			CallOutcome::Ok { bytes } => {
				let text = decode_grpc_web_text(&bytes).map_err(Error::transient)?;

				Ok(parser::extract_groups(&text))
			},
			CallOutcome::Transport { detail } => Err(Error::transient(detail)),
			CallOutcome::Unauthorized | CallOutcome::Empty => Ok(Vec::new()),
		}
	}
}

fn grpc_web_headers() -> Vec<(String, String)> {
	vec![
		("Content-Type".into(), "application/grpc-web-text".into()),
		("Accept".into(), "application/grpc-web-text".into()),
		("X-Grpc-Web".into(), "1".into()),
	]
}

fn decode_grpc_web_text(bytes: &[u8]) -> std::result::Result<String, String> {
	let text = std::str::from_utf8(bytes).map_err(|e| format!("non-UTF-8 grpc-web-text body: {e}"))?;

	grpc_web::decode_text_response(text)
}
