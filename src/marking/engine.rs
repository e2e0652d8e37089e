//! Mass-Marking Engine (spec §4.H): drives a batch of `self_approve` calls to completion
//! in bounded-concurrency waves, owning the [`MarkingSession`] row exclusively for the
//! duration of a `start`/`continue_session` call (spec §3.2 ownership rule) and fanning out
//! best-effort success notifications once every target has an outcome.

// crates.io
use futures_util::future::join_all;
// self
use crate::{
	_prelude::*,
	auth::{MarkingSessionId, Secret, UserId},
	broker::Broker,
	marking::parser,
	notify::{self, NotificationSender},
	obs::{FlowKind, FlowOutcome, FlowSpan, record_flow_outcome},
	store::{AuditEvent, BrokerStore, FailureReason, MarkingSession, MarkingStatus, TargetOutcome},
	upstream::UpstreamClient,
};

const DEFAULT_CONCURRENCY: usize = 3;

/// Aggregate result of fanning out mass-marking success notifications (spec §4.H.4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotificationSummary {
	/// Number of notifications the sender reported as delivered.
	pub sent: usize,
	/// Number of notifications the sender reported as failed.
	pub failed: usize,
}

/// Combined result of a `start`/`continue_session` call: the session's state at the point
/// processing stopped, plus how the success fan-out went.
#[derive(Clone, Debug)]
pub struct MarkingOutcome {
	/// The session, updated in place through every wave this call ran.
	pub session: MarkingSession,
	/// Aggregate success-notification result for this call.
	pub notifications: NotificationSummary,
}

/// Drives mass-marking sessions to completion (spec §4.H).
pub struct MassMarkingEngine<U: UpstreamClient> {
	broker: Arc<Broker<U>>,
	store: Arc<dyn BrokerStore>,
	sender: Arc<dyn NotificationSender>,
	concurrency: usize,
}
impl<U: UpstreamClient> MassMarkingEngine<U> {
	/// Builds an engine with the default bounded-concurrency target (spec §9 design note).
	pub fn new(broker: Arc<Broker<U>>, store: Arc<dyn BrokerStore>, sender: Arc<dyn NotificationSender>) -> Self {
		Self::with_concurrency(broker, store, sender, DEFAULT_CONCURRENCY)
	}

	/// Builds an engine with an explicit wave size, mainly for tests.
	pub fn with_concurrency(
		broker: Arc<Broker<U>>,
		store: Arc<dyn BrokerStore>,
		sender: Arc<dyn NotificationSender>,
		concurrency: usize,
	) -> Self {
		Self { broker, store, sender, concurrency: concurrency.max(1) }
	}

	/// Starts a new mass-marking session over `targets` and runs it to completion or to
	/// the first unrecoverable infrastructure error (spec §4.H.1).
	pub async fn start(
		&self,
		owner: UserId,
		token: impl Into<String>,
		targets: Vec<UserId>,
		now: OffsetDateTime,
	) -> Result<MarkingOutcome> {
		let id = MarkingSessionId::generate();
		let mut session = MarkingSession::new(id, owner, Secret::new(token.into()), targets, now);

		if session.remaining.is_empty() {
			session.status = MarkingStatus::Completed;
			self.store.put_marking_session(session.clone()).await?;

			return Ok(MarkingOutcome { session, notifications: NotificationSummary::default() });
		}

		session.status = MarkingStatus::Processing;
		self.store.put_marking_session(session.clone()).await?;

		self.drain(&mut session, now).await;

		let notifications = self.send_success_notifications(&session).await;

		self.audit_completion(&session).await;

		Ok(MarkingOutcome { session, notifications })
	}

	/// Resumes a session with a freshly re-armed one-shot token (spec §4.H.3). A no-op on
	/// an already-completed or already-drained session — callers may retry `continue`
	/// freely without double-marking anyone (spec §8 testable property).
	pub async fn continue_session(
		&self,
		owner: UserId,
		session_id: &MarkingSessionId,
		token: impl Into<String>,
		now: OffsetDateTime,
	) -> Result<MarkingOutcome> {
		let mut session = self.store.get_marking_session(session_id).await?.ok_or(Error::NotFound)?;

		if session.owner != owner {
			return Err(Error::AuthorizationDenied);
		}

		if session.status == MarkingStatus::Completed || session.remaining.is_empty() {
			return Ok(MarkingOutcome { session, notifications: NotificationSummary::default() });
		}

		session.token = Secret::new(token.into());
		session.status = MarkingStatus::Continuing;
		self.store.put_marking_session(session.clone()).await?;

		self.drain(&mut session, now).await;

		let notifications = self.send_success_notifications(&session).await;

		self.audit_completion(&session).await;

		Ok(MarkingOutcome { session, notifications })
	}

	/// Runs waves of at most `concurrency` targets each until `remaining` is drained or an
	/// infrastructure error forces the session into `Error` state.
	async fn drain(&self, session: &mut MarkingSession, now: OffsetDateTime) {
		while !session.remaining.is_empty() {
			let wave: Vec<UserId> = session.remaining.iter().take(self.concurrency).copied().collect();

			self.run_wave(session, wave, now).await;

			if let Err(error) = self.store.put_marking_session(session.clone()).await {
				session.status = MarkingStatus::Error;
				session.error = Some(error.to_string());

				return;
			}
		}

		session.status = MarkingStatus::Completed;
		let _ = self.store.put_marking_session(session.clone()).await;
	}

	/// Processes one wave: every target in `wave` is attempted concurrently, and results
	/// are folded into `session` only after the whole wave finishes, so a wave never
	/// interleaves with the next one (spec §4.H.1).
	async fn run_wave(&self, session: &mut MarkingSession, wave: Vec<UserId>, now: OffsetDateTime) {
		let span = FlowSpan::new(FlowKind::MassMarkingWave, "run_wave");
		record_flow_outcome(FlowKind::MassMarkingWave, FlowOutcome::Attempt);

		let token = session.token.expose().to_owned();
		let outcomes =
			span.instrument(join_all(wave.into_iter().map(|target| self.mark_one(target, &token, now)))).await;

		record_flow_outcome(FlowKind::MassMarkingWave, FlowOutcome::Success);

		for (target, outcome) in outcomes {
			session.record(target, outcome);
		}
	}

	async fn mark_one(&self, target: UserId, token: &str, now: OffsetDateTime) -> (UserId, TargetOutcome) {
		// Mass marking is always a background flow (spec §7): a challenge on a target's
		// behalf never escalates interactively to the marker, only notifies the target.
		let outcome = match self.broker.self_approve(target, token, true, now).await {
			Ok(text) => {
				let parsed = parser::parse_self_approve_text(&text);

				if parsed.is_empty() {
					TargetOutcome::Failed { reason: FailureReason::TokenExpired }
				} else {
					TargetOutcome::Successful { group: parsed.group, subject: parsed.subject }
				}
			},
			Err(Error::ChallengeRequired { .. }) => TargetOutcome::Failed { reason: FailureReason::NeedsTwoFactor },
			Err(other) => TargetOutcome::Failed { reason: FailureReason::Other(other.to_string()) },
		};

		(target, outcome)
	}

	/// Sends the fixed success message to every target that ended up `Successful`, once a
	/// discipline has been inferred (spec §4.H.4). Best-effort: individual send failures
	/// neither abort the fan-out nor alter the session's own terminal state.
	async fn send_success_notifications(&self, session: &MarkingSession) -> NotificationSummary {
		let Some(discipline) = session.discipline.clone() else {
			return NotificationSummary::default();
		};
		let successful: Vec<UserId> = session
			.results
			.iter()
			.filter_map(|(target, outcome)| matches!(outcome, TargetOutcome::Successful { .. }).then_some(*target))
			.collect();

		if successful.is_empty() {
			return NotificationSummary::default();
		}

		let message = notify::marking_success_message(&discipline);
		let results = join_all(successful.iter().map(|&target| self.sender.send(target, &message))).await;
		let sent = results.iter().filter(|delivered| **delivered).count();
		let failed = results.len() - sent;

		NotificationSummary { sent, failed }
	}

	async fn audit_completion(&self, session: &MarkingSession) {
		let kind = if session.status == MarkingStatus::Error { "mass_mark_error" } else { "mass_mark_completed" };
		let detail = format!(
			"total={} successful={} failed={}",
			session.total, session.successful, session.failed
		);

		let _ = self
			.store
			.insert_audit_log(AuditEvent { user: Some(session.owner), kind: kind.into(), detail, at: session.started_at })
			.await;
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		cache::SessionCache,
		challenge::ChallengeCoordinator,
		notify::{NoopNotificationSender, NotificationLimiter},
		secret_store::SecretStore,
		store::MemoryStore,
		totp::AutoTotpResolver,
		upstream::{CallOutcome, LoginOutcome, Method, UpstreamFuture},
	};

	use crate::store::{Cookie, SessionCookies};

	/// Stub transport whose `call` outcome is keyed by the target identity smuggled into
	/// the cookie jar (set up by [`cookies_for`]), so each target can be scripted
	/// independently without touching the HTTP stack. Only `self_approve`'s `call` path is
	/// exercised by the engine; `begin_login`/`submit_code` are never reached because every
	/// target already has cookies cached.
	struct StubUpstream {
		responses: HashMap<UserId, CallOutcome>,
	}
	impl UpstreamClient for StubUpstream {
		fn begin_login<'a>(&'a self, _login: &'a str, _password: &'a str, _user_agent: &'a str) -> UpstreamFuture<'a, LoginOutcome> {
			Box::pin(async { Ok(LoginOutcome::Success { cookies: SessionCookies::default() }) })
		}

		fn submit_code<'a>(
			&'a self,
			_kind: crate::error::ChallengeKind,
			_code: &'a str,
			_continuation_cookies: &'a SessionCookies,
			_submit_url: &'a Url,
			_credential_id: Option<&'a str>,
			_user_agent: &'a str,
		) -> UpstreamFuture<'a, LoginOutcome> {
			Box::pin(async { Ok(LoginOutcome::Success { cookies: SessionCookies::default() }) })
		}

		fn call<'a>(
			&'a self,
			_method: Method,
			_url: &'a Url,
			cookies: &'a SessionCookies,
			_headers: &'a [(String, String)],
			_body: Option<&'a [u8]>,
			_user_agent: &'a str,
			_empty_if: Option<crate::upstream::EmptyPredicate<'a>>,
		) -> UpstreamFuture<'a, CallOutcome> {
			let target = cookies
				.iter()
				.find(|c| c.name == "target")
				.and_then(|c| c.value.parse::<u64>().ok())
				.map(UserId);
			let outcome = target
				.and_then(|target| self.responses.get(&target).cloned())
				.unwrap_or(CallOutcome::Empty);

			Box::pin(async move { Ok(outcome) })
		}
	}

	fn cookies_for(target: UserId) -> SessionCookies {
		SessionCookies::new(vec![Cookie {
			name: "target".into(),
			value: target.get().to_string(),
			domain: "attendance.upstream.example".into(),
			path: "/".into(),
			secure: true,
			http_only: true,
			expires_at: None,
		}])
	}

	fn ok_with_text(text: &str) -> CallOutcome {
		let framed = crate::upstream::grpc_web::encode_frame(crate::upstream::grpc_web::FLAG_DATA, text.as_bytes());

		CallOutcome::Ok { bytes: framed }
	}

	async fn engine_with(
		targets: &[UserId],
		responses: HashMap<UserId, CallOutcome>,
		concurrency: usize,
	) -> (MassMarkingEngine<StubUpstream>, Arc<MemoryStore>, Arc<NoopNotificationSender>) {
		let store_backend = Arc::new(MemoryStore::default());
		let store: Arc<dyn BrokerStore> = store_backend.clone();
		let secrets = Arc::new(SecretStore::new([7u8; 32]));
		let cache = Arc::new(SessionCache::new(store.clone()));

		for &target in targets {
			cache.store(target, cookies_for(target)).await.unwrap();
		}

		let coordinator = Arc::new(ChallengeCoordinator::new(store.clone()));
		let sender = Arc::new(NoopNotificationSender::default());
		let notifier = Arc::new(NotificationLimiter::new(coordinator.clone(), sender.clone()));
		let resolver = Arc::new(AutoTotpResolver::default());
		let upstream = Arc::new(StubUpstream { responses });
		let broker = Arc::new(Broker::new(upstream, store.clone(), secrets, cache, coordinator, notifier, resolver));
		let engine = MassMarkingEngine::with_concurrency(broker, store.clone(), sender.clone(), concurrency);

		(engine, store_backend, sender)
	}

	#[tokio::test]
	async fn start_marks_every_target_in_waves_and_completes() {
		let targets = vec![UserId(1), UserId(2), UserId(3), UserId(4)];
		let responses = targets.iter().map(|&t| (t, ok_with_text("ИКБО-01-21 | Иванов Иван | Физика"))).collect();
		let (engine, _store, _sender) = engine_with(&targets, responses, 2).await;

		let outcome = engine.start(UserId(100), "token-1", targets.clone(), OffsetDateTime::UNIX_EPOCH).await.unwrap();

		assert_eq!(outcome.session.status, MarkingStatus::Completed);
		assert_eq!(outcome.session.successful, 4);
		assert_eq!(outcome.session.failed, 0);
		assert!(outcome.session.is_drained());
		assert_eq!(outcome.session.group.as_deref(), Some("ИКБО-01-21"));
		assert_eq!(outcome.session.discipline.as_deref(), Some("Физика"));
		assert_eq!(outcome.notifications.sent, 4);
	}

	#[tokio::test]
	async fn an_empty_decoded_response_fails_with_token_expired() {
		let targets = vec![UserId(1)];
		let responses = HashMap::from([(UserId(1), ok_with_text(""))]);
		let (engine, _store, _sender) = engine_with(&targets, responses, 3).await;

		let outcome = engine.start(UserId(100), "token-1", targets, OffsetDateTime::UNIX_EPOCH).await.unwrap();

		assert_eq!(outcome.session.failed, 1);
		assert!(matches!(
			outcome.session.results[0].1,
			TargetOutcome::Failed { reason: FailureReason::TokenExpired }
		));
	}

	#[tokio::test]
	async fn a_target_with_no_cached_session_and_no_credentials_fails_without_aborting_the_wave() {
		// Target 2 has no cached cookies and no stored credentials, so the broker's rebuild
		// path raises `UserNotFound` for it; target 1 still succeeds in the same wave.
		let targets = vec![UserId(1), UserId(2)];
		let responses = HashMap::from([(UserId(1), ok_with_text("ИКБО-01-21 | Физика"))]);
		let (engine, _store, _sender) = engine_with(&[UserId(1)], responses, 2).await;

		let outcome = engine.start(UserId(100), "token-1", targets, OffsetDateTime::UNIX_EPOCH).await.unwrap();

		assert_eq!(outcome.session.successful, 1);
		assert_eq!(outcome.session.failed, 1);
		assert!(outcome.session.is_drained());
	}

	#[tokio::test]
	async fn continue_session_on_a_completed_session_is_a_no_op() {
		let targets = vec![UserId(1)];
		let responses = HashMap::from([(UserId(1), ok_with_text("ИКБО-01-21 | Физика"))]);
		let (engine, _store, sender) = engine_with(&targets, responses, 3).await;

		let first = engine.start(UserId(100), "token-1", targets, OffsetDateTime::UNIX_EPOCH).await.unwrap();

		assert_eq!(first.session.status, MarkingStatus::Completed);

		let before = sender.sent().len();
		let second = engine
			.continue_session(UserId(100), &first.session.id, "token-2", OffsetDateTime::UNIX_EPOCH)
			.await
			.unwrap();

		assert_eq!(second.session.status, MarkingStatus::Completed);
		assert_eq!(sender.sent().len(), before, "continuing a completed session must not re-notify");
	}

	#[tokio::test]
	async fn continue_session_rejects_a_non_owner() {
		let targets = vec![UserId(1)];
		let responses = HashMap::from([(UserId(1), ok_with_text(""))]);
		let (engine, _store, _sender) = engine_with(&targets, responses, 1).await;

		let first = engine.start(UserId(100), "token-1", targets, OffsetDateTime::UNIX_EPOCH).await.unwrap();

		let err = engine
			.continue_session(UserId(999), &first.session.id, "token-2", OffsetDateTime::UNIX_EPOCH)
			.await
			.unwrap_err();

		assert!(matches!(err, Error::AuthorizationDenied));
	}
}
