//! Challenge Coordinator (spec §4.D): owns the single PendingChallenge row per user and
//! the per-user "at most one SSO exchange in flight" invariant (spec §5), mirroring the
//! teacher's `flow_guard` singleflight pattern over an async-aware per-key lock.

// self
use crate::{
	_prelude::*,
	auth::UserId,
	error::{ChallengeKind, ChallengeOrigin, CredentialOption},
	store::{BrokerStore, PendingChallenge, SessionCookies},
};

const DEFAULT_TTL_SECONDS: i64 = 300;

/// Coordinates PendingChallenge rows and per-user SSO exclusivity.
pub struct ChallengeCoordinator {
	store: Arc<dyn BrokerStore>,
	ttl: Duration,
	guards: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}
impl ChallengeCoordinator {
	/// Builds a coordinator using the authoritative 5-minute TTL (spec §9 Open Question 3).
	pub fn new(store: Arc<dyn BrokerStore>) -> Self {
		Self::with_ttl(store, Duration::seconds(DEFAULT_TTL_SECONDS))
	}

	/// Builds a coordinator with an explicit TTL, mainly for tests.
	pub fn with_ttl(store: Arc<dyn BrokerStore>, ttl: Duration) -> Self {
		Self { store, ttl, guards: Mutex::new(HashMap::new()) }
	}

	fn guard_for(&self, user: UserId) -> Arc<AsyncMutex<()>> {
		self.guards.lock().entry(user).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
	}

	/// Runs `f` while holding the per-user SSO-in-flight lock, so two concurrent requests
	/// for the same user never race an SSO exchange (spec §5).
	pub async fn exclusive<F, Fut, T>(&self, user: UserId, f: F) -> T
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let guard = self.guard_for(user);
		let _permit = guard.lock().await;

		f().await
	}

	/// True when a non-expired challenge exists for this user.
	pub async fn has_active(&self, user: UserId, now: OffsetDateTime) -> Result<bool> {
		Ok(self.store.get_challenge(user).await?.is_some_and(|c| !c.is_expired(now)))
	}

	/// Fetches the active challenge for a user, treating an expired row as absent.
	pub async fn get(&self, user: UserId, now: OffsetDateTime) -> Result<Option<PendingChallenge>> {
		Ok(self.store.get_challenge(user).await?.filter(|c| !c.is_expired(now)))
	}

	/// Issues a fresh challenge, replacing any existing row for this user.
	#[allow(clippy::too_many_arguments)]
	pub async fn put(
		&self,
		user: UserId,
		kind: ChallengeKind,
		origin: ChallengeOrigin,
		continuation_cookies: SessionCookies,
		submit_url: Url,
		credential_id: Option<String>,
		available_credentials: Vec<CredentialOption>,
		user_agent: String,
		now: OffsetDateTime,
	) -> Result<PendingChallenge> {
		let challenge = PendingChallenge {
			user,
			continuation_cookies,
			submit_url,
			credential_id,
			available_credentials,
			kind,
			origin,
			user_agent,
			created_at: now,
			expires_at: now + self.ttl,
			last_notified_at: None,
		};

		self.store.upsert_challenge(challenge.clone()).await?;

		Ok(challenge)
	}

	/// Re-issues a challenge after a wrong second-factor submission. The previously
	/// selected `credential_id` is preserved rather than whatever Upstream re-offers as its
	/// default (spec §9 Open Question 2) — only the continuation cookies, submit URL, and
	/// available-credentials list are refreshed.
	pub async fn update_after_wrong_code(
		&self,
		user: UserId,
		continuation_cookies: SessionCookies,
		submit_url: Url,
		available_credentials: Vec<CredentialOption>,
		now: OffsetDateTime,
	) -> Result<PendingChallenge> {
		let existing = self.get(user, now).await?.ok_or(Error::NoActiveChallenge)?;
		let challenge =
			PendingChallenge { continuation_cookies, submit_url, available_credentials, ..existing };

		self.store.upsert_challenge(challenge.clone()).await?;

		Ok(challenge)
	}

	/// Records that an out-of-band notification fired for a user's active challenge (spec
	/// §4.F, §8 property 2). Returns `false` if no active challenge exists to attach to.
	pub async fn mark_notified(&self, user: UserId, now: OffsetDateTime) -> Result<bool> {
		let Some(mut challenge) = self.get(user, now).await? else {
			return Ok(false);
		};

		challenge.last_notified_at = Some(now);
		self.store.upsert_challenge(challenge).await?;

		Ok(true)
	}

	/// Deletes the challenge row for a user, if any (spec §4.D: happens on success, on
	/// `BadCredentials`, and on user-initiated cancellation).
	pub async fn delete(&self, user: UserId) -> Result<()> {
		Ok(self.store.delete_challenge(user).await?)
	}

	/// Sweeps every expired PendingChallenge row, returning the number removed.
	pub async fn cleanup_expired(&self, now: OffsetDateTime) -> Result<usize> {
		Ok(self.store.cleanup_expired_challenges(now).await?)
	}
}
