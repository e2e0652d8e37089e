//! Persistent-state contract and built-in store implementations.
//!
//! The broker treats the relational store as an external collaborator (spec §6): this
//! module specifies only the row shapes and the operations the broker invokes, not a
//! schema. [`MemoryStore`] and [`FileStore`] are complete implementations suitable for
//! tests, local development, and single-process deployments respectively.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, auth::UserId, auth::MarkingSessionId, error::ChallengeKind, error::ChallengeOrigin, error::CredentialOption};

/// Future returned by every [`BrokerStore`] operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// One cookie accumulated across an SSO exchange. Semantics are opaque to the broker;
/// it never parses or asserts on individual cookie contents (spec §3.1).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
	/// Cookie name.
	pub name: String,
	/// Cookie value.
	pub value: String,
	/// Domain the cookie was scoped to.
	pub domain: String,
	/// Path the cookie was scoped to.
	pub path: String,
	/// `Secure` flag.
	pub secure: bool,
	/// `HttpOnly` flag.
	pub http_only: bool,
	/// Optional expiry.
	pub expires_at: Option<OffsetDateTime>,
}

/// Opaque jar of [`Cookie`]s: either the final session cookies issued after a successful
/// SSO exchange, or the continuation cookies of a half-finished challenge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookies(pub Vec<Cookie>);
impl SessionCookies {
	/// Wraps an existing cookie list.
	pub fn new(cookies: Vec<Cookie>) -> Self {
		Self(cookies)
	}

	/// True when no cookies were accumulated.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Iterates the contained cookies.
	pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
		self.0.iter()
	}
}
impl FromIterator<Cookie> for SessionCookies {
	fn from_iter<I: IntoIterator<Item = Cookie>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

/// The User row (spec §3.1). Password and TOTP seed are stored as ciphertext produced
/// by [`crate::secret_store::SecretStore`]; this module never sees the plaintext.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
	/// Opaque login, non-empty iff `password_ciphertext` is non-empty (spec §3.1 invariant).
	pub login: Option<String>,
	/// Encrypted password.
	pub password_ciphertext: Option<Vec<u8>>,
	/// Currently inferred group/cohort.
	pub group: Option<String>,
	/// Per-user User-Agent override, if any.
	pub user_agent: Option<String>,
	/// Whether the user has opted in to being marked by others' mass-marking sessions.
	pub allow_confirm: bool,
	/// Admin level, 0..5.
	pub admin_level: u8,
	/// Display name inferred from the identity probe.
	pub fio: Option<String>,
	/// Encrypted TOTP seed.
	pub totp_seed_ciphertext: Option<Vec<u8>>,
	/// Previously confirmed TOTP credential id, preferred over the challenge-supplied default.
	pub totp_credential_id: Option<String>,
}
impl UserRecord {
	/// True when both `login` and `password_ciphertext` are present (or both absent).
	pub fn credentials_consistent(&self) -> bool {
		self.login.as_ref().is_some_and(|l| !l.is_empty())
			== self.password_ciphertext.as_ref().is_some_and(|p| !p.is_empty())
	}
}

/// Second-factor session continuation state (spec §3.1). At most one non-expired row
/// exists per user at a time; this invariant is enforced by the Challenge Coordinator,
/// not by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChallenge {
	/// Owning user.
	pub user: UserId,
	/// Half-finished SSO cookie jar required to submit the second factor.
	pub continuation_cookies: SessionCookies,
	/// Absolute URL the next code must be POSTed to.
	pub submit_url: Url,
	/// Selected second-factor credential, if any.
	pub credential_id: Option<String>,
	/// Alternative credentials the user may select (TOTP challenges only).
	pub available_credentials: Vec<CredentialOption>,
	/// TOTP or email-code challenge.
	pub kind: ChallengeKind,
	/// What triggered this challenge.
	pub origin: ChallengeOrigin,
	/// User-Agent used for the SSO exchange that produced this challenge.
	pub user_agent: String,
	/// Row creation time.
	pub created_at: OffsetDateTime,
	/// Row expiry. A row whose `expires_at` is in the past is treated as absent everywhere.
	pub expires_at: OffsetDateTime,
	/// Last time an out-of-band notification fired for this user's challenge. Preserved
	/// across row replacement (spec §3.2, §4.D, §8 property 2).
	pub last_notified_at: Option<OffsetDateTime>,
}
impl PendingChallenge {
	/// True when `now` is at or past `expires_at`.
	pub fn is_expired(&self, now: OffsetDateTime) -> bool {
		now >= self.expires_at
	}
}

/// Per-target outcome recorded by the Mass-Marking Engine (spec §4.H.2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetOutcome {
	/// The self-approve call succeeded and a `{group, subject}` pair was parsed.
	Successful {
		/// Parsed group token, if the extractor found one.
		group: Option<String>,
		/// Parsed subject token, if the extractor found one.
		subject: Option<String>,
	},
	/// The target could not be marked.
	Failed {
		/// Why the target failed.
		reason: FailureReason,
	},
}

/// Why a single target's self-approve call failed (spec §4.H.2, §8 scenario S4).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
	/// The broker raised `ChallengeRequired` for this target; the engine does not escalate
	/// an interactive challenge on the marker's behalf.
	NeedsTwoFactor,
	/// Upstream's response decoded to an empty `{group, subject}` pair — the one-shot token
	/// is exhausted.
	TokenExpired,
	/// Any other broker-surfaced error (transient Upstream failure, credential corruption).
	Other(String),
}

/// MarkingSession lifecycle state (spec §4.H.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkingStatus {
	/// Created, first wave not yet scheduled.
	Starting,
	/// A wave is in flight.
	Processing,
	/// A new wave was spawned via `continue`.
	Continuing,
	/// Halted mid-batch with `remaining` non-empty, awaiting `continue`.
	PartiallyCompleted,
	/// Terminal: `remaining` is empty.
	Completed,
	/// Terminal: an unrecoverable infrastructure error occurred.
	Error,
}

/// A mass-marking batch (spec §3.1, §4.H). Mutated only by its owning engine task —
/// never touched directly by request handlers once started (spec §3.2 ownership rule).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarkingSession {
	/// Opaque session identifier.
	pub id: MarkingSessionId,
	/// The user who started the session; the only caller allowed to `continue` it.
	pub owner: UserId,
	/// Current one-shot Upstream self-approve token.
	pub token: crate::auth::Secret,
	/// Lifecycle state.
	pub status: MarkingStatus,
	/// Total number of targets across the session's lifetime.
	pub total: usize,
	/// `successful + failed`.
	pub processed: usize,
	/// Targets marked successfully.
	pub successful: usize,
	/// Targets that failed (any reason).
	pub failed: usize,
	/// Targets not yet attempted in the current wave, in input order.
	pub remaining: Vec<UserId>,
	/// Per-target outcomes recorded so far, in completion order.
	pub results: Vec<(UserId, TargetOutcome)>,
	/// Group inferred from the first successful parse; never overwritten afterward.
	pub group: Option<String>,
	/// Discipline inferred from the first successful parse; never overwritten afterward.
	pub discipline: Option<String>,
	/// Session creation time.
	pub started_at: OffsetDateTime,
	/// Set only when `status == Error`.
	pub error: Option<String>,
}
impl MarkingSession {
	/// Starts a new session over `targets` with the given owner and token.
	pub fn new(
		id: MarkingSessionId,
		owner: UserId,
		token: crate::auth::Secret,
		targets: Vec<UserId>,
		started_at: OffsetDateTime,
	) -> Self {
		Self {
			id,
			owner,
			token,
			status: MarkingStatus::Starting,
			total: targets.len(),
			processed: 0,
			successful: 0,
			failed: 0,
			remaining: targets,
			results: Vec::new(),
			group: None,
			discipline: None,
			started_at,
			error: None,
		}
	}

	/// Records a single target's outcome: removes it from `remaining`, appends to
	/// `results`, and updates the counters (spec §4.H.2, invariant `processed ==
	/// successful + failed`).
	pub fn record(&mut self, target: UserId, outcome: TargetOutcome) {
		self.remaining.retain(|t| *t != target);

		match &outcome {
			TargetOutcome::Successful { group, subject } => {
				self.successful += 1;

				if self.group.is_none() {
					self.group = group.clone();
				}
				if self.discipline.is_none() {
					self.discipline = subject.clone();
				}
			},
			TargetOutcome::Failed { .. } => self.failed += 1,
		}

		self.processed = self.successful + self.failed;
		self.results.push((target, outcome));
	}

	/// True once every originally-enqueued target has an outcome and none remain.
	pub fn is_drained(&self) -> bool {
		self.remaining.is_empty()
	}
}

/// An audit-log entry (spec §6: "audit-log insert"). The audit log's schema and
/// consumers are out of scope; the broker only guarantees it calls this operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
	/// Subject user, if applicable.
	pub user: Option<UserId>,
	/// Short machine-readable event kind (e.g., `"login"`, `"challenge_issued"`).
	pub kind: String,
	/// Human-readable detail.
	pub detail: String,
	/// When the event occurred.
	pub at: OffsetDateTime,
}

/// Error type produced by [`BrokerStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}

/// Persistence contract the Session Broker, Challenge Coordinator, and Mass-Marking
/// Engine invoke. Only the operations named here are specified; schema and connection
/// management are the external store's concern (spec §6).
pub trait BrokerStore
where
	Self: Send + Sync,
{
	/// Fetches the User row, if one has been created for this id.
	fn get_user(&self, user: UserId) -> StoreFuture<'_, Option<UserRecord>>;

	/// Creates or replaces the User row.
	fn put_user(&self, user: UserId, record: UserRecord) -> StoreFuture<'_, ()>;

	/// Fetches the cached session cookies for a user.
	fn get_cookies(&self, user: UserId) -> StoreFuture<'_, Option<SessionCookies>>;

	/// Stores (replacing) the session cookies for a user.
	fn put_cookies(&self, user: UserId, cookies: SessionCookies) -> StoreFuture<'_, ()>;

	/// Deletes the cached session cookies for a user, if any.
	fn delete_cookies(&self, user: UserId) -> StoreFuture<'_, ()>;

	/// Fetches the single PendingChallenge row for a user, if any (expired or not —
	/// callers apply [`PendingChallenge::is_expired`]).
	fn get_challenge(&self, user: UserId) -> StoreFuture<'_, Option<PendingChallenge>>;

	/// Upserts the single PendingChallenge row for `challenge.user`. If an existing row
	/// (expired or not) had `last_notified_at` set, the new row inherits the later of the
	/// two values (spec §8 property 2).
	fn upsert_challenge(&self, challenge: PendingChallenge) -> StoreFuture<'_, ()>;

	/// Deletes the PendingChallenge row for a user, if any.
	fn delete_challenge(&self, user: UserId) -> StoreFuture<'_, ()>;

	/// Deletes every PendingChallenge row whose `expires_at` is at or before `now`.
	/// Returns the number of rows removed.
	fn cleanup_expired_challenges(&self, now: OffsetDateTime) -> StoreFuture<'_, usize>;

	/// Fetches a MarkingSession by id.
	fn get_marking_session(
		&self,
		id: &MarkingSessionId,
	) -> StoreFuture<'_, Option<MarkingSession>>;

	/// Creates or replaces a MarkingSession.
	fn put_marking_session(&self, session: MarkingSession) -> StoreFuture<'_, ()>;

	/// Appends an audit-log entry. Best-effort: failures are logged by the caller and do
	/// not abort the triggering operation.
	fn insert_audit_log(&self, event: AuditEvent) -> StoreFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn marking_session_record_updates_counters_and_remaining() {
		let mut session = MarkingSession::new(
			MarkingSessionId::new("s1"),
			UserId(1),
			crate::auth::Secret::new("tok"),
			vec![UserId(10), UserId(20)],
			OffsetDateTime::UNIX_EPOCH,
		);

		session.record(
			UserId(10),
			TargetOutcome::Successful { group: Some("ИКБО-01-21".into()), subject: Some("Math".into()) },
		);
		session.record(UserId(20), TargetOutcome::Failed { reason: FailureReason::TokenExpired });

		assert_eq!(session.successful, 1);
		assert_eq!(session.failed, 1);
		assert_eq!(session.processed, session.successful + session.failed);
		assert!(session.is_drained());
		assert_eq!(session.group.as_deref(), Some("ИКБО-01-21"));
		assert_eq!(session.discipline.as_deref(), Some("Math"));
	}

	#[test]
	fn marking_session_keeps_first_successful_group_and_subject() {
		let mut session = MarkingSession::new(
			MarkingSessionId::new("s2"),
			UserId(1),
			crate::auth::Secret::new("tok"),
			vec![UserId(10), UserId(20)],
			OffsetDateTime::UNIX_EPOCH,
		);

		session.record(
			UserId(10),
			TargetOutcome::Successful { group: Some("ИКБО-01-21".into()), subject: Some("Math".into()) },
		);
		session.record(
			UserId(20),
			TargetOutcome::Successful { group: Some("ИКБО-02-21".into()), subject: Some("Physics".into()) },
		);

		assert_eq!(session.group.as_deref(), Some("ИКБО-01-21"));
		assert_eq!(session.discipline.as_deref(), Some("Math"));
	}

	#[test]
	fn user_record_credentials_consistency() {
		let mut record = UserRecord::default();

		assert!(record.credentials_consistent());

		record.login = Some("a@b".into());

		assert!(!record.credentials_consistent());

		record.password_ciphertext = Some(vec![1, 2, 3]);

		assert!(record.credentials_consistent());
	}
}
