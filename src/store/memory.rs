//! Thread-safe in-memory [`BrokerStore`] implementation for tests and local development.

// self
use crate::{
	_prelude::*,
	auth::{MarkingSessionId, UserId},
	store::{
		AuditEvent, BrokerStore, MarkingSession, PendingChallenge, SessionCookies, StoreFuture,
		UserRecord,
	},
};

#[derive(Default)]
struct Inner {
	users: HashMap<UserId, UserRecord>,
	cookies: HashMap<UserId, SessionCookies>,
	challenges: HashMap<UserId, PendingChallenge>,
	marking_sessions: HashMap<MarkingSessionId, MarkingSession>,
	audit_log: Vec<AuditEvent>,
}

/// In-process storage backend. Each row type lives in its own map guarded by a single
/// [`RwLock`], matching the granularity the broker actually touches per call.
#[derive(Clone, Default)]
pub struct MemoryStore(Arc<RwLock<Inner>>);
impl BrokerStore for MemoryStore {
	fn get_user(&self, user: UserId) -> StoreFuture<'_, Option<UserRecord>> {
		Box::pin(async move { Ok(self.0.read().users.get(&user).cloned()) })
	}

	fn put_user(&self, user: UserId, record: UserRecord) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			self.0.write().users.insert(user, record);

			Ok(())
		})
	}

	fn get_cookies(&self, user: UserId) -> StoreFuture<'_, Option<SessionCookies>> {
		Box::pin(async move { Ok(self.0.read().cookies.get(&user).cloned()) })
	}

	fn put_cookies(&self, user: UserId, cookies: SessionCookies) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			self.0.write().cookies.insert(user, cookies);

			Ok(())
		})
	}

	fn delete_cookies(&self, user: UserId) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			self.0.write().cookies.remove(&user);

			Ok(())
		})
	}

	fn get_challenge(&self, user: UserId) -> StoreFuture<'_, Option<PendingChallenge>> {
		Box::pin(async move { Ok(self.0.read().challenges.get(&user).cloned()) })
	}

	fn upsert_challenge(&self, mut challenge: PendingChallenge) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.0.write();

			if let Some(existing) = guard.challenges.get(&challenge.user) {
				challenge.last_notified_at =
					max_option(existing.last_notified_at, challenge.last_notified_at);
			}

			guard.challenges.insert(challenge.user, challenge);

			Ok(())
		})
	}

	fn delete_challenge(&self, user: UserId) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			self.0.write().challenges.remove(&user);

			Ok(())
		})
	}

	fn cleanup_expired_challenges(&self, now: OffsetDateTime) -> StoreFuture<'_, usize> {
		Box::pin(async move {
			let mut guard = self.0.write();
			let before = guard.challenges.len();

			guard.challenges.retain(|_, challenge| !challenge.is_expired(now));

			Ok(before - guard.challenges.len())
		})
	}

	fn get_marking_session(
		&self,
		id: &MarkingSessionId,
	) -> StoreFuture<'_, Option<MarkingSession>> {
		let id = id.clone();

		Box::pin(async move { Ok(self.0.read().marking_sessions.get(&id).cloned()) })
	}

	fn put_marking_session(&self, session: MarkingSession) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			self.0.write().marking_sessions.insert(session.id.clone(), session);

			Ok(())
		})
	}

	fn insert_audit_log(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			self.0.write().audit_log.push(event);

			Ok(())
		})
	}
}

fn max_option(
	a: Option<OffsetDateTime>,
	b: Option<OffsetDateTime>,
) -> Option<OffsetDateTime> {
	match (a, b) {
		(Some(a), Some(b)) => Some(a.max(b)),
		(Some(a), None) => Some(a),
		(None, b) => b,
	}
}
