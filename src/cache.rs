//! Session Cache (spec §4.C): the only component allowed to read or write a user's cached
//! `SessionCookies` row. Every other component reaches cookies through here, never through
//! [`BrokerStore`] directly, so the "shared by reference only, never mutated after
//! `cache.store`" rule (spec §5) has exactly one enforcement point.

// self
use crate::{_prelude::*, auth::UserId, store::{BrokerStore, SessionCookies}};

/// Thin, store-backed cache over per-user session cookies.
pub struct SessionCache {
	store: Arc<dyn BrokerStore>,
}
impl SessionCache {
	/// Wraps a store.
	pub fn new(store: Arc<dyn BrokerStore>) -> Self {
		Self { store }
	}

	/// Loads the cached cookies for a user, if any were ever stored.
	pub async fn load(&self, user: UserId) -> Result<Option<SessionCookies>> {
		Ok(self.store.get_cookies(user).await?)
	}

	/// Replaces the cached cookies for a user. Callers must treat the cookies as immutable
	/// once passed in here (spec §5); the cache does not defensively clone on write.
	pub async fn store(&self, user: UserId, cookies: SessionCookies) -> Result<()> {
		Ok(self.store.put_cookies(user, cookies).await?)
	}

	/// Drops the cached cookies for a user, forcing the next operation to rebuild a
	/// session from scratch.
	pub async fn invalidate(&self, user: UserId) -> Result<()> {
		Ok(self.store.delete_cookies(user).await?)
	}
}
