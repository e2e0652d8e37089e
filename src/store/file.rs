//! Simple file-backed [`BrokerStore`] for single-process deployments and local bots.
//!
//! Every mutation rewrites a single JSON snapshot via a temp-file-then-rename, mirroring
//! the durability story of the in-memory store plus a crash-safe write path.

// std
use std::{
	fs::{self, File},
	io::Write,
	path::{Path, PathBuf},
};
// self
use crate::{
	_prelude::*,
	auth::{MarkingSessionId, UserId},
	store::{
		AuditEvent, BrokerStore, MarkingSession, PendingChallenge, SessionCookies, StoreError,
		StoreFuture, UserRecord,
	},
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Snapshot {
	users: HashMap<u64, UserRecord>,
	cookies: HashMap<u64, SessionCookies>,
	challenges: HashMap<u64, PendingChallenge>,
	marking_sessions: Vec<(String, MarkingSession)>,
	audit_log: Vec<AuditEvent>,
}

/// Persists broker rows to a JSON file after each mutation.
#[derive(Clone, Debug)]
pub struct FileStore {
	path: PathBuf,
	inner: Arc<RwLock<Snapshot>>,
}
impl FileStore {
	/// Opens (or creates) a store at the provided path, eagerly loading existing data.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();

		Self::ensure_parent_exists(&path)?;

		let snapshot = if path.exists() { Self::load_snapshot(&path)? } else { Snapshot::default() };

		Ok(Self { path, inner: Arc::new(RwLock::new(snapshot)) })
	}

	fn load_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
		let metadata = path.metadata().map_err(|e| StoreError::Backend {
			message: format!("Failed to inspect {}: {e}", path.display()),
		})?;

		if metadata.len() == 0 {
			return Ok(Snapshot::default());
		}

		let bytes = fs::read(path).map_err(|e| StoreError::Backend {
			message: format!("Failed to read {}: {e}", path.display()),
		})?;

		serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
			message: format!("Failed to parse {}: {e}", path.display()),
		})
	}

	fn ensure_parent_exists(path: &Path) -> Result<(), StoreError> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
				message: format!("Failed to create store directory {}: {e}", parent.display()),
			})?;
		}

		Ok(())
	}

	fn persist_locked(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
		Self::ensure_parent_exists(&self.path)?;

		let serialized = serde_json::to_vec_pretty(snapshot).map_err(|e| {
			StoreError::Serialization { message: format!("Failed to serialize store snapshot: {e}") }
		})?;
		let mut tmp_path = self.path.clone();

		tmp_path.set_extension("tmp");

		{
			let mut file = File::create(&tmp_path).map_err(|e| StoreError::Backend {
				message: format!("Failed to create {}: {e}", tmp_path.display()),
			})?;

			file.write_all(&serialized).map_err(|e| StoreError::Backend {
				message: format!("Failed to write {}: {e}", tmp_path.display()),
			})?;
			file.sync_all().map_err(|e| StoreError::Backend {
				message: format!("Failed to sync {}: {e}", tmp_path.display()),
			})?;
		}

		fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::Backend {
			message: format!("Failed to replace {}: {e}", self.path.display()),
		})
	}
}
impl BrokerStore for FileStore {
	fn get_user(&self, user: UserId) -> StoreFuture<'_, Option<UserRecord>> {
		Box::pin(async move { Ok(self.inner.read().users.get(&user.get()).cloned()) })
	}

	fn put_user(&self, user: UserId, record: UserRecord) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.users.insert(user.get(), record);
			self.persist_locked(&guard)
		})
	}

	fn get_cookies(&self, user: UserId) -> StoreFuture<'_, Option<SessionCookies>> {
		Box::pin(async move { Ok(self.inner.read().cookies.get(&user.get()).cloned()) })
	}

	fn put_cookies(&self, user: UserId, cookies: SessionCookies) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.cookies.insert(user.get(), cookies);
			self.persist_locked(&guard)
		})
	}

	fn delete_cookies(&self, user: UserId) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.cookies.remove(&user.get());
			self.persist_locked(&guard)
		})
	}

	fn get_challenge(&self, user: UserId) -> StoreFuture<'_, Option<PendingChallenge>> {
		Box::pin(async move { Ok(self.inner.read().challenges.get(&user.get()).cloned()) })
	}

	fn upsert_challenge(&self, mut challenge: PendingChallenge) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			if let Some(existing) = guard.challenges.get(&challenge.user.get()) {
				challenge.last_notified_at = match (existing.last_notified_at, challenge.last_notified_at)
				{
					(Some(a), Some(b)) => Some(a.max(b)),
					(Some(a), None) => Some(a),
					(None, b) => b,
				};
			}

			guard.challenges.insert(challenge.user.get(), challenge);
			self.persist_locked(&guard)
		})
	}

	fn delete_challenge(&self, user: UserId) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.challenges.remove(&user.get());
			self.persist_locked(&guard)
		})
	}

	fn cleanup_expired_challenges(&self, now: OffsetDateTime) -> StoreFuture<'_, usize> {
		Box::pin(async move {
			let mut guard = self.inner.write();
			let before = guard.challenges.len();

			guard.challenges.retain(|_, challenge| !challenge.is_expired(now));

			let removed = before - guard.challenges.len();

			if removed > 0 {
				self.persist_locked(&guard)?;
			}

			Ok(removed)
		})
	}

	fn get_marking_session(
		&self,
		id: &MarkingSessionId,
	) -> StoreFuture<'_, Option<MarkingSession>> {
		let id = id.as_ref().to_owned();

		Box::pin(async move {
			Ok(self
				.inner
				.read()
				.marking_sessions
				.iter()
				.find(|(existing, _)| *existing == id)
				.map(|(_, session)| session.clone()))
		})
	}

	fn put_marking_session(&self, session: MarkingSession) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();
			let key = session.id.as_ref().to_owned();

			if let Some(slot) = guard.marking_sessions.iter_mut().find(|(id, _)| *id == key) {
				slot.1 = session;
			} else {
				guard.marking_sessions.push((key, session));
			}

			self.persist_locked(&guard)
		})
	}

	fn insert_audit_log(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			let mut guard = self.inner.write();

			guard.audit_log.push(event);
			self.persist_locked(&guard)
		})
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{env, process};
	// crates.io
	use tokio::runtime::Runtime;
	// self
	use super::*;

	fn temp_path() -> PathBuf {
		let unique =
			format!("session_broker_file_store_{}_{}.json", process::id(), OffsetDateTime::now_utc().unix_timestamp_nanos());

		env::temp_dir().join(unique)
	}

	#[test]
	fn save_and_reload_round_trip() {
		let path = temp_path();
		let store = FileStore::open(&path).expect("Failed to open file store snapshot.");
		let user = UserId(42);
		let record = UserRecord { login: Some("a@b".into()), ..Default::default() };
		let rt = Runtime::new().expect("Failed to build Tokio runtime for file store test.");

		rt.block_on(store.put_user(user, record.clone()))
			.expect("Failed to save fixture record to file store.");
		drop(store);

		let reopened = FileStore::open(&path).expect("Failed to reopen file store snapshot.");
		let fetched = rt
			.block_on(reopened.get_user(user))
			.expect("Failed to fetch fixture record from file store.")
			.expect("File store lost record after reopen.");

		assert_eq!(fetched.login, record.login);

		fs::remove_file(&path).unwrap_or_else(|e| {
			panic!("Failed to remove temporary file store snapshot {}: {e}", path.display())
		});
	}
}
