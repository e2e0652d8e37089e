//! Session broker for a Keycloak-style SSO portal—per-user session caching, second-factor
//! challenge coordination, and bounded-concurrency mass-marking in one crate.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod cache;
pub mod challenge;
pub mod config;
pub mod error;
pub mod marking;
pub mod notify;
pub mod obs;
pub mod secret_store;
pub mod store;
pub mod totp;
pub mod upstream;

#[cfg(all(any(test, feature = "test"), feature = "reqwest"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// self
	use crate::{
		broker::Broker,
		cache::SessionCache,
		challenge::ChallengeCoordinator,
		notify::{NoopNotificationSender, NotificationLimiter},
		secret_store::SecretStore,
		store::MemoryStore,
		totp::AutoTotpResolver,
		upstream::ReqwestUpstreamClient,
	};

	/// Broker type alias used by reqwest-backed integration tests.
	pub type ReqwestTestBroker = Broker<ReqwestUpstreamClient>;

	/// Builds a reqwest HTTP client that accepts the self-signed certificates produced by
	/// `httpmock` during tests.
	pub fn test_reqwest_upstream_client() -> ReqwestUpstreamClient {
		let client = ReqwestClient::builder()
			.cookie_store(false)
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.build()
			.expect("Failed to build insecure Reqwest client for tests.");

		ReqwestUpstreamClient::with_client(client)
	}

	/// Constructs a [`Broker`] backed by an in-memory store and the reqwest transport used
	/// across integration tests.
	pub fn build_reqwest_test_broker(encryption_key: [u8; 32]) -> (ReqwestTestBroker, Arc<MemoryStore>) {
		let store_backend = Arc::new(MemoryStore::default());
		let store: Arc<dyn crate::store::BrokerStore> = store_backend.clone();
		let secrets = Arc::new(SecretStore::new(encryption_key));
		let cache = Arc::new(SessionCache::new(store.clone()));
		let coordinator = Arc::new(ChallengeCoordinator::new(store.clone()));
		let notifier = Arc::new(NotificationLimiter::new(
			coordinator.clone(),
			Arc::new(NoopNotificationSender::default()),
		));
		let resolver = Arc::new(AutoTotpResolver::default());
		let upstream = Arc::new(test_reqwest_upstream_client());
		let broker = Broker::new(upstream, store, secrets, cache, coordinator, notifier, resolver);

		(broker, store_backend)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap, HashSet, hash_map::DefaultHasher},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		hash::{Hash, Hasher},
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::Client as ReqwestClient;
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(all(test, feature = "reqwest"))] use {color_eyre as _, httpmock as _};
