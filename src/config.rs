//! Recognized configuration options and the builder that validates them.

// self
use crate::{_prelude::*, error::ConfigError};

/// Recognized broker configuration options. Values are typically sourced from the
/// process environment by the HTTP surface and handed to the broker at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
	/// Store connection string.
	pub database_dsn: String,
	/// Base64-encoded symmetric key for credential/seed wrapping. Rotation requires
	/// re-wrapping all rows (spec §6).
	pub encryption_key: String,
	/// Bearer token for the chat-bot HTTP API.
	pub bot_token: String,
	/// Bootstrap admin user id.
	pub super_admin_id: u64,
	/// Shared secret for service-to-service calls.
	pub trusted_service_api_key: String,
	/// Default rate-limiter bucket size (requests per minute).
	pub rate_limit_requests_per_minute: u32,
	/// Default per-call Upstream deadline.
	pub http_timeout_seconds: u64,
	/// Minimum store pool size.
	pub db_pool_min: u32,
	/// Maximum store pool size.
	pub db_pool_max: u32,
	/// Optional TTL for derived caches (schedule, groups, …).
	pub cache_ttl_seconds: Option<u64>,
	/// Marking-session retention floor.
	pub session_ttl_seconds: u64,
	/// PendingChallenge lifetime. A single authoritative value applied uniformly by the
	/// Challenge Coordinator (design target: 5 minutes; see the open question in the spec).
	pub pending_challenge_ttl_seconds: u64,
	/// Mass-marking worker pool size (design target: 3).
	pub mass_marking_concurrency: usize,
}
impl BrokerConfig {
	/// Starts a [`BrokerConfigBuilder`] with every required field unset.
	pub fn builder() -> BrokerConfigBuilder {
		BrokerConfigBuilder::default()
	}
}

/// Builder for [`BrokerConfig`] following the crate's fluent-setter, validating-`build`
/// convention.
#[derive(Clone, Debug, Default)]
pub struct BrokerConfigBuilder {
	database_dsn: Option<String>,
	encryption_key: Option<String>,
	bot_token: Option<String>,
	super_admin_id: Option<u64>,
	trusted_service_api_key: Option<String>,
	rate_limit_requests_per_minute: u32,
	http_timeout_seconds: u64,
	db_pool_min: u32,
	db_pool_max: u32,
	cache_ttl_seconds: Option<u64>,
	session_ttl_seconds: u64,
	pending_challenge_ttl_seconds: u64,
	mass_marking_concurrency: usize,
}
impl BrokerConfigBuilder {
	/// Sets the store connection string.
	pub fn database_dsn(mut self, dsn: impl Into<String>) -> Self {
		self.database_dsn = Some(dsn.into());
		self
	}

	/// Sets the base64-encoded symmetric encryption key.
	pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
		self.encryption_key = Some(key.into());
		self
	}

	/// Sets the chat-bot bearer token.
	pub fn bot_token(mut self, token: impl Into<String>) -> Self {
		self.bot_token = Some(token.into());
		self
	}

	/// Sets the bootstrap admin user id.
	pub fn super_admin_id(mut self, id: u64) -> Self {
		self.super_admin_id = Some(id);
		self
	}

	/// Sets the service-to-service shared secret.
	pub fn trusted_service_api_key(mut self, key: impl Into<String>) -> Self {
		self.trusted_service_api_key = Some(key.into());
		self
	}

	/// Overrides the default rate-limiter bucket size (default: 100).
	pub fn rate_limit_requests_per_minute(mut self, value: u32) -> Self {
		self.rate_limit_requests_per_minute = value;
		self
	}

	/// Overrides the default per-call Upstream deadline in seconds (default: 10).
	pub fn http_timeout_seconds(mut self, value: u64) -> Self {
		self.http_timeout_seconds = value;
		self
	}

	/// Overrides the store pool sizing (default: 1..=7).
	pub fn db_pool(mut self, min: u32, max: u32) -> Self {
		self.db_pool_min = min;
		self.db_pool_max = max;
		self
	}

	/// Overrides the derived-cache TTL.
	pub fn cache_ttl_seconds(mut self, value: u64) -> Self {
		self.cache_ttl_seconds = Some(value);
		self
	}

	/// Overrides the marking-session retention floor (default: 3600).
	pub fn session_ttl_seconds(mut self, value: u64) -> Self {
		self.session_ttl_seconds = value;
		self
	}

	/// Overrides the PendingChallenge TTL (default: 300, i.e. 5 minutes).
	pub fn pending_challenge_ttl_seconds(mut self, value: u64) -> Self {
		self.pending_challenge_ttl_seconds = value;
		self
	}

	/// Overrides the mass-marking worker pool size (default: 3).
	pub fn mass_marking_concurrency(mut self, value: usize) -> Self {
		self.mass_marking_concurrency = value;
		self
	}

	/// Validates and builds the [`BrokerConfig`].
	pub fn build(self) -> Result<BrokerConfig, ConfigError> {
		let database_dsn =
			self.database_dsn.ok_or(ConfigError::Missing { key: "database_dsn" })?;
		let encryption_key =
			self.encryption_key.ok_or(ConfigError::Missing { key: "encryption_key" })?;
		let bot_token = self.bot_token.ok_or(ConfigError::Missing { key: "bot_token" })?;
		let super_admin_id =
			self.super_admin_id.ok_or(ConfigError::Missing { key: "super_admin_id" })?;
		let trusted_service_api_key = self
			.trusted_service_api_key
			.ok_or(ConfigError::Missing { key: "trusted_service_api_key" })?;

		if self.db_pool_min > 0 && self.db_pool_max > 0 && self.db_pool_min > self.db_pool_max {
			return Err(ConfigError::Invalid {
				key: "db_pool_min",
				detail: "must not exceed db_pool_max".into(),
			});
		}

		Ok(BrokerConfig {
			database_dsn,
			encryption_key,
			bot_token,
			super_admin_id,
			trusted_service_api_key,
			rate_limit_requests_per_minute: if self.rate_limit_requests_per_minute == 0 {
				100
			} else {
				self.rate_limit_requests_per_minute
			},
			http_timeout_seconds: if self.http_timeout_seconds == 0 {
				10
			} else {
				self.http_timeout_seconds
			},
			db_pool_min: if self.db_pool_min == 0 { 1 } else { self.db_pool_min },
			db_pool_max: if self.db_pool_max == 0 { 7 } else { self.db_pool_max },
			cache_ttl_seconds: self.cache_ttl_seconds,
			session_ttl_seconds: if self.session_ttl_seconds == 0 {
				3600
			} else {
				self.session_ttl_seconds
			},
			pending_challenge_ttl_seconds: if self.pending_challenge_ttl_seconds == 0 {
				300
			} else {
				self.pending_challenge_ttl_seconds
			},
			mass_marking_concurrency: if self.mass_marking_concurrency == 0 {
				3
			} else {
				self.mass_marking_concurrency
			},
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn builder_rejects_missing_required_fields() {
		let err = BrokerConfig::builder()
			.database_dsn("postgres://localhost/broker")
			.build()
			.expect_err("Builder should reject a config missing encryption_key.");

		assert!(matches!(err, ConfigError::Missing { key: "encryption_key" }));

		let err = BrokerConfig::builder()
			.database_dsn("postgres://localhost/broker")
			.encryption_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
			.build()
			.expect_err("Builder should reject a config missing bot_token.");

		assert!(matches!(err, ConfigError::Missing { key: "bot_token" }));
	}

	#[test]
	fn builder_applies_defaults() {
		let config = BrokerConfig::builder()
			.database_dsn("postgres://localhost/broker")
			.encryption_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
			.bot_token("token")
			.super_admin_id(1)
			.trusted_service_api_key("secret")
			.build()
			.expect("Builder should succeed with only required fields set.");

		assert_eq!(config.mass_marking_concurrency, 3);
		assert_eq!(config.pending_challenge_ttl_seconds, 300);
		assert_eq!(config.rate_limit_requests_per_minute, 100);
	}

	#[test]
	fn builder_rejects_inverted_pool_bounds() {
		let err = BrokerConfig::builder()
			.database_dsn("postgres://localhost/broker")
			.encryption_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
			.bot_token("token")
			.super_admin_id(1)
			.trusted_service_api_key("secret")
			.db_pool(7, 1)
			.build()
			.expect_err("Builder should reject db_pool_min greater than db_pool_max.");

		assert!(matches!(err, ConfigError::Invalid { key: "db_pool_min", .. }));
	}
}
