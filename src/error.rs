//! Broker-level error types shared across the cache, coordinator, and mass-marking engine.

// self
use crate::_prelude::*;

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Second-factor challenge kind, carried on [`Error::ChallengeRequired`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
	/// Time-based one-time password challenge.
	Totp,
	/// Email-delivered one-time code challenge.
	EmailCode,
}
impl Display for ChallengeKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(match self {
			Self::Totp => "totp",
			Self::EmailCode => "email_code",
		})
	}
}

/// Identifies what triggered a challenge or a rebuild attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeOrigin {
	/// Interactive first-time credential submission.
	Login,
	/// Background session rebuild behind an otherwise-unrelated operation.
	Refresh,
	/// Challenge state created or inspected by an external collaborator.
	External,
}
impl Display for ChallengeOrigin {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(match self {
			Self::Login => "login",
			Self::Refresh => "refresh",
			Self::External => "external",
		})
	}
}

/// One selectable second-factor credential, surfaced to the caller on a TOTP challenge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialOption {
	/// Human-readable label (e.g., device name).
	pub label: String,
	/// Opaque credential identifier Upstream expects back on submission.
	pub id: String,
}

/// Canonical broker error exposed by public APIs. The broker never exposes raw HTTP
/// statuses or Upstream response bytes through this type.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// A second factor is required before the operation can proceed. The broker guarantees
	/// that a [`crate::challenge::PendingChallenge`] row exists before this is raised.
	#[error("Challenge required: {kind} ({origin}){}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
	ChallengeRequired {
		/// Which second factor Upstream is asking for.
		kind: ChallengeKind,
		/// What triggered the challenge.
		origin: ChallengeOrigin,
		/// Optional human-readable detail.
		message: Option<String>,
		/// Alternative credentials the user may select, if any.
		credentials: Vec<CredentialOption>,
	},
	/// `submit_code` was called but no non-expired challenge exists for the user.
	#[error("No active challenge for this user.")]
	NoActiveChallenge,
	/// Upstream rejected the username/password pair.
	#[error("Upstream rejected the supplied credentials.")]
	CredentialsInvalid,
	/// The referenced user does not exist.
	#[error("User not found.")]
	UserNotFound,
	/// A transient Upstream failure (timeout, 5xx, network error).
	#[error("Upstream is temporarily unavailable: {detail}.")]
	UpstreamTransient {
		/// Human-readable detail, safe to log.
		detail: String,
	},
	/// Stored credential or TOTP seed ciphertext failed to decrypt.
	#[error("Stored credential material is corrupted and could not be decrypted.")]
	CredentialCorruption,
	/// The caller is not authorized to perform the requested action.
	#[error("Not authorized to perform this action.")]
	AuthorizationDenied,
	/// The referenced resource (session, target) does not exist.
	#[error("Resource not found.")]
	NotFound,
	/// The request failed input validation.
	#[error("Invalid request: {detail}.")]
	Validation {
		/// Human-readable detail.
		detail: String,
	},
}
impl Error {
	/// Builds a [`Error::Validation`] from a displayable detail.
	pub fn validation(detail: impl Into<String>) -> Self {
		Self::Validation { detail: detail.into() }
	}

	/// Builds a [`Error::UpstreamTransient`] from a displayable detail.
	pub fn transient(detail: impl Into<String>) -> Self {
		Self::UpstreamTransient { detail: detail.into() }
	}
}

/// Configuration and validation failures raised when constructing broker components.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// A required configuration value was missing.
	#[error("Missing required configuration value: {key}.")]
	Missing {
		/// Configuration key name.
		key: &'static str,
	},
	/// A configuration value failed to parse into its target type.
	#[error("Configuration value `{key}` is invalid: {detail}.")]
	Invalid {
		/// Configuration key name.
		key: &'static str,
		/// Human-readable detail.
		detail: String,
	},
	/// The symmetric encryption key is the wrong length for the cipher in use.
	#[error("Encryption key must be exactly {expected} bytes, got {actual}.")]
	InvalidKeyLength {
		/// Expected key length in bytes.
		expected: usize,
		/// Supplied key length in bytes.
		actual: usize,
	},
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed: {detail}.")]
	HttpClientBuild {
		/// Underlying transport builder failure, rendered to a string.
		detail: String,
	},
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::store::StoreError;
	use std::error::Error as StdError;

	#[test]
	fn store_error_converts_into_broker_error_with_source() {
		let store_error = StoreError::Backend { message: "database unreachable".into() };
		let broker_error: Error = store_error.clone().into();

		assert!(matches!(broker_error, Error::Storage(_)));

		let source = StdError::source(&broker_error)
			.expect("Broker error should expose the original store error as its source.");

		assert_eq!(source.to_string(), store_error.to_string());
	}

	#[test]
	fn challenge_required_renders_optional_message() {
		let without_message = Error::ChallengeRequired {
			kind: ChallengeKind::Totp,
			origin: ChallengeOrigin::Refresh,
			message: None,
			credentials: vec![],
		};

		assert_eq!(without_message.to_string(), "Challenge required: totp (refresh)");

		let with_message = Error::ChallengeRequired {
			kind: ChallengeKind::EmailCode,
			origin: ChallengeOrigin::Login,
			message: Some("session expired".into()),
			credentials: vec![],
		};

		assert_eq!(
			with_message.to_string(),
			"Challenge required: email_code (login): session expired"
		);
	}
}
