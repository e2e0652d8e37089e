//! Auto-2FA Resolver (spec §4.E): attempts automatic TOTP derivation from a stored seed
//! when a challenge is encountered, so the interactive path is only reached when no seed
//! is stored or the derived code is rejected.

// crates.io
use totp_rs::{Algorithm, Secret as TotpSecretEncoding, TOTP};
// self
use crate::{
	_prelude::*,
	error::ChallengeKind,
	store::SessionCookies,
	upstream::{LoginOutcome, UpstreamClient},
};

const PERIOD_SECONDS: u64 = 30;
const DIGITS: usize = 6;

/// Result of a successful automatic TOTP submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoTotpOutcome {
	/// Session cookies issued once Upstream accepted the derived code.
	pub cookies: SessionCookies,
	/// The credential id the derived code was submitted against. Callers persist this as
	/// `totp_credential_id` when none was previously stored (spec §4.E step 4).
	pub credential_id: Option<String>,
}

/// Derives RFC 6238 codes from a stored seed and attempts one automatic submission per
/// challenge. Never loops across time windows (spec §9 design note: a systematic clock
/// skew should be corrected at the operator level, not papered over with extra guesses
/// that would hand an attacker three tries per real window).
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoTotpResolver;
impl AutoTotpResolver {
	/// Computes the current 30-second-window, 6-digit, SHA-1 TOTP code for `seed` (spec
	/// §4.E step 1). Returns `None` if the seed is not valid base32 TOTP material — the
	/// caller treats this the same as an absent seed (spec §4.E failure modes).
	pub fn derive_code(seed: &str, now: OffsetDateTime) -> Option<String> {
		let secret = TotpSecretEncoding::Encoded(seed.to_owned()).to_bytes().ok()?;
		let totp = TOTP::new(Algorithm::SHA1, DIGITS, 1, PERIOD_SECONDS, secret).ok()?;
		let timestamp = now.unix_timestamp().max(0) as u64;

		Some(totp.generate(timestamp))
	}

	/// Attempts to resolve a pending TOTP challenge automatically: derives the current
	/// code, selects a credential id in priority order (stored `totp_credential_id`, else
	/// the one the challenge itself offered — spec §4.E step 2), and submits it once.
	///
	/// Returns `Ok(None)` whenever auto-2FA does not apply or did not succeed (absent or
	/// corrupt seed, wrong code / persistent challenge) so the caller falls through to the
	/// interactive path without treating the attempt as an error.
	#[allow(clippy::too_many_arguments)]
	pub async fn try_resolve(
		&self,
		client: &dyn UpstreamClient,
		seed: &str,
		stored_credential_id: Option<&str>,
		challenge_credential_id: Option<&str>,
		continuation_cookies: &SessionCookies,
		submit_url: &Url,
		user_agent: &str,
		now: OffsetDateTime,
	) -> Result<Option<AutoTotpOutcome>> {
		let Some(code) = Self::derive_code(seed, now) else {
			return Ok(None);
		};
		let credential_id = stored_credential_id.or(challenge_credential_id);
		let outcome = client
			.submit_code(
				ChallengeKind::Totp,
				&code,
				continuation_cookies,
				submit_url,
				credential_id,
				user_agent,
			)
			.await?;

		match outcome {
			LoginOutcome::Success { cookies } =>
				Ok(Some(AutoTotpOutcome { cookies, credential_id: credential_id.map(str::to_owned) })),
			// Wrong code (likely clock skew) or any other challenge shape: do not retry.
			_ => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn derive_code_is_stable_within_a_window_and_changes_across_windows() {
		let seed = "JBSWY3DPEHPK3PXP";
		let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
		let t0_plus_1 = t0 + Duration::seconds(1);
		let t1 = t0 + Duration::seconds(60);

		let code_a = AutoTotpResolver::derive_code(seed, t0).expect("valid seed should derive a code");
		let code_b = AutoTotpResolver::derive_code(seed, t0_plus_1).expect("valid seed should derive a code");
		let code_c = AutoTotpResolver::derive_code(seed, t1).expect("valid seed should derive a code");

		assert_eq!(code_a, code_b, "codes within the same 30s window must match");
		assert_eq!(code_a.len(), 6);
		assert_ne!(code_a, code_c, "codes a full window apart should (almost always) differ");
	}

	#[test]
	fn derive_code_rejects_malformed_base32_seed() {
		assert!(AutoTotpResolver::derive_code("not valid base32!!", OffsetDateTime::UNIX_EPOCH).is_none());
	}
}
