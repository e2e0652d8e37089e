//! Strongly typed identifiers enforced across the broker domain.

// self
use crate::_prelude::*;

/// External user identifier (64-bit, per spec.md §3.1 — the key of the User entity).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);
impl UserId {
	/// Returns the raw numeric value.
	pub const fn get(self) -> u64 {
		self.0
	}
}
impl From<u64> for UserId {
	fn from(value: u64) -> Self {
		Self(value)
	}
}
impl From<UserId> for u64 {
	fn from(value: UserId) -> Self {
		value.0
	}
}
impl Debug for UserId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "UserId({})", self.0)
	}
}
impl Display for UserId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		Display::fmt(&self.0, f)
	}
}
impl FromStr for UserId {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.parse().map(Self)
	}
}

/// Opaque identifier for a [`crate::marking::MarkingSession`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkingSessionId(String);
impl MarkingSessionId {
	/// Wraps an existing identifier string (e.g., one rehydrated from the store).
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Generates a fresh random identifier.
	pub fn generate() -> Self {
		use rand::Rng;

		let bytes: [u8; 16] = rand::rng().random();

		Self(base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes))
	}
}
impl AsRef<str> for MarkingSessionId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl Debug for MarkingSessionId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "MarkingSessionId({})", self.0)
	}
}
impl Display for MarkingSessionId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}
