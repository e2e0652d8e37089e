//! Secret Store Adapter (spec §4.A): encrypts/decrypts credentials and TOTP seeds with a
//! process-wide authenticated symmetric key, and delegates everything else to the store.

// crates.io
use aes_gcm::{
	Aes256Gcm, Key, Nonce,
	aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine, engine::general_purpose::STANDARD};
// self
use crate::{_prelude::*, error::ConfigError};

const NONCE_LEN: usize = 12;

/// Wraps and unwraps credential/TOTP-seed fields with AES-256-GCM under a process-wide
/// key. Ciphertext layout is `nonce (12 bytes) || AEAD(ciphertext || tag)`; this is an
/// implementation detail, not a wire format.
#[derive(Clone)]
pub struct SecretStore {
	cipher: Aes256Gcm,
}
impl SecretStore {
	/// Builds an adapter from a 32-byte key (the `encryption_key` configuration option).
	pub fn new(key: [u8; 32]) -> Self {
		Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)) }
	}

	/// Builds an adapter from an arbitrary-length byte slice, validating it is exactly
	/// 32 bytes (AES-256 key size).
	pub fn from_key_bytes(key: &[u8]) -> Result<Self, ConfigError> {
		let key: [u8; 32] = key
			.try_into()
			.map_err(|_| ConfigError::InvalidKeyLength { expected: 32, actual: key.len() })?;

		Ok(Self::new(key))
	}

	/// Builds an adapter from the base64-encoded `encryption_key` configuration value.
	pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
		let decoded = STANDARD.decode(encoded).map_err(|e| ConfigError::Invalid {
			key: "encryption_key",
			detail: format!("not valid base64: {e}"),
		})?;

		Self::from_key_bytes(&decoded)
	}

	/// Encrypts `plaintext`, returning an opaque ciphertext blob suitable for storage.
	pub fn encrypt(&self, plaintext: &str) -> Vec<u8> {
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		let mut ciphertext = self
			.cipher
			.encrypt(&nonce, plaintext.as_bytes())
			.expect("AES-256-GCM encryption over a bounded plaintext cannot fail.");
		let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());

		blob.extend_from_slice(nonce.as_slice());
		blob.append(&mut ciphertext);

		blob
	}

	/// Decrypts a blob produced by [`Self::encrypt`]. Failures (wrong key, truncated
	/// blob, tampering) are surfaced as [`Error::CredentialCorruption`] and never
	/// silently coerced to an empty string (spec §4.A).
	pub fn decrypt(&self, blob: &[u8]) -> Result<String> {
		if blob.len() < NONCE_LEN {
			return Err(Error::CredentialCorruption);
		}

		let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
		let nonce = Nonce::from_slice(nonce_bytes);
		let plaintext =
			self.cipher.decrypt(nonce, ciphertext).map_err(|_| Error::CredentialCorruption)?;

		String::from_utf8(plaintext).map_err(|_| Error::CredentialCorruption)
	}
}
