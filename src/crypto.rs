//! Sealing of SCM OAuth client secrets using AES-256-GCM.
//!
//! Client secrets are persisted only as ciphertext. The sealing key comes
//! from configuration (base64, 32 bytes); each seal uses a fresh random
//! nonce. Sealed format: base64(nonce || ciphertext || auth_tag).

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{BaliseError, Result};

/// Size of the AES-GCM nonce (12 bytes).
const NONCE_SIZE: usize = 12;
/// Size of the sealing key (256 bits).
const KEY_SIZE: usize = 32;

/// Seals and opens client secrets with a process-wide key.
#[derive(Clone)]
pub struct SecretSealer {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSealer").finish_non_exhaustive()
    }
}

impl SecretSealer {
    /// Build a sealer from a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValue` if the key is not valid base64 or not 32 bytes.
    pub fn from_base64_key(key: &str) -> Result<Self> {
        let bytes = BASE64.decode(key.trim()).map_err(|e| BaliseError::ConfigValue {
            key: "auth.secret_seal_key".to_string(),
            message: format!("not valid base64: {e}"),
        })?;
        if bytes.len() != KEY_SIZE {
            return Err(BaliseError::ConfigValue {
                key: "auth.secret_seal_key".to_string(),
                message: format!("expected {KEY_SIZE} bytes, got {}", bytes.len()),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(&bytes)
            .map_err(|e| BaliseError::internal(format!("cipher init: {e}")))?;
        Ok(Self { cipher })
    }

    /// Generate a random sealer. Secrets sealed with it do not survive a
    /// restart; only useful in development.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key");
        Self { cipher }
    }

    /// Seal a cleartext secret.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if encryption fails.
    pub fn seal(&self, cleartext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, cleartext.as_bytes())
            .map_err(|e| BaliseError::internal(format!("seal failed: {e}")))?;

        let mut envelope = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(envelope))
    }

    /// Open a sealed secret.
    ///
    /// # Errors
    ///
    /// Returns `TokenInvalid` when the envelope is malformed or the
    /// authentication tag does not verify (wrong key or tampered data).
    pub fn open(&self, sealed: &str) -> Result<String> {
        let envelope = BASE64
            .decode(sealed.trim())
            .map_err(|e| BaliseError::token_invalid(format!("sealed secret not base64: {e}")))?;
        if envelope.len() <= NONCE_SIZE {
            return Err(BaliseError::token_invalid("sealed secret too short"));
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cleartext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| BaliseError::token_invalid("sealed secret failed authentication"))?;
        String::from_utf8(cleartext)
            .map_err(|_| BaliseError::token_invalid("sealed secret is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sealer = SecretSealer::ephemeral();
        let sealed = sealer.seal("oauth-client-secret").unwrap();
        assert_ne!(sealed, "oauth-client-secret");
        assert_eq!(sealer.open(&sealed).unwrap(), "oauth-client-secret");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let sealer = SecretSealer::ephemeral();
        let a = sealer.seal("same").unwrap();
        let b = sealer.seal("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = SecretSealer::ephemeral().seal("secret").unwrap();
        let other = SecretSealer::ephemeral();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let sealer = SecretSealer::ephemeral();
        assert!(sealer.open("not base64 !!!").is_err());
        assert!(sealer.open("AAAA").is_err());
    }

    #[test]
    fn base64_key_length_is_enforced() {
        use base64::Engine;
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(SecretSealer::from_base64_key(&short).is_err());
        let ok = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert!(SecretSealer::from_base64_key(&ok).is_ok());
    }
}
