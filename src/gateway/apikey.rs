//! API key material.
//!
//! Keys look like `<prefix>_<hex-entropy>`. Only a bcrypt hash and the
//! first [`KEY_PREFIX_LENGTH`](crate::types::KEY_PREFIX_LENGTH) cleartext
//! characters are ever persisted; the prefix enables candidate lookup so
//! a request costs a handful of bcrypt comparisons instead of one per
//! stored key.

use rand::RngCore;

use crate::error::{BaliseError, Result};
use crate::types::KEY_PREFIX_LENGTH;

/// Characters of the cleartext shown in the UI after creation.
pub const DISPLAY_PREFIX_LENGTH: usize = 12;

/// Bytes of entropy behind each key.
const ENTROPY_BYTES: usize = 20;

/// A freshly generated key. The cleartext exists only in this value.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub key: String,
    pub bcrypt_hash: String,
    pub display_prefix: String,
}

/// Generate a key under the given prefix.
///
/// # Errors
///
/// Returns `Internal` if bcrypt hashing fails.
pub fn generate(prefix: &str) -> Result<GeneratedKey> {
    let mut entropy = [0u8; ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut entropy);
    let key = format!("{prefix}_{}", hex::encode(entropy));
    let bcrypt_hash = bcrypt::hash(&key, bcrypt::DEFAULT_COST)
        .map_err(|e| BaliseError::internal(format!("bcrypt hash: {e}")))?;
    let display_prefix = key.chars().take(DISPLAY_PREFIX_LENGTH).collect();
    Ok(GeneratedKey {
        key,
        bcrypt_hash,
        display_prefix,
    })
}

/// Constant-time validation of a presented key against a stored hash.
#[must_use]
pub fn validate(key: &str, bcrypt_hash: &str) -> bool {
    bcrypt::verify(key, bcrypt_hash).unwrap_or(false)
}

/// The stored lookup prefix of a presented key: its first
/// [`KEY_PREFIX_LENGTH`] characters.
#[must_use]
pub fn lookup_prefix(key: &str) -> Option<&str> {
    key.char_indices()
        .nth(KEY_PREFIX_LENGTH)
        .map(|(idx, _)| &key[..idx])
        .or_else(|| (key.len() == KEY_PREFIX_LENGTH).then_some(key))
}

/// Extract the token from an `Authorization` header value.
///
/// The scheme prefix must be exactly `Bearer ` (case-sensitive); the
/// remainder is trimmed and must be non-empty.
#[must_use]
pub fn parse_bearer(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn generated_keys_validate_and_foreign_keys_do_not() {
        let generated = generate("blse").unwrap();
        assert!(generated.key.starts_with("blse_"));
        assert!(validate(&generated.key, &generated.bcrypt_hash));

        let other = generate("blse").unwrap();
        assert!(!validate(&other.key, &generated.bcrypt_hash));
        assert!(!validate("blse_0000", &generated.bcrypt_hash));
    }

    #[test]
    fn display_and_lookup_prefixes() {
        let generated = generate("blse").unwrap();
        assert_eq!(generated.display_prefix.len(), DISPLAY_PREFIX_LENGTH);
        assert!(generated.key.starts_with(&generated.display_prefix));

        let prefix = lookup_prefix(&generated.key).unwrap();
        assert_eq!(prefix.len(), KEY_PREFIX_LENGTH);
        assert!(generated.key.starts_with(prefix));
    }

    #[test]
    fn short_tokens_have_no_lookup_prefix() {
        assert!(lookup_prefix("short").is_none());
        assert_eq!(lookup_prefix("exactly10!"), Some("exactly10!"));
    }

    #[test_case("Bearer token-value", Some("token-value") ; "plain bearer")]
    #[test_case("Bearer   padded  ", Some("padded") ; "whitespace trimmed")]
    #[test_case("bearer token", None ; "lowercase scheme rejected")]
    #[test_case("Basic dXNlcjpwYXNz", None ; "basic rejected")]
    #[test_case("Bearer ", None ; "empty token rejected")]
    #[test_case("Bearer     ", None ; "whitespace only token rejected")]
    #[test_case("token", None ; "missing scheme rejected")]
    fn bearer_parsing(header: &str, expected: Option<&str>) {
        assert_eq!(parse_bearer(header), expected);
    }
}
