//! SHA256SUMS parsing and GPG verification.
//!
//! A SUMS file is `"<64-hex>  <filename>"` per line. Malformed lines are
//! skipped silently on parse. GPG verification checks a detached
//! signature over the raw SUMS bytes against the union of the upstream's
//! published signing keys.

use std::collections::BTreeMap;

use sequoia_openpgp as openpgp;

use openpgp::cert::{Cert, CertParser};
use openpgp::parse::stream::{
    DetachedVerifierBuilder, GoodChecksum, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::KeyHandle;

use crate::error::{BaliseError, Result};

/// Parse a SUMS file into `filename -> lowercase hex digest`.
#[must_use]
pub fn parse(content: &str) -> BTreeMap<String, String> {
    let mut sums = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(filename), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        sums.insert(filename.to_string(), hash.to_ascii_lowercase());
    }
    sums
}

/// Serialize a digest map back into SUMS format, sorted by filename.
#[must_use]
pub fn serialize(sums: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (filename, hash) in sums {
        out.push_str(hash);
        out.push_str("  ");
        out.push_str(filename);
        out.push('\n');
    }
    out
}

struct Helper {
    certs: Vec<Cert>,
    good: usize,
}

impl VerificationHelper for Helper {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    if let Ok(GoodChecksum { .. }) = result {
                        self.good += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Verify a detached signature over `data` against the union of the
/// given ASCII-armored public keys.
///
/// Returns `Ok(true)` when at least one signature checks out against any
/// of the keys. Unusable key material or signatures yield errors; the
/// sync engine logs them and records `gpg_verified = false` without
/// aborting the version.
pub fn verify_detached(data: &[u8], signature: &[u8], armored_keys: &[String]) -> Result<bool> {
    let mut certs = Vec::new();
    for armor in armored_keys {
        let parser = CertParser::from_bytes(armor.as_bytes())
            .map_err(|e| BaliseError::internal(format!("unreadable signing key: {e}")))?;
        for cert in parser {
            match cert {
                Ok(cert) => certs.push(cert),
                Err(e) => tracing::warn!(error = %e, "Skipping unparseable certificate in signing key"),
            }
        }
    }
    if certs.is_empty() {
        return Ok(false);
    }

    let policy = &StandardPolicy::new();
    let helper = Helper { certs, good: 0 };
    let mut verifier = DetachedVerifierBuilder::from_bytes(signature)
        .map_err(|e| BaliseError::internal(format!("unreadable detached signature: {e}")))?
        .with_policy(policy, None, helper)
        .map_err(|e| BaliseError::internal(format!("verifier construction failed: {e}")))?;

    match verifier.verify_bytes(data) {
        Ok(()) => Ok(verifier.into_helper().good > 0),
        Err(e) => {
            tracing::debug!(error = %e, "Detached signature verification failed");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03  terraform-provider-x_1.0.0_linux_amd64.zip
e258d248fda94c63753607f7c4494ee0fcbe92f1a76bfdac795c9d84101eb317  terraform-provider-x_1.0.0_darwin_arm64.zip
";

    #[test]
    fn parses_well_formed_lines() {
        let sums = parse(SAMPLE);
        assert_eq!(sums.len(), 2);
        assert_eq!(
            sums["terraform-provider-x_1.0.0_linux_amd64.zip"],
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn malformed_lines_are_skipped_silently() {
        let content = format!(
            "not-a-hash  file.zip\nshort  other.zip\n{SAMPLE}trailing junk line with words\n"
        );
        let sums = parse(&content);
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn hashes_are_lowercased() {
        let upper = "5891B5B522D5DF086D0FF0B110FBD9D21BB4FC7163AF34D08286A2E846F6BE03  file.zip\n";
        let sums = parse(upper);
        assert_eq!(
            sums["file.zip"],
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn round_trip_preserves_the_map() {
        let sums = parse(SAMPLE);
        assert_eq!(parse(&serialize(&sums)), sums);
    }

    #[test]
    fn verification_without_keys_is_unverified_not_an_error() {
        assert!(!verify_detached(b"data", b"sig", &[]).unwrap_or(true));
    }

    #[test]
    fn unreadable_signature_is_an_error() {
        // A key list that parses to nothing short-circuits before the
        // signature is touched, so pass a structurally valid armor header
        // with garbage content to reach the signature parser.
        let err = verify_detached(
            b"data",
            b"not an openpgp packet stream",
            &["-----BEGIN PGP PUBLIC KEY BLOCK-----\n\nnope\n-----END PGP PUBLIC KEY BLOCK-----\n".to_string()],
        );
        // Either the key or the signature is rejected; both are handled.
        assert!(err.is_err() || !err.unwrap());
    }
}
