//! Webhook signature verification
//!
//! Creem signs the raw request body with HMAC-SHA256 and sends the hex digest
//! in a header. The header may carry several comma-separated candidates (for
//! secret rotation), each optionally prefixed with an algorithm tag like
//! `sha256=`. Verification succeeds if any single candidate matches.
//!
//! The input must be the exact bytes received. Re-serializing the JSON first
//! produces a different byte sequence and the HMAC will not match.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 digest in bytes.
const DIGEST_LEN: usize = 32;

/// Verify an inbound webhook body against its signature header.
///
/// Returns `false` for any malformed input; this function never errors. The
/// caller treats `false` as "reject with 401".
pub fn verify_signature(raw_body: &[u8], signature_header: &str, secret: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let expected = mac.finalize().into_bytes();

    signature_header
        .split(',')
        .filter_map(decode_candidate)
        .any(|candidate| candidate.ct_eq(expected.as_slice()).into())
}

/// Decode one candidate from the signature header.
///
/// Tolerates an algorithm prefix (`sha256=`, any case) and embedded whitespace
/// from copy-paste artifacts. Candidates that are not valid hex, or whose
/// decoded length is not a SHA-256 digest, are skipped rather than treated as
/// errors so the next candidate still gets a chance.
fn decode_candidate(candidate: &str) -> Option<[u8; DIGEST_LEN]> {
    let cleaned: String = candidate
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    let hex_part = cleaned.strip_prefix("sha256=").unwrap_or(&cleaned);

    let bytes = hex::decode(hex_part).ok()?;
    let digest: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
    Some(digest)
}

/// Compute the hex HMAC-SHA256 of a payload; used by tests to build valid
/// signature headers.
pub fn sign(raw_body: &[u8], secret: &str) -> String {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}
