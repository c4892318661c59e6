//! Per-block MD5 and the running SHA-256 hash chain.
//!
//! The chain is the end-to-end integrity mechanism: every block's upload
//! waits on the previous block's chain value before it can compute its own,
//! which the upload pool models as a sequence of single-shot channels (see
//! `upload.rs`). This module only holds the pure hashing math so it can be
//! unit tested in isolation from the channel plumbing.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest as _, Md5};
use sha2::Sha256;

/// Base64 of sixteen ASCII `'0'` bytes — the chain seed for block index 0.
///
/// Must match bit-for-bit; readers and writers that disagree on this value
/// produce chain headers that can never verify against one another.
pub const H0: &str = "MDAwMDAwMDAwMDAwMDAwMA==";

/// Computes the base64-encoded MD5 digest of a block's payload.
///
/// This value is sent verbatim as the `Content-MD5` header on upload and
/// compared against the same header returned on download.
pub fn content_md5(payload: &[u8]) -> String {
    let digest = Md5::digest(payload);
    STANDARD.encode(digest)
}

/// Computes the next hash-chain value from the previous chain value and this
/// block's content MD5, both taken as their base64 string representations.
///
/// `chain_i = base64(SHA256(chain_{i-1} ∥ md5_i))`, where `∥` is byte
/// concatenation of the two base64 *strings*, not their decoded bytes.
pub fn chain_next(prev_chain_b64: &str, content_md5_b64: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_chain_b64.as_bytes());
    hasher.update(content_md5_b64.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Verifies that `expected_chain` is the chain value that follows from
/// `prev_chain` and `content_md5`. Used symmetrically by the download pool's
/// consumer to detect tampering or corruption.
pub fn verify_chain(prev_chain_b64: &str, content_md5_b64: &str, expected_chain_b64: &str) -> bool {
    chain_next(prev_chain_b64, content_md5_b64) == expected_chain_b64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h0_is_base64_of_sixteen_ascii_zeroes() {
        assert_eq!(STANDARD.encode("0000000000000000"), H0);
    }

    #[test]
    fn content_md5_of_empty_payload_is_the_well_known_value() {
        // The base64 MD5 of the empty string, as commonly used for the
        // `Content-MD5` header on a zero-length body.
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn chain_is_deterministic() {
        let md5_0 = content_md5(b"");
        let chain_0 = chain_next(H0, &md5_0);
        let chain_0_again = chain_next(H0, &md5_0);
        assert_eq!(chain_0, chain_0_again);
    }

    #[test]
    fn chain_diverges_on_any_single_byte_change() {
        let md5_a = content_md5(b"alpha");
        let md5_b = content_md5(b"beta");
        assert_ne!(chain_next(H0, &md5_a), chain_next(H0, &md5_b));
    }

    #[test]
    fn verify_chain_accepts_the_correct_successor_and_rejects_others() {
        let md5_i = content_md5(b"payload");
        let chain_i = chain_next(H0, &md5_i);
        assert!(verify_chain(H0, &md5_i, &chain_i));
        assert!(!verify_chain(H0, &md5_i, "not-the-right-chain"));
        assert!(!verify_chain("not-h0", &md5_i, &chain_i));
    }

    #[test]
    fn chain_order_matters() {
        let md5_a = content_md5(b"a");
        let md5_b = content_md5(b"b");
        let chain_ab = chain_next(&chain_next(H0, &md5_a), &md5_b);
        let chain_ba = chain_next(&chain_next(H0, &md5_b), &md5_a);
        assert_ne!(chain_ab, chain_ba);
    }
}
