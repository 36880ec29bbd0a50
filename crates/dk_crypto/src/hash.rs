//! BLAKE3-based hash utilities
//!
//! - Identity fingerprints
//! - Audit-record chain links (each record commits to the previous one)

/// Genesis value for an empty audit chain.
pub const CHAIN_START: &str = "CHAIN_START";

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Hex fingerprint of a public key: the full 32-byte BLAKE3 digest.
///
/// The stored form; `identity::PublicKeyBytes::display_fingerprint` groups a
/// truncated form for humans.
pub fn fingerprint(public_key: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dk-fingerprint-v1\x00");
    hasher.update(public_key);
    hex::encode(hasher.finalize().as_bytes())
}

/// Constant-time equality for two hex fingerprints of equal length.
pub fn fingerprints_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Compute an audit chain link: H(prev_hash || kind || payload), hex-encoded.
pub fn chain_link(prev_hash: &str, kind: &str, payload: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dk-audit-v1\x00");
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\x00");
    hasher.update(kind.as_bytes());
    hasher.update(b"\x00");
    hasher.update(payload);
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = fingerprint(&[1u8; 32]);
        assert_eq!(a, fingerprint(&[1u8; 32]));
        assert_ne!(a, fingerprint(&[2u8; 32]));
        assert_eq!(a.len(), 64);
        assert!(fingerprints_equal(&a, &a.clone()));
        assert!(!fingerprints_equal(&a, &fingerprint(&[2u8; 32])));
    }

    #[test]
    fn chain_link_commits_to_previous() {
        let first = chain_link(CHAIN_START, "revocation", b"{}");
        let second = chain_link(&first, "revocation", b"{}");
        assert_ne!(first, second);
    }
}
