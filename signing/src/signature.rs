//! Digest and raw `r‖s` signature encoding.

use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};

/// Byte width of one P-256 coordinate.
pub const COORDINATE_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 2 * COORDINATE_LEN;

const HASH_PREFIX: &str = "sha256:";

pub fn artifact_digest(artifact: &[u8]) -> [u8; 32] {
    Sha256::digest(artifact).into()
}

/// Digest covering the artifact followed by the exact metadata text.
pub fn digest_with_metadata(artifact: &[u8], metadata: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(artifact);
    hasher.update(metadata);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of the artifact bytes, as stored in policy metadata.
pub fn content_hash(artifact: &[u8]) -> String {
    hex::encode(artifact_digest(artifact))
}

/// Canonical form of a stored hash: `sha256:` prefix removed, lowercase.
pub fn normalize_hash(hash: &str) -> String {
    let hash = hash.trim();
    let hash = match hash.get(..HASH_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(HASH_PREFIX) => &hash[HASH_PREFIX.len()..],
        _ => hash,
    };
    hash.to_ascii_lowercase()
}

/// Compares a stored hash (optionally `sha256:`-prefixed, any case) with the
/// hash of `artifact`.
pub fn hash_matches(expected: &str, artifact: &[u8]) -> bool {
    normalize_hash(expected) == content_hash(artifact)
}

pub fn encode(signature: &Signature) -> Vec<u8> {
    signature.to_bytes().to_vec()
}

/// Decodes an `r‖s` buffer. Older signers emitted coordinates without their
/// leading zero bytes, so any even length up to 64 is split at the midpoint
/// and each half is left-padded back to 32 bytes.
pub fn decode(raw: &[u8]) -> Result<Signature, String> {
    if raw.is_empty() || raw.len() % 2 != 0 || raw.len() > SIGNATURE_LEN {
        return Err(format!("malformed signature length {}", raw.len()));
    }

    let (r, s) = raw.split_at(raw.len() / 2);
    let mut padded = [0u8; SIGNATURE_LEN];
    padded[COORDINATE_LEN - r.len()..COORDINATE_LEN].copy_from_slice(r);
    padded[SIGNATURE_LEN - s.len()..].copy_from_slice(s);

    Signature::from_slice(&padded).map_err(|_| "signature scalars out of range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_matches_prefix_and_case() {
        let hash = content_hash(b"artifact");
        assert!(hash_matches(&hash, b"artifact"));
        assert!(hash_matches(&format!("sha256:{hash}"), b"artifact"));
        assert!(hash_matches(&format!("SHA256:{}", hash.to_uppercase()), b"artifact"));
        assert!(!hash_matches(&hash, b"artifacT"));
        assert!(!hash_matches("", b"artifact"));
    }

    #[test]
    fn test_normalize_hash() {
        assert_eq!(normalize_hash(" SHA256:ABCdef "), "abcdef");
        assert_eq!(normalize_hash("abc"), "abc");
    }

    #[test]
    fn test_digest_with_metadata_differs() {
        assert_ne!(
            artifact_digest(b"wasm"),
            digest_with_metadata(b"wasm", b"{\"version\":\"1.0.0\"}")
        );
        assert_eq!(artifact_digest(b"wasm"), digest_with_metadata(b"wasm", b""));
    }

    #[test]
    fn test_decode_pads_short_coordinates() {
        let mut full = [0u8; SIGNATURE_LEN];
        full[1..32].fill(0x11);
        full[33..].fill(0x22);
        assert_eq!(encode(&decode(&full).unwrap()), full.to_vec());

        // Legacy writers dropped the leading zero byte of each coordinate.
        let mut short = vec![0x11u8; 31];
        short.extend_from_slice(&[0x22u8; 31]);
        assert_eq!(encode(&decode(&short).unwrap()), full.to_vec());
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[1u8; 63]).is_err());
        assert!(decode(&[1u8; 66]).is_err());
        // Zero scalars are never valid.
        assert!(decode(&[0u8; 64]).is_err());
    }
}
