// API key secrets: generation, hashing, and timing-safe verification.
//
// A key secret is 32 random bytes, presented to the client once as hex.
// The server keeps only the first eight hex characters (for display and
// lookup) and the sha256 of the raw bytes.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub const SECRET_BYTES: usize = 32;

/// Generate a fresh secret, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn first_eight(secret: &str) -> Option<&str> {
    secret.get(..8)
}

/// sha256 of the raw secret bytes, hex-encoded. None when the presented
/// secret is not valid hex.
pub fn hash_secret(secret: &str) -> Option<String> {
    let raw = hex::decode(secret).ok()?;
    let digest = Sha256::digest(&raw);
    Some(hex::encode(digest))
}

/// Compare two digests without early exit on mismatch.
pub fn digests_match(left: &str, right: &str) -> bool {
    let left = left.as_bytes();
    let right = right.as_bytes();
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_BYTES * 2);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn test_round_trip_verification() {
        let secret = generate_secret();
        let stored = hash_secret(&secret).unwrap();
        assert!(digests_match(&hash_secret(&secret).unwrap(), &stored));
        let other = generate_secret();
        assert!(!digests_match(&hash_secret(&other).unwrap(), &stored));
    }

    #[test]
    fn test_non_hex_secret_rejected() {
        assert!(hash_secret("not-hex!").is_none());
    }

    #[test]
    fn test_first_eight() {
        assert_eq!(first_eight("0123456789abcdef"), Some("01234567"));
        assert_eq!(first_eight("0123"), None);
    }

    #[test]
    fn test_digest_compare_length_mismatch() {
        assert!(!digests_match("abc", "abcd"));
        assert!(digests_match("", ""));
    }
}
