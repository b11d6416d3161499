//! Content seal for migration files.
//!
//! SHA-256 over the raw file bytes, hex-encoded (64 lowercase characters).
//! No normalisation: any byte change, including line endings, is drift.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded content hash.
pub const HASH_HEX_LEN: usize = 64;

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Shorten a hash for log lines.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_line_endings_are_significant() {
        let unix = content_hash(b"SELECT 1;\n");
        let dos = content_hash(b"SELECT 1;\r\n");
        assert_ne!(unix, dos);
        assert_eq!(unix.len(), HASH_HEX_LEN);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hash("abc"), "abc");
    }
}
