//! ETag normalization and SHA-256 file hashing.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Strips a leading weak-validator marker and outer quotes, then
/// lowercases — e.g. `W/"AbC123"` -> `abc123`.
pub fn normalize_etag(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_weak = trimmed.strip_prefix("W/").unwrap_or(trimmed).trim();
    let unquoted = without_weak
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(without_weak);
    unquoted.to_lowercase()
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_etag_strips_weak_marker_and_quotes() {
        assert_eq!(normalize_etag("W/\"AbC123\""), "abc123");
        assert_eq!(normalize_etag("\"DEF456\""), "def456");
        assert_eq!(normalize_etag("plain"), "plain");
    }

    #[test]
    fn is_sha256_hex_checks_length_and_charset() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(!is_sha256_hex(&"a".repeat(63)));
        assert!(!is_sha256_hex(&"z".repeat(64)));
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let digest = sha256_file(&path).unwrap();
        assert_eq!(digest, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    }

    #[test]
    fn sha256_file_detects_a_single_flipped_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        let original = sha256_file(&path).unwrap();
        std::fs::write(&path, [0u8, 1, 2, 4]).unwrap();
        let flipped = sha256_file(&path).unwrap();
        assert_ne!(original, flipped);
    }
}
