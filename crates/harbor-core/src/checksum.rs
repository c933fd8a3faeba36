//! Streaming SHA-256 checksums for files and chunks.
//!
//! All digests are lowercase hex, 64 characters. Whole-file digests read
//! in 64 KiB chunks so large files never land in memory at once.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::CHECKSUM_BUF_SIZE;
use crate::error::Result;

/// Incremental SHA-256 over a byte stream
pub struct Hasher {
    inner: Sha256,
    bytes_processed: u64,
}

impl Hasher {
    /// Create a fresh hasher
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            bytes_processed: 0,
        }
    }

    /// Feed bytes into the digest
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Total bytes fed so far
    #[must_use]
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Consume the hasher and return the lowercase hex digest
    #[must_use]
    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest a byte slice
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Digest an entire file, reading in 64 KiB chunks
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn hash_file(path: &Path) -> Result<String> {
    hash_file_with(path, |_| {}).await
}

/// Digest an entire file, invoking `progress` with the byte count of each
/// chunk read
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn hash_file_with(path: &Path, mut progress: impl FnMut(u64)) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; CHECKSUM_BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        progress(n as u64);
    }

    Ok(hasher.finalize())
}

/// Compare two hex digests, case-insensitively
#[must_use]
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Check that a string is a well-formed SHA-256 hex digest
#[must_use]
pub fn is_valid_digest(checksum: &str) -> bool {
    checksum.len() == 64 && checksum.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // SHA-256 of the empty string
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_hash_bytes_known_vector() {
        assert_eq!(hash_bytes(b""), EMPTY_SHA256);
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = vec![0x5a; 200_000];

        let mut hasher = Hasher::new();
        for chunk in data.chunks(7919) {
            hasher.update(chunk);
        }

        assert_eq!(hasher.bytes_processed(), data.len() as u64);
        assert_eq!(hasher.finalize(), hash_bytes(&data));
    }

    #[tokio::test]
    async fn test_hash_file_matches_bytes() {
        let mut temp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        temp.write_all(&data).unwrap();
        temp.flush().unwrap();

        let digest = hash_file(temp.path()).await.unwrap();
        assert_eq!(digest, hash_bytes(&data));
    }

    #[tokio::test]
    async fn test_hash_file_progress_sums_to_size() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[1u8; 100_000]).unwrap();
        temp.flush().unwrap();

        let mut total = 0u64;
        hash_file_with(temp.path(), |n| total += n).await.unwrap();
        assert_eq!(total, 100_000);
    }

    #[tokio::test]
    async fn test_hash_file_missing() {
        let result = hash_file(Path::new("/nonexistent/harbor/file")).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_digests_match_case_insensitive() {
        assert!(digests_match(EMPTY_SHA256, &EMPTY_SHA256.to_uppercase()));
        assert!(!digests_match(EMPTY_SHA256, "abcdef"));
    }

    #[test]
    fn test_is_valid_digest() {
        assert!(is_valid_digest(EMPTY_SHA256));
        assert!(is_valid_digest(&EMPTY_SHA256.to_uppercase()));
        assert!(!is_valid_digest(""));
        assert!(!is_valid_digest("abc"));
        assert!(!is_valid_digest(&"g".repeat(64)));
    }
}
