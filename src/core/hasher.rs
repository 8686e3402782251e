//! Streaming file hashing with BLAKE3.
//!
//! `FileHasher` computes the integrity hash used at every stage boundary:
//! source, quarantine copy and delivered copy are all compared by BLAKE3.
//! SHA256 can be enabled for hazard manifests that external tools consume.

use crate::core::types::FileHash;

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Read buffer size for streaming hashes.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for computing file hashes.
///
/// # Examples
///
/// ```rust
/// use quarantine_gate::core::FileHasher;
///
/// // Default: only BLAKE3
/// let hasher = FileHasher::new();
///
/// // With SHA256 for external lookups
/// let hasher = FileHasher::new().with_sha256(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileHasher {
    compute_sha256: bool,
}

impl FileHasher {
    /// Creates a new `FileHasher` with default settings (BLAKE3 only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables SHA256 hash computation.
    pub fn with_sha256(mut self, enabled: bool) -> Self {
        self.compute_sha256 = enabled;
        self
    }

    /// Returns whether SHA256 computation is enabled.
    pub fn computes_sha256(&self) -> bool {
        self.compute_sha256
    }

    /// Computes hashes from bytes already in memory.
    pub fn hash_bytes(&self, data: &[u8]) -> FileHash {
        let blake3 = blake3::hash(data).to_hex().to_string();
        let sha256 = self
            .compute_sha256
            .then(|| hex::encode(Sha256::digest(data)));
        FileHash { blake3, sha256 }
    }

    /// Computes hashes of a file, streaming it so large files never sit in memory.
    pub fn hash_file(&self, path: &Path) -> std::io::Result<FileHash> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        self.hash_reader(&mut reader)
    }

    /// Computes hashes from a synchronous reader in a single pass.
    pub fn hash_reader<R: Read>(&self, reader: &mut R) -> std::io::Result<FileHash> {
        let mut blake3_hasher = blake3::Hasher::new();
        let mut sha256_hasher = self.compute_sha256.then(Sha256::new);

        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            let chunk = &buffer[..bytes_read];
            blake3_hasher.update(chunk);
            if let Some(ref mut h) = sha256_hasher {
                h.update(chunk);
            }
        }

        Ok(FileHash {
            blake3: blake3_hasher.finalize().to_hex().to_string(),
            sha256: sha256_hasher.map(|h| hex::encode(h.finalize())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_bytes_blake3_only() {
        let hash = FileHasher::new().hash_bytes(b"hello world");
        assert_eq!(hash.blake3.len(), 64);
        assert_eq!(hash.sha256, None);
    }

    #[test]
    fn test_hash_bytes_with_sha256() {
        let hash = FileHasher::new().with_sha256(true).hash_bytes(b"hello world");
        assert_eq!(
            hash.sha256.as_deref(),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![7u8; HASH_BUFFER_SIZE * 3 + 17];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let hasher = FileHasher::new().with_sha256(true);
        assert_eq!(hasher.hash_file(file.path()).unwrap(), hasher.hash_bytes(&data));
    }

    #[test]
    fn test_hash_different_data() {
        let hasher = FileHasher::new();
        assert_ne!(hasher.hash_bytes(b"data1"), hasher.hash_bytes(b"data2"));
    }

    #[test]
    fn test_hash_missing_file() {
        let err = FileHasher::new()
            .hash_file(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
