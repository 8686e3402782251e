//! Hazard archive naming, sealing and manifests.

use crate::core::error::{RouteError, RouteResult};
use crate::core::{EngineFinding, FileHash, ScanVerdict, TaskId};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Prefix of every sealed hazard artifact.
pub const HAZARD_MAGIC: &[u8; 8] = b"QGHAZRD1";

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Extension appended to sealed artifacts.
pub const SEALED_EXT: &str = "enc";

/// Operator-supplied key for sealing hazard artifacts.
///
/// The key file holds 64 hex characters (32 bytes); surrounding whitespace
/// is ignored.
#[derive(Clone)]
pub struct HazardKey(Zeroizing<[u8; 32]>);

impl HazardKey {
    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parses a hex-encoded key.
    pub fn from_hex(text: &str) -> RouteResult<Self> {
        let decoded = Zeroizing::new(
            hex::decode(text.trim())
                .map_err(|e| RouteError::Encryption(format!("key is not valid hex: {e}")))?,
        );
        let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            RouteError::Encryption(format!("key must be 32 bytes, got {}", decoded.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Reads a hex-encoded key from a file.
    pub fn from_hex_file(path: &Path) -> RouteResult<Self> {
        let text = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_hex(&text)
    }

    /// Generates a random key.
    pub fn generate() -> Self {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(key.as_slice());
        Self::from_bytes(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.0.as_slice()))
    }

    /// Encrypts a payload.
    ///
    /// Output: `HAZARD_MAGIC || nonce (24 bytes) || ciphertext || tag (16 bytes)`
    pub fn seal(&self, plaintext: &[u8]) -> RouteResult<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|e| RouteError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(HAZARD_MAGIC.len() + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(HAZARD_MAGIC);
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a sealed artifact.
    pub fn open(&self, sealed: &[u8]) -> RouteResult<Vec<u8>> {
        let header = HAZARD_MAGIC.len() + NONCE_LEN;
        if sealed.len() < header + TAG_LEN || !is_sealed(sealed) {
            return Err(RouteError::Encryption("not a sealed hazard artifact".into()));
        }
        let nonce = XNonce::from_slice(&sealed[HAZARD_MAGIC.len()..header]);
        self.cipher()
            .decrypt(nonce, &sealed[header..])
            .map_err(|_| RouteError::Encryption("wrong key or corrupted artifact".into()))
    }
}

impl fmt::Debug for HazardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HazardKey(..)")
    }
}

fn is_sealed(bytes: &[u8]) -> bool {
    bytes.starts_with(HAZARD_MAGIC)
}

/// Deterministic archive name: `{UTC timestamp}_{hash prefix}_{original name}`.
pub fn hazard_file_name(
    archived_at: DateTime<Utc>,
    hash: &FileHash,
    original_name: &str,
    sealed: bool,
) -> String {
    let base = format!(
        "{}_{}_{}",
        archived_at.format("%Y%m%dT%H%M%SZ"),
        hash.short(),
        original_name
    );
    if sealed {
        format!("{base}.{SEALED_EXT}")
    } else {
        base
    }
}

/// Sidecar written next to each hazard artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardManifest {
    /// Task that archived the file.
    pub task_id: TaskId,
    /// Where the file came from.
    pub source_path: PathBuf,
    /// Original file name.
    pub original_name: String,
    /// Plaintext size.
    pub size: u64,
    /// Plaintext hash.
    pub file_hash: FileHash,
    /// Always `SUSPECT`.
    pub verdict: ScanVerdict,
    /// What each engine said.
    pub findings: Vec<EngineFinding>,
    /// Artifact file name inside the hazard directory.
    pub artifact: String,
    /// Whether the artifact is sealed.
    pub encrypted: bool,
    /// When the file was archived.
    pub archived_at: DateTime<Utc>,
}

impl HazardManifest {
    /// Path of the manifest for an artifact.
    pub fn path_for(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_os_string();
        name.push(".json");
        PathBuf::from(name)
    }
}

/// Reads a hazard artifact back, decrypting it when it is sealed.
pub fn open_hazard_artifact(path: &Path, key: Option<&HazardKey>) -> RouteResult<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    if !is_sealed(&bytes) {
        return Ok(bytes);
    }
    match key {
        Some(key) => key.open(&bytes),
        None => Err(RouteError::Encryption(format!(
            "{} is sealed and no key was supplied",
            path.display()
        ))),
    }
}
