// In restorer/src/provenance.rs
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    finish_hex(hasher)
}

/// Finalizes an incremental hasher into its hex digest.
pub fn finish_hex(hasher: Sha256) -> String {
    hex::encode(hasher.finalize())
}
