//! BLAKE3 content hashing for files and byte slices
//!
//! Whole-file digests identify the original plaintext; per-chunk digests of
//! the stored bytes detect transport corruption before any decoding.

use std::io::Read;
use std::path::Path;

use tvault_core::{VaultError, VaultResult};

const HASH_BUF: usize = 64 * 1024;

/// 32-byte BLAKE3 digest
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Hash a byte slice and return the lowercase hex digest.
pub fn digest_hex(data: &[u8]) -> String {
    hash_to_hex(&hash_bytes(data))
}

/// Hash a file from disk with a fixed-size read buffer, so memory use does
/// not grow with the file.
pub fn hash_file(path: &Path) -> VaultResult<Hash> {
    let mut file = std::fs::File::open(path)?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUF];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// Lowercase hex form, as stored in metadata records.
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a digest read back from a metadata record.
pub fn hash_from_hex(hex: &str) -> VaultResult<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| VaultError::Other(anyhow::anyhow!("invalid BLAKE3 hex '{hex}': {e}")))
}
