//! Per-chunk ChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [16 bytes: Argon2id salt][12 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Salt and nonce are fresh for every call, so encrypting the same plaintext
//! twice with the same password never yields the same bytes.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use secrecy::SecretString;

use crate::error::CryptoError;
use crate::kdf::{derive_key, KdfParams};
use crate::{HEADER_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

/// Salt and nonce prepended to each encrypted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
}

impl EncryptionHeader {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);
        Self { salt, nonce }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..SALT_SIZE].copy_from_slice(&self.salt);
        out[SALT_SIZE..].copy_from_slice(&self.nonce);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < HEADER_SIZE {
            return Err(CryptoError::Truncated {
                len: data.len(),
                min: HEADER_SIZE,
            });
        }
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        salt.copy_from_slice(&data[..SALT_SIZE]);
        nonce.copy_from_slice(&data[SALT_SIZE..HEADER_SIZE]);
        Ok(Self { salt, nonce })
    }
}

/// Encrypt a single chunk under a key derived from `password`.
///
/// - `plaintext`: The (potentially compressed) chunk data
/// - `params`: Argon2id cost, recorded in file metadata for decryption
///
/// Returns: `[salt][nonce][ciphertext][tag]`
pub fn encrypt_chunk(
    plaintext: &[u8],
    password: &SecretString,
    params: &KdfParams,
) -> Result<Vec<u8>, CryptoError> {
    let header = EncryptionHeader::generate();
    let key = derive_key(password, &header.salt, params)?;
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&header.nonce), plaintext)
        .map_err(|e| CryptoError::Encrypt(format!("chunk encryption failed: {e}")))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    result.extend_from_slice(&header.to_bytes());
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a single chunk produced by [`encrypt_chunk`].
///
/// Authentication is checked before any plaintext is returned; a wrong
/// password or altered byte yields [`CryptoError::Authentication`].
pub fn decrypt_chunk(
    encrypted: &[u8],
    password: &SecretString,
    params: &KdfParams,
) -> Result<Vec<u8>, CryptoError> {
    let min = HEADER_SIZE + TAG_SIZE;
    if encrypted.len() < min {
        return Err(CryptoError::Truncated {
            len: encrypted.len(),
            min,
        });
    }

    let header = EncryptionHeader::from_bytes(encrypted)?;
    let key = derive_key(password, &header.salt, params)?;
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(&header.nonce), &encrypted[HEADER_SIZE..])
        .map_err(|_| CryptoError::Authentication)
}
