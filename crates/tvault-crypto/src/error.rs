use thiserror::Error;
use tvault_core::VaultError;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encrypted data too short: {len} bytes (minimum {min})")]
    Truncated { len: usize, min: usize },

    /// Tag mismatch: wrong password, or the ciphertext was altered.
    #[error("authentication failed: wrong password or corrupted ciphertext")]
    Authentication,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("block counter exhausted after {0} blocks; rekey required")]
    CounterExhausted(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Truncated { .. } | CryptoError::Authentication => {
                VaultError::DecryptionFailure
            }
            CryptoError::Io(io) => VaultError::Io(io),
            other => VaultError::Crypto(other.to_string()),
        }
    }
}
