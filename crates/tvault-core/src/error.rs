use std::time::Duration;

use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("not connected: call connect() first")]
    NotConnected,

    #[error("not authenticated: log in to the remote store first")]
    NotAuthenticated,

    #[error("no storage channel configured: run setup first")]
    NoChannelConfigured,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("multiple files match '{query}': {candidates:?}")]
    AmbiguousMatch {
        query: String,
        candidates: Vec<String>,
    },

    /// Stored-bytes digest mismatch, detected before decrypt/decompress.
    #[error("chunk {index} hash mismatch: stored bytes are corrupted")]
    ChunkCorruption { index: u64 },

    /// Whole-file digest mismatch after reassembly.
    #[error("file hash mismatch for {name}: expected {expected}, got {actual}")]
    FileCorruption {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("file {0} has an incomplete chunk list")]
    IncompleteFile(String),

    #[error("file is encrypted but no password was provided")]
    MissingPassword,

    #[error("decryption failed: wrong password or corrupted ciphertext")]
    DecryptionFailure,

    #[error("rate limited by remote store: retry after {wait:?}")]
    RateLimited { wait: Duration },

    #[error("{operation}: gave up after {attempts} rate-limited attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("chunk {index} is empty or out of range")]
    ChunkOutOfRange { index: u64 },

    #[error("unsupported {record} schema version {version}")]
    UnsupportedSchema { record: &'static str, version: u32 },

    #[error("remote record not found: {0}")]
    RecordNotFound(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Only transport overload is retried; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::RateLimited { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VaultError::ChunkCorruption { .. }
                | VaultError::FileCorruption { .. }
                | VaultError::IncompleteFile(_)
                | VaultError::DecryptionFailure
        )
    }
}
