use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};
use crate::types::{ChannelId, KdfSettings};

/// Default plaintext chunk size: 100 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Largest chunk the transport accepts, with margin for codec overhead
pub const MAX_CHUNK_SIZE: u64 = 2000 * 1024 * 1024;

/// Top-level configuration (loaded from tvault.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub log: LogConfig,
    pub store: StoreConfig,
    pub vault: VaultSettings,
    pub transfer: TransferConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend for the message store: "fs" or "memory"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Largest blob the store accepts, in bytes
    pub max_blob_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Storage channel, set by `setup`
    pub channel_id: Option<ChannelId>,
    /// Plaintext bytes per chunk
    pub chunk_size: u64,
    /// Compress chunks of compressible file types
    pub compression: bool,
    /// Encrypt chunks when a password is available
    pub encryption: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent chunk uploads per file
    pub parallel_uploads: usize,
    /// Reserved: accepted and validated, but downloads currently fetch
    /// chunks one at a time in index order
    pub parallel_downloads: usize,
    /// Retry limit for rate-limited remote calls
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds
    pub retry_base_delay_ms: u64,
    /// Backoff cap in milliseconds (server-mandated waits may exceed it)
    pub retry_max_delay_ms: u64,
    /// Local journal of in-flight uploads, enables resume
    pub journal_path: Option<PathBuf>,
}

/// Argon2id cost parameters for per-chunk key derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: PathBuf::from("~/.local/share/tvault/store"),
            max_blob_size: 2048 * 1024 * 1024,
        }
    }
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            channel_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: true,
            encryption: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel_uploads: 3,
            parallel_downloads: 5,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            journal_path: None,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl CryptoConfig {
    pub fn kdf_settings(&self) -> KdfSettings {
        KdfSettings {
            mem_cost_kib: self.argon2_mem_cost_kib,
            time_cost: self.argon2_time_cost,
            parallelism: self.argon2_parallelism,
        }
    }
}

impl VaultConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: VaultConfig = toml::from_str(&content).map_err(|e| {
            VaultError::InvalidConfiguration(format!("parsing {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| VaultError::InvalidConfiguration(format!("serializing config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> VaultResult<()> {
        let chunk_size = self.vault.chunk_size;
        if chunk_size == 0 {
            return Err(VaultError::InvalidConfiguration(
                "vault.chunk_size must be greater than zero".into(),
            ));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(VaultError::InvalidConfiguration(format!(
                "vault.chunk_size {chunk_size} exceeds transport maximum {MAX_CHUNK_SIZE}"
            )));
        }
        if chunk_size > self.store.max_blob_size {
            return Err(VaultError::InvalidConfiguration(format!(
                "vault.chunk_size {chunk_size} exceeds store.max_blob_size {}",
                self.store.max_blob_size
            )));
        }
        if self.transfer.parallel_uploads == 0 || self.transfer.parallel_downloads == 0 {
            return Err(VaultError::InvalidConfiguration(
                "transfer parallelism must be at least 1".into(),
            ));
        }
        if self.crypto.argon2_time_cost == 0 || self.crypto.argon2_parallelism == 0 {
            return Err(VaultError::InvalidConfiguration(
                "crypto.argon2_time_cost and crypto.argon2_parallelism must be at least 1".into(),
            ));
        }
        if self.crypto.argon2_mem_cost_kib < 8 * self.crypto.argon2_parallelism {
            return Err(VaultError::InvalidConfiguration(
                "crypto.argon2_mem_cost_kib must be at least 8 KiB per lane".into(),
            ));
        }
        Ok(())
    }
}
