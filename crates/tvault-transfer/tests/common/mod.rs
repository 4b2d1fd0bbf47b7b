//! Shared fixtures: an in-memory store, fast config, and a fault-injecting
//! store wrapper.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::Operator;
use secrecy::SecretString;
use tvault_core::{ChannelId, MessageRef, VaultConfig, VaultError, VaultResult};
use tvault_store::{ChannelInfo, Message, MessageFilter, OpendalStore, RemoteStore};
use tvault_transfer::{TransferOptions, Vault};

pub fn memory_store() -> OpendalStore {
    memory_store_with_limit(16 * 1024 * 1024)
}

/// In-memory store that rejects blobs larger than `max_blob` bytes.
pub fn memory_store_with_limit(max_blob: u64) -> OpendalStore {
    let op = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    OpendalStore::new(op, max_blob)
}

/// Small chunks, cheap Argon2, millisecond backoff.
pub fn test_config() -> VaultConfig {
    let mut cfg = VaultConfig::default();
    cfg.vault.chunk_size = 100;
    cfg.crypto.argon2_mem_cost_kib = 1024;
    cfg.crypto.argon2_time_cost = 1;
    cfg.crypto.argon2_parallelism = 1;
    cfg.transfer.retry_base_delay_ms = 1;
    cfg.transfer.retry_max_delay_ms = 10;
    cfg
}

/// Connected, logged in, with a fresh channel.
pub async fn ready_vault<S: RemoteStore>(store: Arc<S>, config: VaultConfig) -> Vault<S> {
    let mut vault = Vault::from_shared(store, config).expect("valid config");
    vault.connect(true).await.expect("connect");
    vault.login("+15550000000").await.expect("login");
    vault.setup_channel(None).await.expect("setup channel");
    vault
}

pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write test file");
    path
}

/// Deterministic, mildly compressible bytes.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len as u64)
        .map(|i| (i.wrapping_mul(31) % 17 + (i / 64) % 3) as u8)
        .collect()
}

pub fn with_password(pw: &str) -> TransferOptions {
    TransferOptions::default().with_password(SecretString::from(pw))
}

/// Wraps a real store and misbehaves on `send_blob` on request.
pub struct FlakyStore {
    pub inner: OpendalStore,
    /// The next N `send_blob` calls are rate limited
    pub rate_limits: AtomicU32,
    /// `send_blob` fails permanently once this many blobs were accepted
    pub blob_limit: AtomicU32,
    pub blobs_sent: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: OpendalStore) -> Self {
        Self {
            inner,
            rate_limits: AtomicU32::new(0),
            blob_limit: AtomicU32::new(u32::MAX),
            blobs_sent: AtomicU32::new(0),
        }
    }

    pub fn rate_limit_next(&self, n: u32) {
        self.rate_limits.store(n, Ordering::SeqCst);
    }

    pub fn fail_after_blobs(&self, n: u32) {
        self.blob_limit.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.rate_limits.store(0, Ordering::SeqCst);
        self.blob_limit.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn sent(&self) -> u32 {
        self.blobs_sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn connect(&self) -> VaultResult<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> VaultResult<()> {
        self.inner.disconnect().await
    }

    async fn is_authorized(&self) -> VaultResult<bool> {
        self.inner.is_authorized().await
    }

    async fn login(&self, phone: &str) -> VaultResult<String> {
        self.inner.login(phone).await
    }

    async fn create_channel(&self, title: &str) -> VaultResult<ChannelInfo> {
        self.inner.create_channel(title).await
    }

    async fn open_channel(&self, channel: ChannelId) -> VaultResult<ChannelInfo> {
        self.inner.open_channel(channel).await
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> VaultResult<MessageRef> {
        self.inner.send_text(channel, text).await
    }

    async fn edit_text(&self, channel: ChannelId, msg: MessageRef, text: &str) -> VaultResult<()> {
        self.inner.edit_text(channel, msg, text).await
    }

    async fn send_blob(
        &self,
        channel: ChannelId,
        data: Bytes,
        filename: &str,
        reply_to: Option<MessageRef>,
    ) -> VaultResult<MessageRef> {
        let limited = self
            .rate_limits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(VaultError::RateLimited {
                wait: Duration::from_millis(1),
            });
        }
        if self.blobs_sent.load(Ordering::SeqCst) >= self.blob_limit.load(Ordering::SeqCst) {
            return Err(VaultError::Storage("connection reset".into()));
        }
        let msg = self.inner.send_blob(channel, data, filename, reply_to).await?;
        self.blobs_sent.fetch_add(1, Ordering::SeqCst);
        Ok(msg)
    }

    async fn get_blob(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Bytes> {
        self.inner.get_blob(channel, msg).await
    }

    async fn get_message(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Message> {
        self.inner.get_message(channel, msg).await
    }

    async fn list_messages(
        &self,
        channel: ChannelId,
        filter: &MessageFilter,
    ) -> VaultResult<Vec<Message>> {
        self.inner.list_messages(channel, filter).await
    }

    async fn pin(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<()> {
        self.inner.pin(channel, msg).await
    }

    async fn delete(&self, channel: ChannelId, msgs: &[MessageRef]) -> VaultResult<()> {
        self.inner.delete(channel, msgs).await
    }

    fn max_blob_size(&self) -> u64 {
        self.inner.max_blob_size()
    }
}
