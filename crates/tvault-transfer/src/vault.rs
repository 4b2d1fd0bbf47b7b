//! `Vault`: session state plus the file operations callers use
//!
//! Every file operation needs a connected session (`NotConnected`), an
//! authorized one (`NotAuthenticated`) and a configured storage channel
//! (`NoChannelConfigured`), checked in that order.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvault_core::{ChannelId, FileMetadata, MessageRef, VaultConfig, VaultError, VaultResult};
use tvault_store::{expand_home, ChannelInfo, MessageFilter, RemoteStore};

use crate::engine::{self, EngineOptions, TransferOptions};
use crate::index::{load_index, save_index, IndexRecord};
use crate::journal::{lock, SharedJournal, TransferJournal};

/// Title given to channels created by [`Vault::setup_channel`].
pub const DEFAULT_CHANNEL_TITLE: &str = "tvault storage";

/// Aggregate numbers reported by [`Vault::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub channel_id: ChannelId,
    pub file_count: usize,
    /// Plaintext bytes across all files
    pub total_size: u64,
    /// Bytes actually held by the store
    pub stored_size: u64,
    /// `stored_size / total_size`, 1.0 for an empty vault
    pub compression_ratio: f64,
}

pub struct Vault<S: RemoteStore> {
    store: Arc<S>,
    config: VaultConfig,
    /// Where `setup_channel` persists the chosen channel
    config_path: Option<PathBuf>,
    engine: EngineOptions,
    connected: bool,
    authorized: bool,
    journal: Option<SharedJournal>,
}

impl<S: RemoteStore> Vault<S> {
    pub fn new(store: S, config: VaultConfig) -> VaultResult<Self> {
        Self::from_shared(Arc::new(store), config)
    }

    pub fn from_shared(store: Arc<S>, config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let journal = match &config.transfer.journal_path {
            Some(path) => Some(TransferJournal::open(&expand_home(path))?.shared()),
            None => None,
        };
        Ok(Self {
            store,
            engine: EngineOptions::from_config(&config),
            config,
            config_path: None,
            connected: false,
            authorized: false,
            journal,
        })
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.config.vault.channel_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connect to the store and, unless `skip_channel`, open the configured
    /// channel when the session is already authorized.
    pub async fn connect(&mut self, skip_channel: bool) -> VaultResult<()> {
        self.store.connect().await?;
        self.authorized = self.store.is_authorized().await?;
        if !skip_channel && self.authorized {
            if let Some(id) = self.config.vault.channel_id {
                let channel = self.store.open_channel(id).await?;
                debug!(channel_id = channel.id, title = %channel.title, "opened channel");
            }
        }
        self.connected = true;
        info!(authorized = self.authorized, "connected to remote store");
        Ok(())
    }

    pub async fn disconnect(&mut self) -> VaultResult<()> {
        if self.connected {
            self.store.disconnect().await?;
            self.connected = false;
        }
        Ok(())
    }

    pub async fn is_authenticated(&self) -> VaultResult<bool> {
        self.ensure_connected()?;
        self.store.is_authorized().await
    }

    /// Establish a session; returns the session string from the store.
    pub async fn login(&mut self, phone: &str) -> VaultResult<String> {
        self.ensure_connected()?;
        let session = self.store.login(phone).await?;
        self.authorized = true;
        info!("logged in");
        Ok(session)
    }

    /// Use channel `id`, or create a new one, and remember it in the config.
    pub async fn setup_channel(&mut self, id: Option<ChannelId>) -> VaultResult<ChannelInfo> {
        self.ensure_authorized()?;
        let channel = match id {
            Some(id) => self.store.open_channel(id).await?,
            None => self.store.create_channel(DEFAULT_CHANNEL_TITLE).await?,
        };
        self.config.vault.channel_id = Some(channel.id);
        if let Some(path) = &self.config_path {
            self.config.save(path)?;
        }
        info!(channel_id = channel.id, title = %channel.title, "storage channel configured");
        Ok(channel)
    }

    fn ensure_connected(&self) -> VaultResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(VaultError::NotConnected)
        }
    }

    fn ensure_authorized(&self) -> VaultResult<()> {
        self.ensure_connected()?;
        if self.authorized {
            Ok(())
        } else {
            Err(VaultError::NotAuthenticated)
        }
    }

    fn channel(&self) -> VaultResult<ChannelId> {
        self.ensure_authorized()?;
        self.config
            .vault
            .channel_id
            .ok_or(VaultError::NoChannelConfigured)
    }

    /// Upload a file and publish it into the index.
    pub async fn upload(&self, path: &Path, opts: &TransferOptions) -> VaultResult<FileMetadata> {
        let channel = self.channel()?;
        let meta = engine::upload_file(
            &self.store,
            channel,
            path,
            &self.engine,
            opts,
            self.journal.as_ref(),
        )
        .await?;
        let meta_ref = meta
            .remote_ref
            .ok_or_else(|| VaultError::RecordNotFound(format!("metadata for {}", meta.id)))?;

        let mut record = self.load_index(channel, &opts.cancel).await?;
        record.index.add_file(meta.id.as_str(), meta_ref);
        save_index(
            self.store.as_ref(),
            channel,
            &mut record,
            &self.engine.retry,
            &opts.cancel,
        )
        .await?;

        if let Some(journal) = &self.journal {
            lock(journal).finish(path)?;
        }
        info!(file_id = %meta.id, name = %meta.name, "file published");
        Ok(meta)
    }

    /// Download a file by id or name.
    ///
    /// Without `output` the file lands in the working directory; an existing
    /// directory receives the file under its stored name.
    pub async fn download(
        &self,
        query: &str,
        output: Option<&Path>,
        opts: &TransferOptions,
    ) -> VaultResult<PathBuf> {
        let channel = self.channel()?;
        let meta = self.resolve(query).await?;
        let dest = output_path(&meta, output)?;
        engine::download_file(&self.store, channel, &meta, &dest, &self.engine, opts).await
    }

    /// Every readable file in the vault, sorted by name.
    pub async fn list_files(&self) -> VaultResult<Vec<FileMetadata>> {
        let channel = self.channel()?;
        let cancel = CancellationToken::new();
        let record = self.load_index(channel, &cancel).await?;
        self.collect_files(channel, &record, &cancel).await
    }

    /// Case-insensitive substring match on file names.
    pub async fn search(&self, query: &str) -> VaultResult<Vec<FileMetadata>> {
        let needle = query.to_lowercase();
        Ok(self
            .list_files()
            .await?
            .into_iter()
            .filter(|m| m.name.to_lowercase().contains(&needle))
            .collect())
    }

    /// Find exactly one file: by id, else by exact name, else by
    /// case-insensitive substring. More than one candidate in the first
    /// non-empty tier is an error.
    pub async fn resolve(&self, query: &str) -> VaultResult<FileMetadata> {
        let channel = self.channel()?;
        let cancel = CancellationToken::new();
        let record = self.load_index(channel, &cancel).await?;
        if let Some(meta_ref) = record.index.get(query) {
            return self.fetch_metadata(channel, meta_ref, &cancel).await;
        }

        let files = self.collect_files(channel, &record, &cancel).await?;
        let exact: Vec<&FileMetadata> = files.iter().filter(|m| m.name == query).collect();
        let candidates = if exact.is_empty() {
            let needle = query.to_lowercase();
            files
                .iter()
                .filter(|m| m.name.to_lowercase().contains(&needle))
                .collect()
        } else {
            exact
        };

        match candidates.as_slice() {
            [] => Err(VaultError::FileNotFound(query.to_string())),
            [one] => Ok((*one).clone()),
            many => Err(VaultError::AmbiguousMatch {
                query: query.to_string(),
                candidates: many.iter().map(|m| format!("{} ({})", m.name, m.id)).collect(),
            }),
        }
    }

    /// Delete a file by id or exact name: its chunks, its metadata record
    /// and its index entry. Returns `false` when nothing matches.
    pub async fn delete(&self, query: &str) -> VaultResult<bool> {
        let channel = self.channel()?;
        let cancel = CancellationToken::new();
        let retry = &self.engine.retry;
        let mut record = self.load_index(channel, &cancel).await?;

        let (file_id, meta_ref) = match record.index.get(query) {
            Some(meta_ref) => (query.to_string(), meta_ref),
            None => {
                let files = self.collect_files(channel, &record, &cancel).await?;
                let named: Vec<&FileMetadata> = files.iter().filter(|m| m.name == query).collect();
                match named.as_slice() {
                    [] => return Ok(false),
                    [one] => match one.remote_ref.or_else(|| record.index.get(&one.id)) {
                        Some(meta_ref) => (one.id.clone(), meta_ref),
                        None => return Ok(false),
                    },
                    many => {
                        return Err(VaultError::AmbiguousMatch {
                            query: query.to_string(),
                            candidates: many.iter().map(|m| format!("{} ({})", m.name, m.id)).collect(),
                        })
                    }
                }
            }
        };

        let mut refs = BTreeSet::from([meta_ref]);
        match self.fetch_metadata(channel, meta_ref, &cancel).await {
            Ok(meta) => refs.extend(meta.chunks.iter().map(|c| c.remote_ref)),
            Err(e) if is_unreadable(&e) => {
                warn!(file_id = %file_id, "metadata unreadable, deleting reply blobs only: {e}")
            }
            Err(e) => return Err(e),
        }
        // Also catches chunks of an upload that never finalized
        let filter = MessageFilter::replies_to(meta_ref);
        let replies = retry
            .run("list chunks", &cancel, || self.store.list_messages(channel, &filter))
            .await?;
        refs.extend(replies.iter().map(|m| m.msg_ref));

        let refs: Vec<MessageRef> = refs.into_iter().collect();
        retry
            .run("delete messages", &cancel, || self.store.delete(channel, &refs))
            .await?;

        record.index.remove_file(&file_id);
        save_index(self.store.as_ref(), channel, &mut record, retry, &cancel).await?;
        info!(file_id = %file_id, messages = refs.len(), "file deleted");
        Ok(true)
    }

    pub async fn status(&self) -> VaultResult<VaultStatus> {
        let channel = self.channel()?;
        let files = self.list_files().await?;
        let total_size: u64 = files.iter().map(|m| m.size).sum();
        let stored_size: u64 = files.iter().map(|m| m.total_stored_size()).sum();
        let compression_ratio = if total_size == 0 {
            1.0
        } else {
            stored_size as f64 / total_size as f64
        };
        Ok(VaultStatus {
            channel_id: channel,
            file_count: files.len(),
            total_size,
            stored_size,
            compression_ratio,
        })
    }

    async fn load_index(
        &self,
        channel: ChannelId,
        cancel: &CancellationToken,
    ) -> VaultResult<IndexRecord> {
        load_index(self.store.as_ref(), channel, &self.engine.retry, cancel).await
    }

    async fn fetch_metadata(
        &self,
        channel: ChannelId,
        meta_ref: MessageRef,
        cancel: &CancellationToken,
    ) -> VaultResult<FileMetadata> {
        let msg = self
            .engine
            .retry
            .run("get metadata", cancel, || self.store.get_message(channel, meta_ref))
            .await?;
        let text = msg
            .text
            .ok_or_else(|| VaultError::RecordNotFound(format!("metadata record {meta_ref}")))?;
        let mut meta = FileMetadata::from_json(&text)?;
        meta.remote_ref.get_or_insert(meta_ref);
        Ok(meta)
    }

    /// Metadata for every index entry, skipping records that are gone or
    /// unparsable.
    async fn collect_files(
        &self,
        channel: ChannelId,
        record: &IndexRecord,
        cancel: &CancellationToken,
    ) -> VaultResult<Vec<FileMetadata>> {
        let mut files = Vec::with_capacity(record.index.len());
        for (file_id, &meta_ref) in &record.index.files {
            match self.fetch_metadata(channel, meta_ref, cancel).await {
                Ok(meta) => files.push(meta),
                Err(e) if is_unreadable(&e) => {
                    warn!(file_id = %file_id, %meta_ref, "skipping unreadable metadata: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(files)
    }
}

fn is_unreadable(e: &VaultError) -> bool {
    matches!(
        e,
        VaultError::RecordNotFound(_)
            | VaultError::Serialization(_)
            | VaultError::UnsupportedSchema { .. }
    )
}

/// Destination for a download. Only the final component of the stored name
/// is used, so a record cannot write outside the chosen directory.
fn output_path(meta: &FileMetadata, output: Option<&Path>) -> VaultResult<PathBuf> {
    let name = Path::new(&meta.name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| meta.id.clone().into());
    Ok(match output {
        None => std::env::current_dir()?.join(name),
        Some(dir) if dir.is_dir() => dir.join(name),
        Some(path) => path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata::placeholder("0123456789ab", name, 0, "h", 100)
    }

    #[test]
    fn output_into_directory_uses_stored_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = output_path(&meta("report.txt"), Some(tmp.path())).unwrap();
        assert_eq!(dest, tmp.path().join("report.txt"));
    }

    #[test]
    fn explicit_file_path_is_kept() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("renamed.bin");
        let dest = output_path(&meta("report.txt"), Some(&target)).unwrap();
        assert_eq!(dest, target);
    }

    #[test]
    fn stored_name_cannot_escape_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dest = output_path(&meta("../../etc/passwd"), Some(tmp.path())).unwrap();
        assert_eq!(dest, tmp.path().join("passwd"));

        let dest = output_path(&meta(".."), Some(tmp.path())).unwrap();
        assert_eq!(dest, tmp.path().join("0123456789ab"));
    }
}
