//! Transfer engine: chunked upload and download against a [`RemoteStore`]
//!
//! Upload:
//!   hash → publish placeholder metadata → split → (compress) → (encrypt) →
//!   send each chunk as a blob replying to the placeholder → finalize metadata
//!
//! Chunks are processed by a bounded worker pool. Publishing the finished
//! record into the vault index is the caller's last step, so a crash before
//! it leaves only unreachable blobs behind.
//!
//! Download:
//!   fetch chunks in index order → verify stored digest → (decrypt) →
//!   (decompress) → write at offset → verify whole-file hash

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use secrecy::SecretString;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tvault_chunks::{
    check_chunk_size, chunk_filename, compress, count_chunks, decompress_bounded, digest_hex,
    hash_file, hash_to_hex, max_compressed_size, read_chunk, should_compress, split, Chunk,
    ChunkWriter, Splitter,
};
use tvault_core::types::unix_now;
use tvault_core::{
    ChannelId, ChunkInfo, FileMetadata, MessageRef, TransferOperation, TransferProgress,
    VaultConfig, VaultError, VaultResult,
};
use tvault_crypto::{decrypt_chunk, encrypt_chunk, KdfParams, HEADER_SIZE, TAG_SIZE};
use tvault_store::RemoteStore;

use crate::journal::{lock, JournalEntry, SharedJournal};
use crate::progress::{ProgressFn, TransferUpdate};
use crate::retry::RetryPolicy;

/// Settings that shape how files are chunked, encoded and sent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    pub chunk_size: u64,
    pub compression: bool,
    pub encryption: bool,
    pub parallel_uploads: usize,
    /// Argon2id cost for newly encrypted chunks
    pub kdf: KdfParams,
    pub retry: RetryPolicy,
}

impl EngineOptions {
    pub fn from_config(cfg: &VaultConfig) -> Self {
        Self {
            chunk_size: cfg.vault.chunk_size,
            compression: cfg.vault.compression,
            encryption: cfg.vault.encryption,
            parallel_uploads: cfg.transfer.parallel_uploads,
            kdf: cfg.crypto.kdf_settings().into(),
            retry: RetryPolicy::from_config(&cfg.transfer),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&VaultConfig::default())
    }
}

/// Per-call options: key material, progress observer, cancellation.
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub password: Option<Arc<SecretString>>,
    pub progress: Option<ProgressFn>,
    pub cancel: CancellationToken,
}

impl TransferOptions {
    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(Arc::new(password));
        self
    }

    pub fn with_progress(mut self, f: impl Fn(&TransferUpdate) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Short random file id: the first 12 hex chars of a digest over the name,
/// size and a random salt.
pub fn generate_file_id(name: &str, size: u64) -> String {
    let salt: u32 = rand::thread_rng().gen();
    let digest = digest_hex(format!("{name}:{size}:{salt:08x}").as_bytes());
    digest[..12].to_string()
}

/// Run blocking work (file I/O, zstd, Argon2) off the async workers.
async fn blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_error)?
}

fn join_error(e: JoinError) -> VaultError {
    VaultError::Other(anyhow::anyhow!("transfer task failed: {e}"))
}

/// The compress/encrypt stages applied to one chunk's bytes.
#[derive(Clone)]
pub struct ChunkCodec {
    pub compress: bool,
    /// Encrypt (or decrypt) when set
    pub password: Option<Arc<SecretString>>,
    pub kdf: KdfParams,
}

impl ChunkCodec {
    pub fn encode(&self, data: Vec<u8>) -> VaultResult<Vec<u8>> {
        let data = if self.compress { compress(&data)? } else { data };
        match &self.password {
            Some(password) => Ok(encrypt_chunk(&data, password, &self.kdf)?),
            None => Ok(data),
        }
    }

    /// Invert [`ChunkCodec::encode`]. Decompression may not exceed `limit`.
    pub fn decode(&self, stored: &[u8], limit: u64) -> VaultResult<Vec<u8>> {
        let data = match &self.password {
            Some(password) => decrypt_chunk(stored, password, &self.kdf)?,
            None => stored.to_vec(),
        };
        if self.compress {
            decompress_bounded(&data, limit)
        } else {
            Ok(data)
        }
    }
}

/// Plaintext length of chunk `index` in a file of `size` bytes.
fn plain_len(size: u64, chunk_size: u64, index: u64) -> u64 {
    let start = index.saturating_mul(chunk_size);
    size.saturating_sub(start).min(chunk_size)
}

/// Where upload workers get their chunks from.
enum ChunkSource {
    /// Fresh upload: split the whole file lazily
    Sequential(Splitter<BufReader<File>>),
    /// Resumed upload: read only the chunks still missing
    Pending {
        path: PathBuf,
        chunk_size: u64,
        indices: std::vec::IntoIter<u64>,
    },
}

impl Iterator for ChunkSource {
    type Item = VaultResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ChunkSource::Sequential(splitter) => splitter.next(),
            ChunkSource::Pending {
                path,
                chunk_size,
                indices,
            } => indices
                .next()
                .map(|index| read_chunk(path, index, *chunk_size)),
        }
    }
}

/// Largest blob a full chunk can turn into after encoding.
fn max_stored_size(chunk_size: u64, compress: bool, encrypted: bool) -> u64 {
    let mut size = chunk_size;
    if compress {
        size = max_compressed_size(size);
    }
    if encrypted {
        size = size.saturating_add((HEADER_SIZE + TAG_SIZE) as u64);
    }
    size
}

/// Results gathered from the workers of one upload.
struct UploadAccumulator {
    chunks: BTreeMap<u64, ChunkInfo>,
    completed: u64,
    transferred: u64,
}

/// State shared by every worker of one upload.
struct UploadContext<S> {
    store: Arc<S>,
    channel: ChannelId,
    meta_ref: MessageRef,
    file_id: String,
    file_name: String,
    file_size: u64,
    total_chunks: u64,
    codec: ChunkCodec,
    retry: RetryPolicy,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
    source: PathBuf,
    journal: Option<SharedJournal>,
    acc: Mutex<UploadAccumulator>,
}

impl<S: RemoteStore> UploadContext<S> {
    /// Record a landed chunk. The journal is flushed on the blocking pool
    /// first; the progress callback then fires under the accumulator lock so
    /// observers never see counts go backwards.
    async fn record(&self, info: ChunkInfo, plain: u64) -> VaultResult<()> {
        if let Some(journal) = &self.journal {
            let journal = Arc::clone(journal);
            let source = self.source.clone();
            let file_id = self.file_id.clone();
            let landed = info.clone();
            blocking(move || lock(&journal).record_chunk(&source, &file_id, &landed)).await?;
        }
        let mut acc = lock(&self.acc);
        acc.completed += 1;
        acc.transferred += plain;
        let update = TransferUpdate {
            operation: TransferOperation::Upload,
            file_name: self.file_name.clone(),
            total_size: self.file_size,
            transferred_size: acc.transferred,
            total_chunks: self.total_chunks,
            completed_chunks: acc.completed,
            current_chunk: info.index,
        };
        acc.chunks.insert(info.index, info);
        if let Some(progress) = &self.progress {
            progress(&update);
        }
        Ok(())
    }
}

async fn upload_chunk<S: RemoteStore>(ctx: Arc<UploadContext<S>>, chunk: Chunk) -> VaultResult<()> {
    let index = chunk.index;
    let plain = chunk.size;

    let codec = ctx.codec.clone();
    let stored = blocking(move || codec.encode(chunk.data)).await?;
    let hash = digest_hex(&stored);
    let size = stored.len() as u64;
    let stored = Bytes::from(stored);
    let filename = chunk_filename(&ctx.file_id, index);

    let remote_ref = ctx
        .retry
        .run("send chunk", &ctx.cancel, || {
            ctx.store
                .send_blob(ctx.channel, stored.clone(), &filename, Some(ctx.meta_ref))
        })
        .await?;
    debug!(file_id = %ctx.file_id, index, plain, stored = size, %remote_ref, "chunk uploaded");

    ctx.record(
        ChunkInfo {
            index,
            remote_ref,
            size,
            hash,
        },
        plain,
    )
    .await
}

/// Upload `source` into `channel` and return its finalized metadata record
/// (with `remote_ref` set). The caller publishes it into the index.
pub async fn upload_file<S: RemoteStore>(
    store: &Arc<S>,
    channel: ChannelId,
    source: &Path,
    opts: &EngineOptions,
    transfer: &TransferOptions,
    journal: Option<&SharedJournal>,
) -> VaultResult<FileMetadata> {
    check_chunk_size(opts.chunk_size)?;
    let cancel = &transfer.cancel;

    let size = match tokio::fs::metadata(source).await {
        Ok(m) if m.is_file() => m.len(),
        Ok(_) => return Err(VaultError::FileNotFound(source.display().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VaultError::FileNotFound(source.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| VaultError::FileNotFound(source.display().to_string()))?;

    let compress = opts.compression && should_compress(&name);
    let password = if opts.encryption {
        transfer.password.clone()
    } else {
        None
    };
    let encrypted = password.is_some();

    // Checked before anything is published, so an oversize chunk never
    // leaves a placeholder behind.
    let stored_max = max_stored_size(opts.chunk_size, compress, encrypted);
    let blob_limit = store.max_blob_size();
    if stored_max > blob_limit {
        return Err(VaultError::InvalidConfiguration(format!(
            "chunk_size {} can encode to {stored_max} bytes, store limit is {blob_limit}",
            opts.chunk_size
        )));
    }

    let path = source.to_path_buf();
    let hash = blocking(move || hash_file(&path).map(|h| hash_to_hex(&h))).await?;

    let count = count_chunks(size, opts.chunk_size);
    // An empty file still counts as one (empty) unit of progress
    let total_chunks = count.max(1);

    let mut planned = FileMetadata::placeholder("", name.as_str(), size, hash, opts.chunk_size);
    planned.compressed = compress;
    planned.encrypted = encrypted;
    planned.kdf = encrypted.then(|| opts.kdf.into());

    let resumed = match journal {
        Some(j) => lock(j).get(source).filter(|e| e.matches(&planned)).cloned(),
        None => None,
    };
    let resumed = match resumed {
        Some(entry) => match entry.metadata.remote_ref {
            Some(meta_ref) => match opts
                .retry
                .run("check placeholder", cancel, || store.get_message(channel, meta_ref))
                .await
            {
                Ok(_) => Some((entry, meta_ref)),
                Err(VaultError::RecordNotFound(_)) => {
                    warn!(source = %source.display(), "journaled placeholder is gone, starting over");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        },
        None => None,
    };

    let (meta, meta_ref, done) = match resumed {
        Some((entry, meta_ref)) => {
            info!(
                file_id = %entry.metadata.id,
                done = entry.chunks.len(),
                total = count,
                "resuming upload"
            );
            (entry.metadata, meta_ref, entry.chunks)
        }
        None => {
            planned.id = generate_file_id(&name, size);
            let text = planned.to_json()?;
            let meta_ref = opts
                .retry
                .run("send metadata", cancel, || store.send_text(channel, &text))
                .await?;
            planned.remote_ref = Some(meta_ref);
            if let Some(j) = journal {
                let progress =
                    TransferProgress::new(TransferOperation::Upload, &planned.id, &name, count);
                let entry = JournalEntry::new(progress, planned.clone());
                let (j, src) = (Arc::clone(j), source.to_path_buf());
                blocking(move || lock(&j).begin(&src, entry)).await?;
            }
            debug!(file_id = %planned.id, %meta_ref, "placeholder published");
            (planned, meta_ref, BTreeMap::new())
        }
    };

    let already: u64 = done
        .keys()
        .map(|&i| plain_len(size, opts.chunk_size, i))
        .sum();
    let pending: Vec<u64> = (0..count).filter(|i| !done.contains_key(i)).collect();
    let mut chunks = if done.is_empty() {
        ChunkSource::Sequential(split(source, opts.chunk_size)?)
    } else {
        ChunkSource::Pending {
            path: source.to_path_buf(),
            chunk_size: opts.chunk_size,
            indices: pending.into_iter(),
        }
    };

    let ctx = Arc::new(UploadContext {
        store: Arc::clone(store),
        channel,
        meta_ref,
        file_id: meta.id.clone(),
        file_name: name.clone(),
        file_size: size,
        total_chunks,
        codec: ChunkCodec {
            compress,
            password,
            kdf: opts.kdf,
        },
        retry: opts.retry,
        cancel: cancel.clone(),
        progress: transfer.progress.clone(),
        source: source.to_path_buf(),
        journal: journal.cloned(),
        acc: Mutex::new(UploadAccumulator {
            completed: done.len() as u64,
            chunks: done,
            transferred: already,
        }),
    });

    // A permit is taken before each chunk is read, so at most
    // `parallel_uploads` chunks are in memory at once.
    let semaphore = Arc::new(Semaphore::new(opts.parallel_uploads.max(1)));
    let mut workers = JoinSet::new();
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VaultError::Cancelled),
            permit = Arc::clone(&semaphore).acquire_owned() => permit
                .map_err(|e| VaultError::Other(anyhow::anyhow!("worker pool closed: {e}")))?,
        };
        while let Some(res) = workers.try_join_next() {
            res.map_err(join_error)??;
        }

        let (rest, next) = blocking(move || {
            let mut source = chunks;
            let next = source.next().transpose()?;
            Ok((source, next))
        })
        .await?;
        chunks = rest;
        let Some(chunk) = next else {
            break;
        };

        let ctx = Arc::clone(&ctx);
        workers.spawn(async move {
            let _permit = permit;
            upload_chunk(ctx, chunk).await
        });
    }
    while let Some(res) = workers.join_next().await {
        res.map_err(join_error)??;
    }

    if count == 0 {
        if let Some(progress) = &transfer.progress {
            progress(&TransferUpdate {
                operation: TransferOperation::Upload,
                file_name: name.clone(),
                total_size: 0,
                transferred_size: 0,
                total_chunks,
                completed_chunks: total_chunks,
                current_chunk: 0,
            });
        }
    }

    let mut meta = meta;
    meta.chunks = std::mem::take(&mut lock(&ctx.acc).chunks)
        .into_values()
        .collect();
    if meta.compressed && meta.size > 0 {
        meta.compression_ratio = Some(meta.total_stored_size() as f64 / meta.size as f64);
    }
    meta.modified_at = Some(unix_now());
    if !meta.is_complete() {
        return Err(VaultError::IncompleteFile(meta.name.clone()));
    }

    let text = meta.to_json()?;
    opts.retry
        .run("finalize metadata", cancel, || {
            store.edit_text(channel, meta_ref, &text)
        })
        .await?;

    info!(
        file_id = %meta.id,
        name = %meta.name,
        bytes = meta.size,
        stored = meta.total_stored_size(),
        chunks = meta.chunk_count(),
        compressed = meta.compressed,
        encrypted = meta.encrypted,
        "upload complete"
    );
    Ok(meta)
}

/// Download the file described by `meta` to `output`.
///
/// On any failure except cancellation the partial output is removed.
pub async fn download_file<S: RemoteStore>(
    store: &Arc<S>,
    channel: ChannelId,
    meta: &FileMetadata,
    output: &Path,
    opts: &EngineOptions,
    transfer: &TransferOptions,
) -> VaultResult<PathBuf> {
    if meta.encrypted && transfer.password.is_none() {
        return Err(VaultError::MissingPassword);
    }
    if !meta.is_complete() {
        return Err(VaultError::IncompleteFile(meta.name.clone()));
    }
    check_chunk_size(meta.chunk_size)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    match fetch_into(store, channel, meta, output, opts, transfer).await {
        Ok(path) => {
            info!(file_id = %meta.id, path = %path.display(), bytes = meta.size, "download complete");
            Ok(path)
        }
        Err(VaultError::Cancelled) => Err(VaultError::Cancelled),
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(output).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %output.display(), "failed to remove partial output: {rm}");
                }
            }
            Err(e)
        }
    }
}

async fn fetch_into<S: RemoteStore>(
    store: &Arc<S>,
    channel: ChannelId,
    meta: &FileMetadata,
    output: &Path,
    opts: &EngineOptions,
    transfer: &TransferOptions,
) -> VaultResult<PathBuf> {
    let cancel = &transfer.cancel;
    let codec = ChunkCodec {
        compress: meta.compressed,
        password: if meta.encrypted {
            transfer.password.clone()
        } else {
            None
        },
        // Records carry the cost they were written with
        kdf: meta.kdf.map(KdfParams::from).unwrap_or(opts.kdf),
    };

    let path = output.to_path_buf();
    let (size, chunk_size) = (meta.size, meta.chunk_size);
    let mut writer = blocking(move || ChunkWriter::create(&path, size, chunk_size)).await?;

    let mut ordered: Vec<&ChunkInfo> = meta.chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);
    let total_chunks = meta.expected_chunk_count().max(1);
    let mut transferred = 0u64;

    for (n, info) in ordered.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        let index = info.index;
        let stored = opts
            .retry
            .run("get chunk", cancel, || store.get_blob(channel, info.remote_ref))
            .await?;

        // Never hand corrupted bytes to the decoder
        if digest_hex(&stored) != info.hash {
            warn!(file_id = %meta.id, index, "stored chunk digest mismatch");
            return Err(VaultError::ChunkCorruption { index });
        }

        let codec = codec.clone();
        let (w, written) = blocking(move || {
            let plain = codec.decode(&stored, chunk_size)?;
            let mut writer = writer;
            writer.write_chunk(index, &plain)?;
            Ok((writer, plain.len() as u64))
        })
        .await?;
        writer = w;
        transferred += written;

        if let Some(progress) = &transfer.progress {
            progress(&TransferUpdate {
                operation: TransferOperation::Download,
                file_name: meta.name.clone(),
                total_size: meta.size,
                transferred_size: transferred,
                total_chunks,
                completed_chunks: n as u64 + 1,
                current_chunk: index,
            });
        }
    }

    let path = blocking(move || writer.finish()).await?;

    if meta.chunks.is_empty() {
        if let Some(progress) = &transfer.progress {
            progress(&TransferUpdate {
                operation: TransferOperation::Download,
                file_name: meta.name.clone(),
                total_size: 0,
                transferred_size: 0,
                total_chunks,
                completed_chunks: total_chunks,
                current_chunk: 0,
            });
        }
    }

    let check = path.clone();
    let actual = blocking(move || hash_file(&check).map(|h| hash_to_hex(&h))).await?;
    if actual != meta.hash {
        return Err(VaultError::FileCorruption {
            name: meta.name.clone(),
            expected: meta.hash.clone(),
            actual,
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: KdfParams = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };

    fn codec(compress: bool, password: Option<&str>) -> ChunkCodec {
        ChunkCodec {
            compress,
            password: password.map(|p| Arc::new(SecretString::from(p))),
            kdf: FAST,
        }
    }

    #[test]
    fn file_ids_are_short_hex_and_unique() {
        let a = generate_file_id("report.pdf", 1024);
        let b = generate_file_id("report.pdf", 1024);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn plain_len_covers_tail() {
        assert_eq!(plain_len(250, 100, 0), 100);
        assert_eq!(plain_len(250, 100, 2), 50);
        assert_eq!(plain_len(250, 100, 3), 0);
    }

    #[test]
    fn codec_roundtrips_every_stage_combination() {
        let data = b"the quick brown fox ".repeat(50);
        for (compress, password) in [(false, None), (true, None), (false, Some("pw")), (true, Some("pw"))] {
            let c = codec(compress, password);
            let stored = c.encode(data.clone()).unwrap();
            assert_eq!(c.decode(&stored, data.len() as u64).unwrap(), data);
        }
    }

    #[test]
    fn encoded_chunk_fits_the_stored_bound() {
        // Incompressible input is the worst case for zstd
        let data: Vec<u8> = (0u32..4096)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        for (compress, password) in [(true, Some("pw")), (true, None), (false, Some("pw"))] {
            let stored = codec(compress, password).encode(data.clone()).unwrap();
            let bound = max_stored_size(data.len() as u64, compress, password.is_some());
            assert!(stored.len() as u64 <= bound, "{} > {bound}", stored.len());
        }
        assert_eq!(max_stored_size(100, false, true), 144);
        assert_eq!(max_stored_size(100, false, false), 100);
    }

    #[test]
    fn wrong_password_is_decryption_failure() {
        let stored = codec(true, Some("right")).encode(b"secret".to_vec()).unwrap();
        let err = codec(true, Some("wrong")).decode(&stored, 1024).unwrap_err();
        assert!(matches!(err, VaultError::DecryptionFailure));
    }

    #[test]
    fn decode_enforces_size_limit() {
        let stored = codec(true, None).encode(vec![0u8; 4096]).unwrap();
        assert!(codec(true, None).decode(&stored, 1024).is_err());
    }

    #[test]
    fn options_follow_config() {
        let mut cfg = VaultConfig::default();
        cfg.vault.chunk_size = 4096;
        cfg.transfer.parallel_uploads = 7;
        cfg.crypto.argon2_time_cost = 2;
        let opts = EngineOptions::from_config(&cfg);
        assert_eq!(opts.chunk_size, 4096);
        assert_eq!(opts.parallel_uploads, 7);
        assert_eq!(opts.kdf.time_cost, 2);
        assert_eq!(opts.retry.max_retries, cfg.transfer.max_retries);
    }
}
