//! Persisted data model: file metadata records, the vault index, and
//! resumable transfer progress. All records are compact JSON stored as text
//! messages in the vault channel.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{VaultError, VaultResult};

/// Newest `FileMetadata` schema this build reads and writes.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Newest `VaultIndex` schema this build reads and writes.
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// Identifier of the storage channel on the remote store.
pub type ChannelId = i64;

/// Opaque handle the remote store returns for a message or blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(pub i64);

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One stored chunk of a file.
///
/// `size` and `hash` describe the *stored* bytes (after compression and
/// encryption), not the plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkInfo {
    pub index: u64,
    pub remote_ref: MessageRef,
    pub size: u64,
    pub hash: String,
}

/// Argon2id cost parameters recorded alongside encrypted files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KdfSettings {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

/// Metadata for a file stored in the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMetadata {
    pub version: u32,
    /// Short unique identifier
    pub id: String,
    pub name: String,
    /// Original plaintext size
    pub size: u64,
    /// Digest of the whole original plaintext
    pub hash: String,
    /// Plaintext bytes per chunk (the last chunk may be shorter)
    pub chunk_size: u64,
    pub chunks: Vec<ChunkInfo>,
    pub encrypted: bool,
    pub compressed: bool,
    #[serde(default)]
    pub compression_ratio: Option<f64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub kdf: Option<KdfSettings>,
    pub created_at: f64,
    #[serde(default)]
    pub modified_at: Option<f64>,
    /// Reference to this record itself, known once published
    #[serde(default)]
    pub remote_ref: Option<MessageRef>,
}

impl FileMetadata {
    /// A placeholder record: identity known, no chunks yet.
    pub fn placeholder(
        id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        chunk_size: u64,
    ) -> Self {
        Self {
            version: METADATA_SCHEMA_VERSION,
            id: id.into(),
            name: name.into(),
            size,
            hash: hash.into(),
            chunk_size,
            chunks: Vec::new(),
            encrypted: false,
            compressed: false,
            compression_ratio: None,
            mime_type: None,
            kdf: None,
            created_at: unix_now(),
            modified_at: None,
            remote_ref: None,
        }
    }

    pub fn to_json(&self) -> VaultResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> VaultResult<Self> {
        let meta: FileMetadata = serde_json::from_str(text)?;
        if meta.version > METADATA_SCHEMA_VERSION {
            return Err(VaultError::UnsupportedSchema {
                record: "file metadata",
                version: meta.version,
            });
        }
        Ok(meta)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total stored bytes across all chunks (after compression/encryption).
    pub fn total_stored_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Number of chunks a complete record must list for its plaintext size.
    pub fn expected_chunk_count(&self) -> u64 {
        if self.size == 0 || self.chunk_size == 0 {
            0
        } else {
            self.size.div_ceil(self.chunk_size)
        }
    }

    /// True when the chunk indices are exactly `0..expected_chunk_count()`.
    pub fn is_complete(&self) -> bool {
        let expected = self.expected_chunk_count();
        if self.chunks.len() as u64 != expected {
            return false;
        }
        let indices: BTreeSet<u64> = self.chunks.iter().map(|c| c.index).collect();
        indices.len() as u64 == expected && indices.iter().copied().eq(0..expected)
    }
}

/// Master catalog of the vault: file id → metadata record reference.
///
/// This is the only structure that makes a file reachable. Updates are a
/// read-modify-write of a single pinned record with last-writer-wins
/// semantics; concurrent writers can lose each other's changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultIndex {
    pub version: u32,
    pub files: BTreeMap<String, MessageRef>,
    pub updated_at: f64,
}

impl Default for VaultIndex {
    fn default() -> Self {
        Self {
            version: INDEX_SCHEMA_VERSION,
            files: BTreeMap::new(),
            updated_at: unix_now(),
        }
    }
}

impl VaultIndex {
    pub fn to_json(&self) -> VaultResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> VaultResult<Self> {
        let index: VaultIndex = serde_json::from_str(text)?;
        if index.version > INDEX_SCHEMA_VERSION {
            return Err(VaultError::UnsupportedSchema {
                record: "vault index",
                version: index.version,
            });
        }
        Ok(index)
    }

    pub fn add_file(&mut self, file_id: impl Into<String>, metadata_ref: MessageRef) {
        self.files.insert(file_id.into(), metadata_ref);
        self.updated_at = unix_now();
    }

    pub fn remove_file(&mut self, file_id: &str) -> Option<MessageRef> {
        let removed = self.files.remove(file_id);
        if removed.is_some() {
            self.updated_at = unix_now();
        }
        removed
    }

    pub fn get(&self, file_id: &str) -> Option<MessageRef> {
        self.files.get(file_id).copied()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferOperation {
    Upload,
    Download,
}

/// Which chunk indices of a long transfer have already landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub operation: TransferOperation,
    pub file_id: String,
    pub file_name: String,
    pub total_chunks: u64,
    pub completed_chunks: BTreeSet<u64>,
    pub started_at: f64,
}

impl TransferProgress {
    pub fn new(
        operation: TransferOperation,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        total_chunks: u64,
    ) -> Self {
        Self {
            operation,
            file_id: file_id.into(),
            file_name: file_name.into(),
            total_chunks,
            completed_chunks: BTreeSet::new(),
            started_at: unix_now(),
        }
    }

    pub fn mark_complete(&mut self, index: u64) {
        self.completed_chunks.insert(index);
    }

    pub fn pending_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|i| !self.completed_chunks.contains(i))
            .collect()
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.completed_chunks.len() as f64 / self.total_chunks as f64 * 100.0
    }
}
