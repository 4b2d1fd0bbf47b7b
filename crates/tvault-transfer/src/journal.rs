//! Local journal of in-flight uploads, persisted as JSON.
//!
//! Loaded entirely into memory and flushed atomically via temp + rename after
//! every change, so a crash leaves either the previous or the new state on
//! disk. Each entry remembers the published placeholder record and every
//! chunk that already landed; re-running the same upload resumes from there.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tvault_core::{ChunkInfo, FileMetadata, TransferProgress, VaultResult};

/// Journal state for one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub progress: TransferProgress,
    /// Placeholder metadata as published, with its `remote_ref` set
    pub metadata: FileMetadata,
    /// Chunks already stored remotely, by index
    pub chunks: BTreeMap<u64, ChunkInfo>,
}

impl JournalEntry {
    pub fn new(progress: TransferProgress, metadata: FileMetadata) -> Self {
        Self {
            progress,
            metadata,
            chunks: BTreeMap::new(),
        }
    }

    /// Whether this entry belongs to an upload of the same content with the
    /// same layout and codec choices.
    pub fn matches(&self, planned: &FileMetadata) -> bool {
        let m = &self.metadata;
        m.remote_ref.is_some()
            && m.size == planned.size
            && m.hash == planned.hash
            && m.chunk_size == planned.chunk_size
            && m.compressed == planned.compressed
            && m.encrypted == planned.encrypted
            && m.kdf == planned.kdf
    }
}

/// Journal handle shared between the vault and upload workers.
pub type SharedJournal = Arc<Mutex<TransferJournal>>;

/// Lock a std mutex, recovering the data if a worker panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TransferJournal {
    /// Path to the JSON journal on disk
    path: PathBuf,
    /// canonicalized source path → entry
    entries: HashMap<String, JournalEntry>,
    dirty: bool,
}

impl TransferJournal {
    /// Load or create a journal at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> VaultResult<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    pub fn shared(self) -> SharedJournal {
        Arc::new(Mutex::new(self))
    }

    pub fn get(&self, source: &Path) -> Option<&JournalEntry> {
        self.entries.get(&path_key(source))
    }

    /// Start (or restart) tracking an upload and persist immediately.
    pub fn begin(&mut self, source: &Path, entry: JournalEntry) -> VaultResult<()> {
        self.entries.insert(path_key(source), entry);
        self.dirty = true;
        self.flush()
    }

    /// Record a landed chunk of upload `file_id` and persist. Chunks of an
    /// upload that no longer owns the entry are ignored.
    pub fn record_chunk(
        &mut self,
        source: &Path,
        file_id: &str,
        chunk: &ChunkInfo,
    ) -> VaultResult<()> {
        let Some(entry) = self
            .entries
            .get_mut(&path_key(source))
            .filter(|e| e.metadata.id == file_id)
        else {
            return Ok(());
        };
        entry.progress.mark_complete(chunk.index);
        entry.chunks.insert(chunk.index, chunk.clone());
        self.dirty = true;
        self.flush()
    }

    /// Forget an upload once it is published in the index.
    pub fn finish(&mut self, source: &Path) -> VaultResult<()> {
        if self.entries.remove(&path_key(source)).is_some() {
            self.dirty = true;
        }
        self.flush()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flush dirty changes to disk using an atomic write (write then rename).
    pub fn flush(&mut self) -> VaultResult<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.entries)?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;

        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.entries.len(), "journal flushed");
        Ok(())
    }
}

impl Drop for TransferJournal {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                warn!("failed to flush transfer journal on drop: {e}");
            }
        }
    }
}

fn path_key(path: &Path) -> String {
    // Use the canonicalized absolute path as the key
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvault_core::{MessageRef, TransferOperation};

    fn entry_for(meta_ref: i64) -> JournalEntry {
        let mut meta = FileMetadata::placeholder("abc123abc123", "a.bin", 250, "h", 100);
        meta.remote_ref = Some(MessageRef(meta_ref));
        let progress = TransferProgress::new(TransferOperation::Upload, "abc123abc123", "a.bin", 3);
        JournalEntry::new(progress, meta)
    }

    fn chunk(index: u64) -> ChunkInfo {
        ChunkInfo {
            index,
            remote_ref: MessageRef(100 + index as i64),
            size: 10,
            hash: format!("h{index}"),
        }
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let journal_path = tmp.path().join("state/journal.json");
        let source = tmp.path().join("a.bin");
        std::fs::write(&source, b"x").unwrap();

        {
            let mut journal = TransferJournal::open(&journal_path).unwrap();
            journal.begin(&source, entry_for(7)).unwrap();
            journal.record_chunk(&source, "abc123abc123", &chunk(0)).unwrap();
            journal.record_chunk(&source, "abc123abc123", &chunk(2)).unwrap();
        }

        let journal = TransferJournal::open(&journal_path).unwrap();
        let entry = journal.get(&source).unwrap();
        assert_eq!(entry.metadata.remote_ref, Some(MessageRef(7)));
        assert_eq!(entry.progress.pending_chunks(), vec![1]);
        assert_eq!(entry.chunks.len(), 2);
    }

    #[test]
    fn finish_removes_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.bin");
        std::fs::write(&source, b"x").unwrap();
        let mut journal = TransferJournal::open(&tmp.path().join("j.json")).unwrap();

        journal.begin(&source, entry_for(1)).unwrap();
        assert_eq!(journal.len(), 1);
        journal.finish(&source).unwrap();
        assert!(journal.is_empty());
        assert!(journal.get(&source).is_none());
    }

    #[test]
    fn record_for_unknown_source_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut journal = TransferJournal::open(&tmp.path().join("j.json")).unwrap();
        journal
            .record_chunk(&tmp.path().join("nope"), "abc123abc123", &chunk(0))
            .unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn chunk_from_a_replaced_upload_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.bin");
        std::fs::write(&source, b"x").unwrap();
        let mut journal = TransferJournal::open(&tmp.path().join("j.json")).unwrap();
        journal.begin(&source, entry_for(1)).unwrap();

        journal.record_chunk(&source, "stale0000000", &chunk(0)).unwrap();
        assert!(journal.get(&source).unwrap().chunks.is_empty());

        journal.record_chunk(&source, "abc123abc123", &chunk(0)).unwrap();
        assert_eq!(journal.get(&source).unwrap().chunks.len(), 1);
    }

    #[test]
    fn matches_requires_same_content_and_layout() {
        let entry = entry_for(1);
        let mut planned = entry.metadata.clone();
        planned.remote_ref = None;
        assert!(entry.matches(&planned));

        planned.hash = "different".into();
        assert!(!entry.matches(&planned));

        let mut planned = entry.metadata.clone();
        planned.compressed = !planned.compressed;
        assert!(!entry.matches(&planned));
    }
}
