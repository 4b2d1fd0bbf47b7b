//! Reassembly of chunks into a destination file, in any arrival order.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use tvault_core::{VaultError, VaultResult};

use crate::splitter::check_chunk_size;

/// Writes chunks at `index * chunk_size` into a file pre-sized to the
/// declared total. Repeated writes of an index are no-ops.
#[derive(Debug)]
pub struct ChunkWriter {
    path: PathBuf,
    file: File,
    total_size: u64,
    chunk_size: u64,
    written: BTreeSet<u64>,
}

impl ChunkWriter {
    /// Create (or truncate) `path` and extend it sparsely to `total_size`.
    pub fn create(path: &Path, total_size: u64, chunk_size: u64) -> VaultResult<Self> {
        check_chunk_size(chunk_size)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;
        debug!(path = %path.display(), total_size, chunk_size, "allocated output file");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            total_size,
            chunk_size,
            written: BTreeSet::new(),
        })
    }

    /// Write `data` as chunk `index`. Returns `false` if the index was
    /// already written.
    pub fn write_chunk(&mut self, index: u64, data: &[u8]) -> VaultResult<bool> {
        if self.written.contains(&index) {
            return Ok(false);
        }
        let offset = index
            .checked_mul(self.chunk_size)
            .ok_or(VaultError::ChunkOutOfRange { index })?;
        let end = offset.saturating_add(data.len() as u64);
        if data.len() as u64 > self.chunk_size || end > self.total_size {
            return Err(VaultError::ChunkOutOfRange { index });
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.written.insert(index);
        Ok(true)
    }

    pub fn is_written(&self, index: u64) -> bool {
        self.written.contains(&index)
    }

    pub fn written_count(&self) -> usize {
        self.written.len()
    }

    pub fn is_complete(&self, expected_count: u64) -> bool {
        (0..expected_count).all(|i| self.written.contains(&i))
    }

    /// Indices in `0..expected_count` that have not been written yet.
    pub fn missing_chunks(&self, expected_count: u64) -> Vec<u64> {
        (0..expected_count)
            .filter(|i| !self.written.contains(i))
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush file contents to disk and return the output path.
    pub fn finish(self) -> VaultResult<PathBuf> {
        self.file.sync_all()?;
        Ok(self.path)
    }
}
