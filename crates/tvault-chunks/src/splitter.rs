//! Fixed-size chunking: lazy file splitting, random-access chunk reads and
//! an incremental buffer for writes that arrive in arbitrary pieces.
//!
//! Chunk `i` always covers bytes `[i * chunk_size, (i + 1) * chunk_size)` of
//! the source, so any chunk can be re-read later without replaying the ones
//! before it.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tvault_core::config::MAX_CHUNK_SIZE;
use tvault_core::{VaultError, VaultResult};

use crate::blake3::digest_hex;

/// One contiguous plaintext range of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub data: Vec<u8>,
    /// BLAKE3 hex digest of `data`
    pub hash: String,
    pub size: u64,
}

impl Chunk {
    pub fn new(index: u64, data: Vec<u8>) -> Self {
        let hash = digest_hex(&data);
        let size = data.len() as u64;
        Self {
            index,
            data,
            hash,
            size,
        }
    }

    /// Blob filename used when this chunk is sent to the remote store.
    pub fn filename(&self, file_id: &str) -> String {
        chunk_filename(file_id, self.index)
    }
}

pub fn chunk_filename(file_id: &str, index: u64) -> String {
    format!("{file_id}_{index:04}.chunk")
}

/// Reject chunk sizes the transport cannot carry.
pub fn check_chunk_size(chunk_size: u64) -> VaultResult<()> {
    if chunk_size == 0 {
        return Err(VaultError::InvalidConfiguration(
            "chunk size must be greater than zero".into(),
        ));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(VaultError::InvalidConfiguration(format!(
            "chunk size {chunk_size} exceeds transport maximum {MAX_CHUNK_SIZE}"
        )));
    }
    Ok(())
}

/// Number of chunks a file of `file_size` bytes splits into.
///
/// An empty file yields zero chunks. Callers that need a nominal unit of
/// progress for empty files account for it themselves.
pub fn count_chunks(file_size: u64, chunk_size: u64) -> u64 {
    if file_size == 0 || chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// Lazy chunk iterator over any reader. Holds at most one chunk in memory.
///
/// Not restartable: once exhausted (or after an error) it yields `None`.
pub struct Splitter<R> {
    reader: R,
    chunk_size: usize,
    next_index: u64,
    done: bool,
}

impl<R: Read> Splitter<R> {
    pub fn new(reader: R, chunk_size: u64) -> VaultResult<Self> {
        check_chunk_size(chunk_size)?;
        let chunk_size = usize::try_from(chunk_size).map_err(|_| {
            VaultError::InvalidConfiguration(format!(
                "chunk size {chunk_size} does not fit in memory on this platform"
            ))
        })?;
        Ok(Self {
            reader,
            chunk_size,
            next_index: 0,
            done: false,
        })
    }
}

impl<R: Read> Iterator for Splitter<R> {
    type Item = VaultResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = Vec::new();
        let limit = self.chunk_size as u64;
        if let Err(e) = self.reader.by_ref().take(limit).read_to_end(&mut buf) {
            self.done = true;
            return Some(Err(e.into()));
        }
        if buf.is_empty() {
            self.done = true;
            return None;
        }
        if buf.len() < self.chunk_size {
            self.done = true;
        }
        let chunk = Chunk::new(self.next_index, buf);
        self.next_index += 1;
        Some(Ok(chunk))
    }
}

/// Open `path` and split it lazily into `chunk_size` pieces.
pub fn split(path: &Path, chunk_size: u64) -> VaultResult<Splitter<BufReader<File>>> {
    let file = File::open(path)?;
    Splitter::new(BufReader::new(file), chunk_size)
}

/// Read chunk `index` directly by seeking to `index * chunk_size`.
pub fn read_chunk(path: &Path, index: u64, chunk_size: u64) -> VaultResult<Chunk> {
    check_chunk_size(chunk_size)?;
    let offset = index
        .checked_mul(chunk_size)
        .ok_or(VaultError::ChunkOutOfRange { index })?;

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut data = Vec::new();
    file.take(chunk_size).read_to_end(&mut data)?;
    if data.is_empty() {
        return Err(VaultError::ChunkOutOfRange { index });
    }
    Ok(Chunk::new(index, data))
}

/// Accumulates arbitrary writes and cuts them into full chunks.
#[derive(Debug)]
pub struct ChunkBuffer {
    chunk_size: usize,
    buffer: Vec<u8>,
    next_index: u64,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> VaultResult<Self> {
        check_chunk_size(chunk_size as u64)?;
        Ok(Self {
            chunk_size,
            buffer: Vec::new(),
            next_index: 0,
        })
    }

    /// Append data, returning every chunk that became full.
    pub fn write(&mut self, data: &[u8]) -> Vec<Chunk> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buffer.len() >= self.chunk_size {
            let rest = self.buffer.split_off(self.chunk_size);
            let full = std::mem::replace(&mut self.buffer, rest);
            out.push(Chunk::new(self.next_index, full));
            self.next_index += 1;
        }
        out
    }

    /// Emit the trailing partial chunk, if any bytes are buffered.
    pub fn flush(&mut self) -> Option<Chunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        let chunk = Chunk::new(self.next_index, tail);
        self.next_index += 1;
        Some(chunk)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
