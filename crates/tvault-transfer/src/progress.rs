//! Progress reporting for uploads and downloads

use std::sync::Arc;

use tvault_core::TransferOperation;

/// Snapshot delivered to a [`ProgressFn`] after each chunk lands.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUpdate {
    pub operation: TransferOperation,
    pub file_name: String,
    pub total_size: u64,
    /// Plaintext bytes accounted for so far
    pub transferred_size: u64,
    pub total_chunks: u64,
    pub completed_chunks: u64,
    /// Index of the chunk that triggered this update
    pub current_chunk: u64,
}

impl TransferUpdate {
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.completed_chunks as f64 / self.total_chunks as f64 * 100.0
    }

    pub fn is_done(&self) -> bool {
        self.completed_chunks >= self.total_chunks
    }
}

/// Progress callback. Invoked from worker tasks, never concurrently with
/// itself for the same transfer, with monotonically increasing counts.
pub type ProgressFn = Arc<dyn Fn(&TransferUpdate) + Send + Sync>;
