//! tvault-transfer: upload/download orchestration, vault index, retry, and resume journal

pub mod engine;
pub mod index;
pub mod journal;
pub mod progress;
pub mod retry;
pub mod vault;

pub use engine::{generate_file_id, EngineOptions, TransferOptions};
pub use index::{load_index, save_index, IndexRecord, INDEX_SCAN_WINDOW};
pub use journal::{JournalEntry, SharedJournal, TransferJournal};
pub use progress::{ProgressFn, TransferUpdate};
pub use retry::RetryPolicy;
pub use vault::{Vault, VaultStatus};
