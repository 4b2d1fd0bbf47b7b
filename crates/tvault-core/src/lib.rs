pub mod config;
pub mod error;
pub mod types;

pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use types::{
    ChannelId, ChunkInfo, FileMetadata, KdfSettings, MessageRef, TransferOperation,
    TransferProgress, VaultIndex,
};
