//! OpenDAL Operator factory for tvault store backends

use std::path::PathBuf;

use opendal::Operator;
use tvault_core::config::StoreConfig;
use tvault_core::{VaultError, VaultResult};

use crate::opendal_store::OpendalStore;

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Build an OpenDAL Operator for the configured backend.
///
/// `fs` keeps the store under `root` on local disk; `memory` is process-local
/// and vanishes on exit (tests and dry runs).
pub fn build_operator(cfg: &StoreConfig) -> VaultResult<Operator> {
    let op = match cfg.backend.as_str() {
        "fs" => {
            let root = expand_home(&cfg.root);
            let root = root.to_str().ok_or_else(|| {
                VaultError::InvalidConfiguration(format!(
                    "store.root is not valid UTF-8: {}",
                    root.display()
                ))
            })?;
            // opendal 0.55: builders use the consuming pattern
            let builder = opendal::services::Fs::default().root(root);
            Operator::new(builder)
                .map_err(|e| VaultError::Storage(format!("creating fs operator: {e}")))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        "memory" => Operator::new(opendal::services::Memory::default())
            .map_err(|e| VaultError::Storage(format!("creating memory operator: {e}")))?
            .layer(opendal::layers::LoggingLayer::default())
            .finish(),
        other => {
            return Err(VaultError::InvalidConfiguration(format!(
                "unknown store.backend '{other}' (expected 'fs' or 'memory')"
            )))
        }
    };
    Ok(op)
}

/// Build the store client for the configured backend.
pub fn build_store(cfg: &StoreConfig) -> VaultResult<OpendalStore> {
    Ok(OpendalStore::new(build_operator(cfg)?, cfg.max_blob_size))
}
