//! Vault index: the single pinned record mapping file ids to metadata refs.
//!
//! Discovery scans the most recent pinned messages and takes the first whose
//! text parses as a [`VaultIndex`]. Saving edits that record in place, or
//! sends and pins a new one on first use.
//!
//! The store offers no compare-and-swap, so this is a plain read-modify-write:
//! two sessions saving concurrently race and the last writer wins. A vault
//! is meant to have a single writer at a time.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tvault_core::{ChannelId, MessageRef, VaultError, VaultIndex, VaultResult};
use tvault_store::{MessageFilter, RemoteStore};

use crate::retry::RetryPolicy;

/// How many recent pinned messages are searched for the index.
pub const INDEX_SCAN_WINDOW: usize = 10;

/// A loaded index plus the message it lives in, if it has been saved before.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub index: VaultIndex,
    pub msg_ref: Option<MessageRef>,
}

/// Find and parse the vault index. An empty index is returned when none of
/// the scanned pinned messages holds one (first use).
pub async fn load_index<S: RemoteStore>(
    store: &S,
    channel: ChannelId,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> VaultResult<IndexRecord> {
    let filter = MessageFilter::pinned(INDEX_SCAN_WINDOW);
    let pinned = retry
        .run("list pinned", cancel, || store.list_messages(channel, &filter))
        .await?;

    for msg in pinned {
        let Some(text) = msg.text.as_deref() else {
            continue;
        };
        match VaultIndex::from_json(text) {
            Ok(index) => {
                debug!(msg_ref = %msg.msg_ref, files = index.len(), "loaded vault index");
                return Ok(IndexRecord {
                    index,
                    msg_ref: Some(msg.msg_ref),
                });
            }
            // A newer index must not be silently replaced by an empty one
            Err(e @ VaultError::UnsupportedSchema { .. }) => return Err(e),
            Err(_) => continue,
        }
    }

    debug!(channel_id = channel, "no vault index found, starting empty");
    Ok(IndexRecord {
        index: VaultIndex::default(),
        msg_ref: None,
    })
}

/// Persist `record`, editing the existing pointer message or creating and
/// pinning a new one.
pub async fn save_index<S: RemoteStore>(
    store: &S,
    channel: ChannelId,
    record: &mut IndexRecord,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> VaultResult<MessageRef> {
    let text = record.index.to_json()?;
    match record.msg_ref {
        Some(msg_ref) => {
            retry
                .run("edit index", cancel, || store.edit_text(channel, msg_ref, &text))
                .await?;
            Ok(msg_ref)
        }
        None => {
            let msg_ref = retry
                .run("send index", cancel, || store.send_text(channel, &text))
                .await?;
            retry
                .run("pin index", cancel, || store.pin(channel, msg_ref))
                .await?;
            info!(%msg_ref, "created vault index");
            record.msg_ref = Some(msg_ref);
            Ok(msg_ref)
        }
    }
}
