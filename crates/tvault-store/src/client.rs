//! The remote store contract the transfer engine is written against.
//!
//! A store is a set of channels; each channel is an append-only sequence of
//! messages addressed by [`MessageRef`]. A message carries either editable
//! text or an immutable blob, may reply to another message, and may be
//! pinned. That is all the engine needs to build a vault on top.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tvault_core::{ChannelId, MessageRef, VaultResult};

/// A message as seen by [`RemoteStore::list_messages`] and
/// [`RemoteStore::get_message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_ref: MessageRef,
    pub text: Option<String>,
    pub is_blob: bool,
    /// Filename of the blob, if this message carries one
    pub filename: Option<String>,
    pub pinned: bool,
    pub reply_to: Option<MessageRef>,
}

/// Narrows [`RemoteStore::list_messages`]. The default matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub pinned_only: bool,
    pub reply_to: Option<MessageRef>,
    /// Stop after this many matches (most recent first)
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn pinned(limit: usize) -> Self {
        Self {
            pinned_only: true,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn replies_to(parent: MessageRef) -> Self {
        Self {
            reply_to: Some(parent),
            ..Self::default()
        }
    }

    pub fn matches(&self, msg: &Message) -> bool {
        if self.pinned_only && !msg.pinned {
            return false;
        }
        match self.reply_to {
            Some(parent) => msg.reply_to == Some(parent),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub title: String,
}

/// Message-oriented blob store.
///
/// Every call may fail with `VaultError::RateLimited { wait }`; callers
/// retry after at least `wait`. All other errors are final.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn connect(&self) -> VaultResult<()>;

    async fn disconnect(&self) -> VaultResult<()>;

    /// Whether a login session exists.
    async fn is_authorized(&self) -> VaultResult<bool>;

    /// Establish a session for `phone`, returning the session string.
    async fn login(&self, phone: &str) -> VaultResult<String>;

    async fn create_channel(&self, title: &str) -> VaultResult<ChannelInfo>;

    /// Look up an existing channel; `RecordNotFound` if it does not exist.
    async fn open_channel(&self, channel: ChannelId) -> VaultResult<ChannelInfo>;

    async fn send_text(&self, channel: ChannelId, text: &str) -> VaultResult<MessageRef>;

    async fn edit_text(&self, channel: ChannelId, msg: MessageRef, text: &str) -> VaultResult<()>;

    async fn send_blob(
        &self,
        channel: ChannelId,
        data: Bytes,
        filename: &str,
        reply_to: Option<MessageRef>,
    ) -> VaultResult<MessageRef>;

    async fn get_blob(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Bytes>;

    async fn get_message(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Message>;

    /// Messages matching `filter`, most recent first.
    async fn list_messages(
        &self,
        channel: ChannelId,
        filter: &MessageFilter,
    ) -> VaultResult<Vec<Message>>;

    async fn pin(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<()>;

    /// Delete messages. Refs that no longer exist are ignored.
    async fn delete(&self, channel: ChannelId, msgs: &[MessageRef]) -> VaultResult<()>;

    /// Largest blob `send_blob` accepts, in bytes.
    fn max_blob_size(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(r: i64, pinned: bool, reply_to: Option<i64>) -> Message {
        Message {
            msg_ref: MessageRef(r),
            text: None,
            is_blob: false,
            filename: None,
            pinned,
            reply_to: reply_to.map(MessageRef),
        }
    }

    #[test]
    fn default_filter_matches_all() {
        let f = MessageFilter::default();
        assert!(f.matches(&msg(1, false, None)));
        assert!(f.matches(&msg(2, true, Some(1))));
    }

    #[test]
    fn pinned_and_reply_filters() {
        assert!(!MessageFilter::pinned(10).matches(&msg(1, false, None)));
        assert!(MessageFilter::pinned(10).matches(&msg(1, true, None)));

        let replies = MessageFilter::replies_to(MessageRef(5));
        assert!(replies.matches(&msg(6, false, Some(5))));
        assert!(!replies.matches(&msg(7, false, Some(4))));
        assert!(!replies.matches(&msg(8, false, None)));
    }
}
