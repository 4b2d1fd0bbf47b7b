//! [`RemoteStore`] over an OpenDAL operator.
//!
//! Object layout:
//! ```text
//! session.json                             login session
//! channels/{id}/channel.json               channel descriptor
//! channels/{id}/messages/{ref:020}.json    message envelope
//! channels/{id}/blobs/{ref:020}            blob bytes
//! ```
//!
//! Refs are allocated from a per-channel counter seeded from the highest
//! envelope already present, so they increase monotonically across sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use tvault_core::types::unix_now;
use tvault_core::{ChannelId, MessageRef, VaultError, VaultResult};

use crate::client::{ChannelInfo, Message, MessageFilter, RemoteStore};

const SESSION_KEY: &str = "session.json";

#[derive(Debug, Serialize, Deserialize)]
struct Session {
    phone: String,
    token: String,
    created_at: f64,
}

/// On-disk form of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    msg_ref: MessageRef,
    text: Option<String>,
    filename: Option<String>,
    blob_size: Option<u64>,
    pinned: bool,
    reply_to: Option<MessageRef>,
    date: f64,
}

impl Envelope {
    fn to_message(&self) -> Message {
        Message {
            msg_ref: self.msg_ref,
            text: self.text.clone(),
            is_blob: self.blob_size.is_some(),
            filename: self.filename.clone(),
            pinned: self.pinned,
            reply_to: self.reply_to,
        }
    }
}

fn storage_err(context: &str, e: opendal::Error) -> VaultError {
    if e.kind() == ErrorKind::NotFound {
        VaultError::RecordNotFound(context.to_string())
    } else {
        VaultError::Storage(format!("{context}: {e}"))
    }
}

pub fn channel_prefix(channel: ChannelId) -> String {
    format!("channels/{channel}/")
}

pub fn message_path(channel: ChannelId, msg: MessageRef) -> String {
    format!("channels/{channel}/messages/{:020}.json", msg.0)
}

pub fn blob_path(channel: ChannelId, msg: MessageRef) -> String {
    format!("channels/{channel}/blobs/{:020}", msg.0)
}

fn parse_ref(entry_name: &str) -> Option<MessageRef> {
    entry_name
        .strip_suffix(".json")
        .and_then(|n| n.parse::<i64>().ok())
        .map(MessageRef)
}

pub struct OpendalStore {
    op: Operator,
    max_blob_size: u64,
    connected: AtomicBool,
    next_refs: Mutex<HashMap<ChannelId, i64>>,
}

impl OpendalStore {
    pub fn new(op: Operator, max_blob_size: u64) -> Self {
        Self {
            op,
            max_blob_size,
            connected: AtomicBool::new(false),
            next_refs: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying operator, for inspection and fault injection in tests.
    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn ensure_connected(&self) -> VaultResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(VaultError::NotConnected)
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> VaultResult<T> {
        let data = self.op.read(path).await.map_err(|e| storage_err(path, e))?;
        Ok(serde_json::from_slice(&data.to_bytes())?)
    }

    async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> VaultResult<()> {
        let json = serde_json::to_vec(value)?;
        self.op
            .write(path, json)
            .await
            .map_err(|e| storage_err(path, e))?;
        Ok(())
    }

    /// Refs of every envelope in the channel, ascending.
    async fn message_refs(&self, channel: ChannelId) -> VaultResult<Vec<MessageRef>> {
        let dir = format!("{}messages/", channel_prefix(channel));
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(&dir, e)),
        };
        let mut refs: Vec<MessageRef> = entries.iter().filter_map(|e| parse_ref(e.name())).collect();
        refs.sort();
        Ok(refs)
    }

    async fn allocate_ref(&self, channel: ChannelId) -> VaultResult<MessageRef> {
        let mut next = self.next_refs.lock().await;
        let slot = match next.get(&channel) {
            Some(&n) => n,
            None => {
                let last = self.message_refs(channel).await?.last().map_or(0, |r| r.0);
                last + 1
            }
        };
        next.insert(channel, slot + 1);
        Ok(MessageRef(slot))
    }

    async fn load_envelope(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Envelope> {
        self.read_json(&message_path(channel, msg)).await
    }

    async fn ensure_channel(&self, channel: ChannelId) -> VaultResult<()> {
        let path = format!("{}channel.json", channel_prefix(channel));
        let exists = self
            .op
            .exists(&path)
            .await
            .map_err(|e| storage_err(&path, e))?;
        if exists {
            Ok(())
        } else {
            Err(VaultError::RecordNotFound(format!("channel {channel}")))
        }
    }
}

#[async_trait]
impl RemoteStore for OpendalStore {
    async fn connect(&self) -> VaultResult<()> {
        // Listing the root is the lightest probe every backend supports
        self.op
            .list("/")
            .await
            .map_err(|e| VaultError::Storage(format!("store unreachable: {e}")))?;
        self.connected.store(true, Ordering::Release);
        debug!("store connected");
        Ok(())
    }

    async fn disconnect(&self) -> VaultResult<()> {
        self.connected.store(false, Ordering::Release);
        self.next_refs.lock().await.clear();
        Ok(())
    }

    async fn is_authorized(&self) -> VaultResult<bool> {
        self.ensure_connected()?;
        self.op
            .exists(SESSION_KEY)
            .await
            .map_err(|e| storage_err(SESSION_KEY, e))
    }

    async fn login(&self, phone: &str) -> VaultResult<String> {
        self.ensure_connected()?;
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let token: String = raw.iter().map(|b| format!("{b:02x}")).collect();

        let session = Session {
            phone: phone.to_string(),
            token: token.clone(),
            created_at: unix_now(),
        };
        self.write_json(SESSION_KEY, &session).await?;
        info!("logged in");
        Ok(token)
    }

    async fn create_channel(&self, title: &str) -> VaultResult<ChannelInfo> {
        self.ensure_connected()?;
        let entries = match self.op.list("channels/").await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(storage_err("channels/", e)),
        };
        let id = entries
            .iter()
            .filter_map(|e| e.name().trim_end_matches('/').parse::<ChannelId>().ok())
            .max()
            .unwrap_or(0)
            + 1;

        let info = ChannelInfo {
            id,
            title: title.to_string(),
        };
        self.write_json(&format!("{}channel.json", channel_prefix(id)), &info)
            .await?;
        info!(channel_id = id, title, "created channel");
        Ok(info)
    }

    async fn open_channel(&self, channel: ChannelId) -> VaultResult<ChannelInfo> {
        self.ensure_connected()?;
        self.read_json(&format!("{}channel.json", channel_prefix(channel)))
            .await
    }

    async fn send_text(&self, channel: ChannelId, text: &str) -> VaultResult<MessageRef> {
        self.ensure_connected()?;
        self.ensure_channel(channel).await?;
        let msg_ref = self.allocate_ref(channel).await?;
        let envelope = Envelope {
            msg_ref,
            text: Some(text.to_string()),
            filename: None,
            blob_size: None,
            pinned: false,
            reply_to: None,
            date: unix_now(),
        };
        self.write_json(&message_path(channel, msg_ref), &envelope)
            .await?;
        Ok(msg_ref)
    }

    async fn edit_text(&self, channel: ChannelId, msg: MessageRef, text: &str) -> VaultResult<()> {
        self.ensure_connected()?;
        let mut envelope = self.load_envelope(channel, msg).await?;
        if envelope.blob_size.is_some() {
            return Err(VaultError::Storage(format!(
                "message {msg} carries a blob and cannot be edited"
            )));
        }
        envelope.text = Some(text.to_string());
        self.write_json(&message_path(channel, msg), &envelope).await
    }

    async fn send_blob(
        &self,
        channel: ChannelId,
        data: Bytes,
        filename: &str,
        reply_to: Option<MessageRef>,
    ) -> VaultResult<MessageRef> {
        self.ensure_connected()?;
        let size = data.len() as u64;
        if size > self.max_blob_size {
            return Err(VaultError::InvalidConfiguration(format!(
                "blob {filename} is {size} bytes, store limit is {}",
                self.max_blob_size
            )));
        }
        self.ensure_channel(channel).await?;
        let msg_ref = self.allocate_ref(channel).await?;

        let path = blob_path(channel, msg_ref);
        self.op
            .write(&path, data)
            .await
            .map_err(|e| storage_err(&path, e))?;

        let envelope = Envelope {
            msg_ref,
            text: None,
            filename: Some(filename.to_string()),
            blob_size: Some(size),
            pinned: false,
            reply_to,
            date: unix_now(),
        };
        self.write_json(&message_path(channel, msg_ref), &envelope)
            .await?;
        debug!(channel_id = channel, %msg_ref, filename, bytes = size, "stored blob");
        Ok(msg_ref)
    }

    async fn get_blob(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Bytes> {
        self.ensure_connected()?;
        let path = blob_path(channel, msg);
        let data = self.op.read(&path).await.map_err(|e| storage_err(&path, e))?;
        Ok(data.to_bytes())
    }

    async fn get_message(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<Message> {
        self.ensure_connected()?;
        Ok(self.load_envelope(channel, msg).await?.to_message())
    }

    async fn list_messages(
        &self,
        channel: ChannelId,
        filter: &MessageFilter,
    ) -> VaultResult<Vec<Message>> {
        self.ensure_connected()?;
        let mut out = Vec::new();
        for msg_ref in self.message_refs(channel).await?.into_iter().rev() {
            if filter.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let envelope = match self.load_envelope(channel, msg_ref).await {
                Ok(envelope) => envelope,
                // Deleted between listing and reading
                Err(VaultError::RecordNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let message = envelope.to_message();
            if filter.matches(&message) {
                out.push(message);
            }
        }
        Ok(out)
    }

    async fn pin(&self, channel: ChannelId, msg: MessageRef) -> VaultResult<()> {
        self.ensure_connected()?;
        let mut envelope = self.load_envelope(channel, msg).await?;
        envelope.pinned = true;
        self.write_json(&message_path(channel, msg), &envelope).await
    }

    async fn delete(&self, channel: ChannelId, msgs: &[MessageRef]) -> VaultResult<()> {
        self.ensure_connected()?;
        for &msg in msgs {
            for path in [blob_path(channel, msg), message_path(channel, msg)] {
                // opendal treats deleting a missing object as success
                self.op
                    .delete(&path)
                    .await
                    .map_err(|e| storage_err(&path, e))?;
            }
        }
        debug!(channel_id = channel, count = msgs.len(), "deleted messages");
        Ok(())
    }

    fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store(max_blob: u64) -> OpendalStore {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        OpendalStore::new(op, max_blob)
    }

    async fn connected_with_channel() -> (OpendalStore, ChannelId) {
        let store = memory_store(1024);
        store.connect().await.unwrap();
        let channel = store.create_channel("vault").await.unwrap().id;
        (store, channel)
    }

    #[tokio::test]
    async fn calls_require_connect() {
        let store = memory_store(1024);
        let err = store.send_text(1, "hi").await.unwrap_err();
        assert!(matches!(err, VaultError::NotConnected));
    }

    #[tokio::test]
    async fn login_creates_session() {
        let store = memory_store(1024);
        store.connect().await.unwrap();
        assert!(!store.is_authorized().await.unwrap());
        let token = store.login("+15550100").await.unwrap();
        assert_eq!(token.len(), 32);
        assert!(store.is_authorized().await.unwrap());
    }

    #[tokio::test]
    async fn channels_get_increasing_ids() {
        let store = memory_store(1024);
        store.connect().await.unwrap();
        let a = store.create_channel("a").await.unwrap();
        let b = store.create_channel("b").await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.open_channel(a.id).await.unwrap().title, "a");
        assert!(matches!(
            store.open_channel(999).await,
            Err(VaultError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn text_send_edit_and_list_order() {
        let (store, ch) = connected_with_channel().await;
        let first = store.send_text(ch, "one").await.unwrap();
        let second = store.send_text(ch, "two").await.unwrap();
        assert!(second > first);

        store.edit_text(ch, first, "uno").await.unwrap();
        let listed = store
            .list_messages(ch, &MessageFilter::default())
            .await
            .unwrap();
        let texts: Vec<_> = listed.iter().filter_map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["two", "uno"], "most recent first");
    }

    #[tokio::test]
    async fn blobs_roundtrip_and_link_to_parent() {
        let (store, ch) = connected_with_channel().await;
        let parent = store.send_text(ch, "meta").await.unwrap();
        let blob = store
            .send_blob(ch, Bytes::from_static(b"payload"), "x_0000.chunk", Some(parent))
            .await
            .unwrap();

        assert_eq!(store.get_blob(ch, blob).await.unwrap(), &b"payload"[..]);
        let replies = store
            .list_messages(ch, &MessageFilter::replies_to(parent))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_blob);
        assert_eq!(replies[0].filename.as_deref(), Some("x_0000.chunk"));
        assert!(store.edit_text(ch, blob, "nope").await.is_err());
    }

    #[tokio::test]
    async fn oversize_blob_rejected() {
        let (store, ch) = connected_with_channel().await;
        let err = store
            .send_blob(ch, Bytes::from(vec![0u8; 2048]), "big", None)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn pinned_filter_and_limit() {
        let (store, ch) = connected_with_channel().await;
        for i in 0..5 {
            let r = store.send_text(ch, &format!("m{i}")).await.unwrap();
            if i % 2 == 0 {
                store.pin(ch, r).await.unwrap();
            }
        }
        let pinned = store
            .list_messages(ch, &MessageFilter::pinned(2))
            .await
            .unwrap();
        let texts: Vec<_> = pinned.iter().filter_map(|m| m.text.clone()).collect();
        assert_eq!(texts, vec!["m4", "m2"]);
    }

    #[tokio::test]
    async fn delete_removes_envelope_and_blob() {
        let (store, ch) = connected_with_channel().await;
        let blob = store
            .send_blob(ch, Bytes::from_static(b"b"), "b", None)
            .await
            .unwrap();
        store.delete(ch, &[blob, MessageRef(12345)]).await.unwrap();

        assert!(matches!(
            store.get_blob(ch, blob).await,
            Err(VaultError::RecordNotFound(_))
        ));
        assert!(store
            .list_messages(ch, &MessageFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn refs_continue_after_reconnect() {
        let (store, ch) = connected_with_channel().await;
        let before = store.send_text(ch, "a").await.unwrap();
        store.disconnect().await.unwrap();
        store.connect().await.unwrap();
        let after = store.send_text(ch, "b").await.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn send_to_missing_channel_fails() {
        let store = memory_store(1024);
        store.connect().await.unwrap();
        assert!(matches!(
            store.send_text(77, "x").await,
            Err(VaultError::RecordNotFound(_))
        ));
    }
}
