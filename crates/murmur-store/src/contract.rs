//! Contracts of the external collaborators the sync core talks to.
//!
//! The durable message store, presence transport and object store are
//! normally remote services. This crate ships local implementations of each
//! ([`LocalStore`], [`PresenceBus`], [`FsObjectStore`]) so the core can run
//! and be tested end to end.
//!
//! [`LocalStore`]: crate::LocalStore
//! [`PresenceBus`]: crate::PresenceBus
//! [`FsObjectStore`]: crate::FsObjectStore

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;

use murmur_shared::{
    ConversationId, MessageId, MessagePatch, OutgoingMessage, PresenceFrame, Revision, Snapshot,
    UserId,
};

use crate::error::Result;

/// Push-based sequence of full conversation states. An `Err` item reports a
/// dropped subscription; the stream may end after it.
pub type SnapshotStream = BoxStream<'static, Result<Snapshot>>;

/// Presence frames for one conversation.
pub type PresenceStream = BoxStream<'static, PresenceFrame>;

/// Outcome of a successful `append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Server-assigned message id.
    pub id: MessageId,
    /// Store revision that contains the message.
    pub revision: Revision,
}

/// Append-mostly, server-ordered message log, one per conversation.
///
/// Snapshots are fully ordered (oldest first) and carry every message field,
/// including the client token the message was appended with.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Subscribe to the most recent `limit` messages of a conversation.
    /// The first item is the current state.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<SnapshotStream>;

    /// Append a message. Appending the same client token twice returns the
    /// first record's id.
    async fn append(&self, message: OutgoingMessage) -> Result<Receipt>;

    /// Apply a field-level patch. Fails with `NotFound` if the message is gone.
    async fn patch(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> Result<Revision>;

    /// Delete a message. Fails with `NotFound` if it is already gone.
    async fn remove(&self, conversation_id: &ConversationId, message_id: &MessageId)
        -> Result<Revision>;
}

/// Ephemeral typing-state fan-out. Publishing is fire-and-forget.
pub trait PresenceTransport: Send + Sync {
    fn publish(&self, frame: PresenceFrame);

    fn subscribe(&self, conversation_id: &ConversationId) -> PresenceStream;
}

/// Binary object storage for attachments.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` and return a fetchable URL.
    async fn upload(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<String>;
}

/// Process-wide, per-user record of pinned conversations.
pub trait PinStore: Send + Sync {
    fn load_pins(&self, user: &UserId) -> Result<Vec<ConversationId>>;

    fn set_pinned(&self, user: &UserId, conversation_id: &ConversationId, pinned: bool)
        -> Result<()>;
}

/// Adapt an mpsc receiver into a boxed stream.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
