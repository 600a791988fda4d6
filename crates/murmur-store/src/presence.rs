//! In-process presence transport.
//!
//! Frames are bincode-encoded and published on the conversation's
//! `typing:<id>` topic. Subscribers receive every bus message and keep only
//! the ones on their topic that decode cleanly.

use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use murmur_shared::{ConversationId, PresenceFrame};

use crate::contract::{PresenceStream, PresenceTransport};

const DEFAULT_CAPACITY: usize = 256;

/// A raw message as it travels on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

/// Topic-addressed broadcast bus. Clones share the same bus.
#[derive(Clone)]
pub struct PresenceBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for PresenceBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl PresenceBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish raw bytes on a topic. Used for frames not produced by this
    /// crate (and by tests injecting garbage).
    pub fn publish_raw(&self, topic: String, data: Vec<u8>) {
        let _ = self.tx.send(BusMessage { topic, data });
    }
}

/// Decode a bus message if it is a presence frame for `conversation_id`.
pub fn try_decode_frame(
    message: &BusMessage,
    conversation_id: &ConversationId,
) -> Option<PresenceFrame> {
    if message.topic != conversation_id.to_topic() {
        return None;
    }

    match PresenceFrame::from_bytes(&message.data) {
        Ok(frame) if frame.conversation_id() == conversation_id => Some(frame),
        Ok(frame) => {
            warn!(
                topic = %message.topic,
                frame_conversation = %frame.conversation_id(),
                "Presence frame on mismatched topic, dropping"
            );
            None
        }
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Undecodable presence frame, dropping");
            None
        }
    }
}

impl PresenceTransport for PresenceBus {
    fn publish(&self, frame: PresenceFrame) {
        let topic = frame.conversation_id().to_topic();
        match frame.to_bytes() {
            Ok(data) => {
                debug!(topic = %topic, len = data.len(), "Publishing presence frame");
                self.publish_raw(topic, data);
            }
            Err(e) => warn!(topic = %topic, error = %e, "Failed to encode presence frame"),
        }
    }

    fn subscribe(&self, conversation_id: &ConversationId) -> PresenceStream {
        let rx = self.tx.subscribe();
        let conversation_id = conversation_id.clone();

        futures::stream::unfold((rx, conversation_id), |(mut rx, conversation_id)| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if let Some(frame) = try_decode_frame(&message, &conversation_id) {
                            return Some((frame, (rx, conversation_id)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conversation = %conversation_id, skipped, "Presence subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
