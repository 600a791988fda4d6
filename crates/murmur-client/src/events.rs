//! Discrete notifications from the sync core to the presentation layer.
//!
//! Continuous state (the rendered timeline) goes through a `watch`
//! channel; these are the one-off things a UI reacts to once.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use murmur_shared::{ConversationId, MessageId};

use crate::timeline::TimelineState;

/// Capacity of the event channel handed out by the client.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineEvent {
    StateChanged {
        conversation_id: ConversationId,
        state: TimelineState,
    },
    /// A send failed at the store. The echo is gone; put `text` back in the
    /// input box.
    DraftRestored {
        conversation_id: ConversationId,
        text: String,
        error: String,
    },
    /// An echo went unconfirmed for too long and is now marked failed.
    EchoTimedOut {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// A send was refused because too many echoes are unconfirmed.
    SendBacklog {
        conversation_id: ConversationId,
        pending: usize,
    },
    /// The snapshot stream dropped. The timeline stays visible and a
    /// resubscribe is scheduled.
    SubscriptionError {
        conversation_id: ConversationId,
        error: String,
        retry_in: Duration,
    },
    /// An edit, reaction, pin or delete failed and was rolled back.
    WriteFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        error: String,
    },
}

impl TimelineEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            TimelineEvent::StateChanged { conversation_id, .. }
            | TimelineEvent::DraftRestored { conversation_id, .. }
            | TimelineEvent::EchoTimedOut { conversation_id, .. }
            | TimelineEvent::SendBacklog { conversation_id, .. }
            | TimelineEvent::SubscriptionError { conversation_id, .. }
            | TimelineEvent::WriteFailed { conversation_id, .. } => conversation_id,
        }
    }

    /// Events carrying user data that exists nowhere else. These are queued
    /// rather than dropped when the channel is full.
    pub fn must_deliver(&self) -> bool {
        matches!(self, TimelineEvent::DraftRestored { .. })
    }
}

/// Deliver an event without ever blocking the caller.
///
/// A full channel drops the event, except for [`TimelineEvent::must_deliver`]
/// events, which are handed to a task that waits for room. Must be called
/// from within a tokio runtime.
pub fn emit_event(events: &mpsc::Sender<TimelineEvent>, event: TimelineEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) if event.must_deliver() => {
            debug!(conversation = %event.conversation_id(), "Event channel full, queueing event");
            let events = events.clone();
            tokio::spawn(async move {
                if events.send(event).await.is_err() {
                    trace!("Event receiver gone");
                }
            });
        }
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(conversation = %event.conversation_id(), ?event, "Event channel full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("Event receiver gone");
        }
    }
}
