use std::time::Duration;

use thiserror::Error;

use murmur_shared::{MessageId, ValidationError};
use murmur_store::StoreError;

/// Errors surfaced by the sync core. None of them is fatal; each is local to
/// one conversation and recoverable by retrying or reselecting.
#[derive(Error, Debug)]
pub enum SyncError {
    /// User-correctable input problem. Nothing was sent.
    #[error("Rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Too many sends in the current window. Nothing was sent.
    #[error("Sending too fast, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Too many unconfirmed echoes outstanding.
    #[error("Send backlog: {pending} messages still unconfirmed")]
    SendBacklog { pending: usize },

    /// A store write failed. Any optimistic state has been rolled back.
    #[error("Transport error: {0}")]
    Transport(#[from] StoreError),

    /// The message is not in the current timeline.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    #[error("No signed-in user")]
    NoIdentity,

    #[error("No conversation is open")]
    NoActiveConversation,

    /// The conversation was closed while the request was in flight.
    #[error("Conversation closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
