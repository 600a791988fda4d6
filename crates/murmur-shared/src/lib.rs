//! # murmur-shared
//!
//! Domain model and pure functions shared by the store and the client:
//! identifiers, the message model, outbound validation and mention parsing.

pub mod constants;
pub mod error;
pub mod identity;
pub mod mentions;
pub mod protocol;
pub mod types;
pub mod validate;

pub use error::{ProtocolError, ValidationError};
pub use identity::{IdentityProvider, Principal, StaticIdentity};
pub use protocol::{
    Author, Message, MessageContent, MessagePatch, OutgoingMessage, PresenceFrame, ReactionSet,
    ReplyRef, Snapshot, TypingRecord,
};
pub use types::{
    ClientToken, Conversation, ConversationId, ConversationKind, MessageId, Revision, UserId,
};
