use thiserror::Error;

/// Reasons an outbound message (or edit) is refused before it leaves the
/// client. All of them are user-correctable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    Empty,

    #[error("Message too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Message contains forbidden content: {pattern}")]
    Forbidden { pattern: &'static str },

    #[error("Only the author can change this message")]
    NotAuthor,

    #[error("Message is still sending")]
    StillSending,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
