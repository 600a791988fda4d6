use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::REPLY_SNIPPET_CHARS;
use crate::error::ProtocolError;
use crate::types::{ClientToken, ConversationId, MessageId, Revision, UserId};

/// Display attributes of a message's sender, denormalized onto the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

/// What a message carries. A message always has a body or an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Image { url: String, caption: Option<String> },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn image(url: impl Into<String>, caption: Option<String>) -> Self {
        Self::Image {
            url: url.into(),
            caption: caption.filter(|c| !c.trim().is_empty()),
        }
    }

    /// Text body, or the caption of an image.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Text { body } => Some(body),
            Self::Image { caption, .. } => caption.as_deref(),
        }
    }

    pub fn attachment_url(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::Image { url, .. } => Some(url),
        }
    }

    pub fn has_attachment(&self) -> bool {
        matches!(self, Self::Image { .. })
    }

    /// Same content with the text replaced. Editing an image edits its caption.
    pub fn with_body(&self, body: impl Into<String>) -> Self {
        let body = body.into();
        match self {
            Self::Text { .. } => Self::Text { body },
            Self::Image { url, .. } => Self::image(url.clone(), Some(body)),
        }
    }

    /// Short single-line preview used for reply quotes.
    pub fn snippet(&self, max_chars: usize) -> String {
        match self.body() {
            Some(body) => {
                let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
                if flat.chars().count() > max_chars {
                    let cut: String = flat.chars().take(max_chars).collect();
                    format!("{cut}…")
                } else {
                    flat
                }
            }
            None => "[image]".to_string(),
        }
    }
}

/// Quote of the message being replied to, captured at send time.
///
/// This is a copy, not a reference: it stays valid when the original
/// message is edited or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub message_id: MessageId,
    pub sender_display_name: String,
    pub snippet: String,
}

/// Per-emoji sets of reacting users.
///
/// A user appears at most once under a given emoji, and an emoji with no
/// users is removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ReactionSet(BTreeMap<String, BTreeSet<UserId>>);

impl ReactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, emoji: &str, user: &UserId) -> bool {
        self.0.get(emoji).is_some_and(|users| users.contains(user))
    }

    /// Make `user`'s presence under `emoji` equal to `present`.
    /// Returns `true` if the aggregate changed.
    pub fn set(&mut self, emoji: &str, user: &UserId, present: bool) -> bool {
        if present {
            self.0
                .entry(emoji.to_string())
                .or_default()
                .insert(user.clone())
        } else {
            let Some(users) = self.0.get_mut(emoji) else {
                return false;
            };
            let removed = users.remove(user);
            if users.is_empty() {
                self.0.remove(emoji);
            }
            removed
        }
    }

    /// Flip `user`'s reaction under `emoji`. Returns whether it is now present.
    pub fn toggle(&mut self, emoji: &str, user: &UserId) -> bool {
        let present = !self.contains(emoji, user);
        self.set(emoji, user, present);
        present
    }

    pub fn users(&self, emoji: &str) -> Option<&BTreeSet<UserId>> {
        self.0.get(emoji)
    }

    pub fn count(&self, emoji: &str) -> usize {
        self.0.get(emoji).map_or(0, BTreeSet::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<UserId>)> {
        self.0.iter().map(|(emoji, users)| (emoji.as_str(), users))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A chat message as held by the durable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Author,
    pub content: MessageContent,
    /// Assigned by the durable store. `None` while the message is pending.
    pub created_at: Option<DateTime<Utc>>,
    pub edited: bool,
    pub pinned: bool,
    pub pinned_at: Option<DateTime<Utc>>,
    pub reply_to: Option<ReplyRef>,
    pub reactions: ReactionSet,
    /// `@name` tokens found in the body when it was sent.
    pub mentions: Vec<String>,
    /// Idempotency token of the append that created this record.
    pub client_token: Option<ClientToken>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.created_at.is_none()
    }

    /// Build the quote stored on a reply to this message.
    pub fn reply_ref(&self) -> ReplyRef {
        ReplyRef {
            message_id: self.id.clone(),
            sender_display_name: self.sender.display_name.clone(),
            snippet: self.content.snippet(REPLY_SNIPPET_CHARS),
        }
    }
}

/// Payload of a durable-store `append`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub sender: Author,
    pub content: MessageContent,
    pub reply_to: Option<ReplyRef>,
    pub mentions: Vec<String>,
    pub client_token: ClientToken,
}

/// Field-level mutation of an existing message.
///
/// Reaction patches are set operations on one user, so concurrent patches
/// from different users commute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MessagePatch {
    Body { body: String },
    Reaction { emoji: String, user: UserId, present: bool },
    Pin { pinned: bool },
}

impl MessagePatch {
    pub fn apply(&self, message: &mut Message, now: DateTime<Utc>) {
        match self {
            Self::Body { body } => {
                message.content = message.content.with_body(body.clone());
                message.edited = true;
            }
            Self::Reaction {
                emoji,
                user,
                present,
            } => {
                message.reactions.set(emoji, user, *present);
            }
            Self::Pin { pinned } => {
                message.pinned = *pinned;
                message.pinned_at = pinned.then_some(now);
            }
        }
    }

    /// Whether `message` already reflects this patch.
    pub fn is_reflected_in(&self, message: &Message) -> bool {
        match self {
            Self::Body { body } => message.content.body() == Some(body.as_str()),
            Self::Reaction {
                emoji,
                user,
                present,
            } => message.reactions.contains(emoji, user) == *present,
            Self::Pin { pinned } => message.pinned == *pinned,
        }
    }
}

/// Full state of one conversation as pushed by the durable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub conversation_id: ConversationId,
    /// Store revision this snapshot reflects.
    pub revision: Revision,
    /// Most recent messages, oldest first.
    pub messages: Vec<Message>,
}

/// Ephemeral "is typing" state of one user in one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingRecord {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub display_name: String,
    pub is_typing: bool,
    pub last_activity_at: DateTime<Utc>,
}

/// Frames exchanged on the presence bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceFrame {
    /// Typing state changed or was refreshed.
    Typing(TypingRecord),
    /// The user closed the conversation; drop their record.
    Left {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

impl PresenceFrame {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Typing(record) => &record.conversation_id,
            Self::Left {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            id: MessageId::new("m1"),
            conversation_id: ConversationId::new("general"),
            sender: Author {
                id: UserId::new("sam"),
                display_name: "Sam".into(),
                avatar_ref: None,
            },
            content: MessageContent::text("hello"),
            created_at: Some(Utc::now()),
            edited: false,
            pinned: false,
            pinned_at: None,
            reply_to: None,
            reactions: ReactionSet::new(),
            mentions: Vec::new(),
            client_token: None,
        }
    }

    #[test]
    fn test_reaction_toggle_is_involution() {
        let mut set = ReactionSet::new();
        let sam = UserId::new("sam");
        set.toggle("👍", &UserId::new("lee"));
        let before = set.clone();

        assert!(set.toggle("👍", &sam));
        assert!(!set.toggle("👍", &sam));
        assert_eq!(set, before);
    }

    #[test]
    fn test_empty_emoji_key_removed() {
        let mut set = ReactionSet::new();
        let sam = UserId::new("sam");
        set.set("🎉", &sam, true);
        set.set("🎉", &sam, false);
        assert!(set.is_empty());
        assert!(set.users("🎉").is_none());
    }

    #[test]
    fn test_user_once_per_emoji_but_many_emoji() {
        let mut set = ReactionSet::new();
        let sam = UserId::new("sam");
        set.set("👍", &sam, true);
        assert!(!set.set("👍", &sam, true));
        set.set("❤️", &sam, true);
        assert_eq!(set.count("👍"), 1);
        assert_eq!(set.count("❤️"), 1);
    }

    #[test]
    fn test_patch_apply_and_reflected() {
        let mut msg = sample_message();
        let now = Utc::now();

        let edit = MessagePatch::Body {
            body: "hello there".into(),
        };
        assert!(!edit.is_reflected_in(&msg));
        edit.apply(&mut msg, now);
        assert!(msg.edited);
        assert!(edit.is_reflected_in(&msg));

        let pin = MessagePatch::Pin { pinned: true };
        pin.apply(&mut msg, now);
        assert!(msg.pinned);
        assert_eq!(msg.pinned_at, Some(now));

        MessagePatch::Pin { pinned: false }.apply(&mut msg, now);
        assert!(msg.pinned_at.is_none());
    }

    #[test]
    fn test_image_caption_edit_keeps_url() {
        let content = MessageContent::image("file:///tmp/cat.png", None);
        let edited = content.with_body("a cat");
        assert_eq!(edited.attachment_url(), Some("file:///tmp/cat.png"));
        assert_eq!(edited.body(), Some("a cat"));
    }

    #[test]
    fn test_reply_snippet_truncates_and_flattens() {
        let mut msg = sample_message();
        msg.content = MessageContent::text(format!("line one\nline two {}", "x".repeat(200)));
        let reply = msg.reply_ref();
        assert!(reply.snippet.starts_with("line one line two"));
        assert_eq!(reply.snippet.chars().count(), REPLY_SNIPPET_CHARS + 1);
        assert_eq!(reply.sender_display_name, "Sam");
    }

    #[test]
    fn test_content_json_is_tagged() {
        let json = serde_json::to_value(MessageContent::text("hi")).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["body"], "hi");
    }

    #[test]
    fn test_presence_frame_bytes() {
        let frame = PresenceFrame::Typing(TypingRecord {
            conversation_id: ConversationId::new("general"),
            user_id: UserId::new("sam"),
            display_name: "Sam".into(),
            is_typing: true,
            last_activity_at: Utc::now(),
        });
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(PresenceFrame::from_bytes(&bytes).unwrap(), frame);
        assert!(PresenceFrame::from_bytes(&[0xff, 0xff]).is_err());
    }
}
