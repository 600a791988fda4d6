//! Reaction and pin mutations on a single message, plus the pinned list.
//!
//! Each mutation is applied locally and returns the [`MessagePatch`] that
//! carries the same change to the durable store. Reaction patches name the
//! user and the target presence, so replaying one is harmless and patches
//! from different users commute.

use chrono::{DateTime, Utc};

use murmur_shared::{Message, MessageId, MessagePatch, UserId};

/// Flip `user`'s `emoji` reaction on `message`.
pub fn toggle_reaction(message: &mut Message, emoji: &str, user: &UserId) -> MessagePatch {
    let present = message.reactions.toggle(emoji, user);
    MessagePatch::Reaction {
        emoji: emoji.to_string(),
        user: user.clone(),
        present,
    }
}

/// Flip the pinned flag on `message`.
pub fn toggle_pin(message: &mut Message, now: DateTime<Utc>) -> MessagePatch {
    let patch = MessagePatch::Pin {
        pinned: !message.pinned,
    };
    patch.apply(message, now);
    patch
}

/// Pinned messages of a timeline, newest pin first, capped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinnedIndex {
    entries: Vec<MessageId>,
}

impl PinnedIndex {
    pub fn build<'a>(messages: impl IntoIterator<Item = &'a Message>, cap: usize) -> Self {
        let mut pinned: Vec<&Message> = messages.into_iter().filter(|m| m.pinned).collect();
        // Unknown pin times sort last; ties keep timeline order reversed so the
        // newer message wins.
        pinned.reverse();
        pinned.sort_by(|a, b| b.pinned_at.cmp(&a.pinned_at));
        pinned.truncate(cap);

        Self {
            entries: pinned.into_iter().map(|m| m.id.clone()).collect(),
        }
    }

    pub fn ids(&self) -> &[MessageId] {
        &self.entries
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
