//! Session directory: which conversations exist and which ones the local
//! user has pinned.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use murmur_shared::{Conversation, ConversationId, ConversationKind, UserId};
use murmur_store::{PinStore, Result};

/// Well-known channels, in display order: `(id, display name)`.
pub const CHANNEL_REGISTRY: &[(&str, &str)] = &[
    ("general", "General"),
    ("introductions", "Introductions"),
    ("study-hall", "Study Hall"),
    ("off-topic", "Off Topic"),
];

/// Conversation id shared by two users, whichever of them asks.
pub fn resolve_direct(a: &UserId, b: &UserId) -> ConversationId {
    ConversationId::direct(a, b)
}

pub fn is_channel(id: &ConversationId) -> bool {
    CHANNEL_REGISTRY
        .iter()
        .any(|(channel, _)| *channel == id.as_str())
}

pub struct SessionDirectory {
    user: UserId,
    pins: BTreeSet<ConversationId>,
    pin_store: Arc<dyn PinStore>,
}

impl SessionDirectory {
    /// Load `user`'s pins from the pin store.
    pub fn load(user: UserId, pin_store: Arc<dyn PinStore>) -> Result<Self> {
        let pins: BTreeSet<_> = pin_store.load_pins(&user)?.into_iter().collect();
        info!(user = %user, pinned = pins.len(), "Session directory loaded");
        Ok(Self {
            user,
            pins,
            pin_store,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// All well-known channels in registry order.
    pub fn list_channels(&self) -> Vec<Conversation> {
        CHANNEL_REGISTRY
            .iter()
            .map(|(id, name)| {
                let id = ConversationId::new(*id);
                Conversation {
                    pinned_by_local_user: self.is_pinned(&id),
                    id,
                    kind: ConversationKind::Channel,
                    display_name: (*name).to_string(),
                    participant_ids: None,
                }
            })
            .collect()
    }

    /// The direct conversation between the local user and `other`.
    pub fn direct_session(&self, other: &UserId, other_display_name: &str) -> Conversation {
        let id = resolve_direct(&self.user, other);
        let participants = if self.user <= *other {
            [self.user.clone(), other.clone()]
        } else {
            [other.clone(), self.user.clone()]
        };
        Conversation {
            pinned_by_local_user: self.is_pinned(&id),
            id,
            kind: ConversationKind::Direct,
            display_name: other_display_name.to_string(),
            participant_ids: Some(participants),
        }
    }

    pub fn is_pinned(&self, id: &ConversationId) -> bool {
        self.pins.contains(id)
    }

    /// Flip the pin on a conversation and persist it. Returns the new state.
    pub fn toggle_pin(&mut self, id: &ConversationId) -> Result<bool> {
        let pinned = !self.is_pinned(id);
        self.pin_store.set_pinned(&self.user, id, pinned)?;

        if pinned {
            self.pins.insert(id.clone());
        } else {
            self.pins.remove(id);
        }

        debug!(conversation = %id, pinned, "Session pin toggled");
        Ok(pinned)
    }

    pub fn pinned(&self) -> impl Iterator<Item = &ConversationId> {
        self.pins.iter()
    }
}
