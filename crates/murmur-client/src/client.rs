//! Client facade: one signed-in user, at most one open conversation.
//!
//! [`ChatClient`] gates outbound sends (validation, rate gate, mention
//! extraction), owns the synchronizer and typing tracker of the open
//! conversation, and tears both down before opening another one.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use murmur_shared::mentions::{active_mention, extract_mentions, filter_candidates};
use murmur_shared::validate::validate_with_limit;
use murmur_shared::{
    ClientToken, Conversation, ConversationId, IdentityProvider, MessageContent, MessageId,
    OutgoingMessage, Principal, ReplyRef, UserId, ValidationError,
};
use murmur_store::{MessageStore, ObjectStore, PinStore, PresenceTransport};

use crate::config::SyncConfig;
use crate::directory::SessionDirectory;
use crate::error::{Result, SyncError};
use crate::events::{TimelineEvent, EVENT_BUFFER};
use crate::presence::TypingTracker;
use crate::rate_gate::{RateDecision, RateGate};
use crate::sync::{spawn_timeline, TimelineHandle};
use crate::timeline::{Delivery, TimelineView};

/// External services the client is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn MessageStore>,
    pub presence: Arc<dyn PresenceTransport>,
    pub objects: Arc<dyn ObjectStore>,
    pub pins: Arc<dyn PinStore>,
}

struct ActiveConversation {
    timeline: TimelineHandle,
    typing: TypingTracker,
}

pub struct ChatClient {
    services: Collaborators,
    config: SyncConfig,
    directory: SessionDirectory,
    rate_gate: RateGate,
    events: mpsc::Sender<TimelineEvent>,
    active: Option<ActiveConversation>,
}

impl ChatClient {
    /// Build a client for the currently signed-in user. Returns the client
    /// and the receiving end of its event channel.
    pub fn new(
        config: SyncConfig,
        services: Collaborators,
    ) -> Result<(Self, mpsc::Receiver<TimelineEvent>)> {
        let me = services
            .identity
            .current_user()
            .ok_or(SyncError::NoIdentity)?;
        let directory = SessionDirectory::load(me.id.clone(), Arc::clone(&services.pins))?;
        let rate_gate = RateGate::new(config.rate_max_sends, config.rate_window);
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);

        info!(user = %me.id, verified = me.verified, "Chat client ready");

        Ok((
            Self {
                services,
                config,
                directory,
                rate_gate,
                events,
                active: None,
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn me(&self) -> Result<Principal> {
        self.services
            .identity
            .current_user()
            .ok_or(SyncError::NoIdentity)
    }

    fn active(&self) -> Result<&ActiveConversation> {
        self.active.as_ref().ok_or(SyncError::NoActiveConversation)
    }

    // ----- directory -----------------------------------------------------

    pub fn list_channels(&self) -> Vec<Conversation> {
        self.directory.list_channels()
    }

    pub fn direct_session(&self, other: &UserId, other_display_name: &str) -> Conversation {
        self.directory.direct_session(other, other_display_name)
    }

    pub fn toggle_session_pin(&mut self, id: &ConversationId) -> Result<bool> {
        Ok(self.directory.toggle_pin(id)?)
    }

    pub fn is_session_pinned(&self, id: &ConversationId) -> bool {
        self.directory.is_pinned(id)
    }

    // ----- conversation lifecycle ---------------------------------------

    /// Open a conversation, closing the current one first. Returns a
    /// receiver for the new timeline.
    pub async fn open(&mut self, id: ConversationId) -> Result<watch::Receiver<TimelineView>> {
        let me = self.me()?;
        self.close().await;

        let timeline = spawn_timeline(
            id.clone(),
            me.id.clone(),
            Arc::clone(&self.services.store),
            &self.config,
            self.events.clone(),
        );
        let mut typing = TypingTracker::new(
            id.clone(),
            me.id,
            me.display_name,
            Arc::clone(&self.services.presence),
            self.config.typing_debounce,
            self.config.typing_stale_after,
        );
        typing.start();

        let view = timeline.watch();
        self.active = Some(ActiveConversation { timeline, typing });
        Ok(view)
    }

    /// Open the direct conversation with `other`.
    pub async fn open_direct(&mut self, other: &UserId) -> Result<watch::Receiver<TimelineView>> {
        let me = self.me()?;
        self.open(ConversationId::direct(&me.id, other)).await
    }

    /// Close the open conversation, if any. Its echoes are dropped.
    pub async fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            debug!(conversation = %active.timeline.conversation_id(), "Closing conversation");
            active.typing.close();
            active.timeline.close().await;
        }
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|a| a.timeline.conversation_id())
    }

    pub fn view(&self) -> Option<TimelineView> {
        self.active.as_ref().map(|a| a.timeline.view())
    }

    // ----- sending -------------------------------------------------------

    fn check_rate(&mut self) -> Result<()> {
        match self.rate_gate.check(Instant::now()) {
            RateDecision::Allowed => Ok(()),
            RateDecision::Throttled { retry_after } => {
                debug!(?retry_after, "Send throttled");
                Err(SyncError::RateLimited { retry_after })
            }
        }
    }

    fn reply_ref(&self, id: &MessageId) -> Result<ReplyRef> {
        let view = self.active()?.timeline.view();
        let entry = view.get(id).ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if entry.delivery != Delivery::Confirmed {
            return Err(ValidationError::StillSending.into());
        }
        Ok(entry.message.reply_ref())
    }

    async fn dispatch(&mut self, me: &Principal, content: MessageContent, reply_to: Option<ReplyRef>) -> Result<MessageId> {
        let mentions = content.body().map(extract_mentions).unwrap_or_default();
        let active = self.active()?;
        let outgoing = OutgoingMessage {
            conversation_id: active.timeline.conversation_id().clone(),
            sender: me.author(),
            content,
            reply_to,
            mentions,
            client_token: ClientToken::new(),
        };

        match active.timeline.send(outgoing).await {
            Ok(id) => {
                active.typing.stop();
                Ok(id)
            }
            Err(e) => {
                self.rate_gate.refund();
                Err(e)
            }
        }
    }

    /// Send a text message, optionally quoting `reply_to`.
    pub async fn send(&mut self, text: &str, reply_to: Option<&MessageId>) -> Result<MessageId> {
        let me = self.me()?;
        self.active()?;
        validate_with_limit(text, false, self.config.max_body_len)?;
        let reply = reply_to.map(|id| self.reply_ref(id)).transpose()?;
        self.check_rate()?;

        self.dispatch(&me, MessageContent::text(text), reply).await
    }

    /// Upload an image and send it with an optional caption.
    pub async fn send_image(
        &mut self,
        bytes: Vec<u8>,
        name: &str,
        caption: Option<&str>,
    ) -> Result<MessageId> {
        let me = self.me()?;
        self.active()?;
        if bytes.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        validate_with_limit(caption.unwrap_or(""), true, self.config.max_body_len)?;
        self.check_rate()?;

        let url = match self.services.objects.upload(bytes, name).await {
            Ok(url) => url,
            Err(e) => {
                self.rate_gate.refund();
                return Err(e.into());
            }
        };
        let caption = caption.filter(|c| !c.is_empty()).map(str::to_string);

        self.dispatch(&me, MessageContent::image(url, caption), None).await
    }

    // ----- mutations -----------------------------------------------------

    /// Replace the text of one of your messages.
    pub async fn edit(&self, id: &MessageId, text: &str) -> Result<()> {
        let me = self.me()?;
        let active = self.active()?;
        let has_attachment = active
            .timeline
            .view()
            .get(id)
            .is_some_and(|e| e.message.content.has_attachment());
        validate_with_limit(text, has_attachment, self.config.max_body_len)?;

        active
            .timeline
            .edit(id.clone(), me.id, text.to_string())
            .await
    }

    /// Returns whether your reaction is now present.
    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str) -> Result<bool> {
        let me = self.me()?;
        self.active()?
            .timeline
            .toggle_reaction(id.clone(), emoji.to_string(), me.id)
            .await
    }

    /// Returns whether the message is now pinned.
    pub async fn toggle_pin(&self, id: &MessageId) -> Result<bool> {
        self.active()?.timeline.toggle_pin(id.clone()).await
    }

    pub async fn delete(&self, id: &MessageId) -> Result<()> {
        let me = self.me()?;
        self.active()?.timeline.remove(id.clone(), me.id).await
    }

    /// Resend a failed message.
    pub async fn retry(&self, id: &MessageId) -> Result<()> {
        self.active()?.timeline.retry(id.clone()).await
    }

    /// Drop a failed message.
    pub async fn discard(&self, id: &MessageId) -> Result<()> {
        self.active()?.timeline.discard(id.clone()).await
    }

    // ----- typing and mentions ------------------------------------------

    /// Feed the composer text on every change.
    pub fn on_input_change(&self, text: &str) {
        if let Some(active) = &self.active {
            active.typing.on_local_input_change(text);
        }
    }

    pub fn typing_summary(&self) -> Option<String> {
        self.active.as_ref().and_then(|a| a.typing.summary())
    }

    /// Candidate names for the mention being typed at `caret`, if any.
    pub fn mention_suggestions<'a, S: AsRef<str>>(
        &self,
        text: &str,
        caret: usize,
        candidates: &'a [S],
    ) -> Vec<&'a str> {
        match active_mention(text, caret) {
            Some(active) => filter_candidates(&active.query, candidates),
            None => Vec::new(),
        }
    }
}
