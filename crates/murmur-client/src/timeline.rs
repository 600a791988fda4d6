//! Timeline merge engine.
//!
//! [`Timeline`] holds everything one open conversation needs to render:
//! the last confirmed snapshot, the optimistic echoes of local sends, and
//! optimistic overlays for local edits, reactions, pins and deletes. It does
//! no I/O. The synchronizer task in [`crate::sync`] feeds it snapshots and
//! write completions and publishes [`Timeline::view`] after every change.
//!
//! Echoes are matched to confirmed records by idempotency token, then by the
//! id the store returned from `append`. Confirmed records that carry no token
//! fall back to matching by absence: a newly arrived record from the local
//! user with the same content claims the oldest unmatched echo.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use murmur_shared::{
    ClientToken, ConversationId, Message, MessageId, MessagePatch, OutgoingMessage, ReactionSet,
    Revision, Snapshot, UserId, ValidationError,
};
use murmur_store::Receipt;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::reactions::{self, PinnedIndex};

/// Handle for one optimistic mutation, used to report its completion.
pub type OpId = u64;

/// How far a store timestamp may trail the local clock and still count as
/// arriving after an echo.
const ECHO_CLOCK_SKEW_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineState {
    Idle,
    Loading,
    Live,
    /// Subscription dropped. The last timeline stays visible.
    Error,
    Closed,
}

impl std::fmt::Display for TimelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimelineState::Idle => "idle",
            TimelineState::Loading => "loading",
            TimelineState::Live => "live",
            TimelineState::Error => "error",
            TimelineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Confirmed,
    /// Local echo waiting for the store.
    Pending,
    /// Local echo that timed out; can be retried or discarded.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub message: Message,
    pub delivery: Delivery,
    /// Server time for confirmed messages, local send time for echoes.
    pub timestamp: DateTime<Utc>,
}

/// Everything the presentation layer renders for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineView {
    pub conversation_id: ConversationId,
    pub state: TimelineState,
    /// Oldest first.
    pub entries: Vec<TimelineEntry>,
    /// Newest pin first.
    pub pinned: Vec<MessageId>,
    /// Echoes still in flight.
    pub pending: usize,
    pub revision: Option<Revision>,
    pub error: Option<String>,
}

impl TimelineView {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            state: TimelineState::Idle,
            entries: Vec::new(),
            pinned: Vec::new(),
            pending: 0,
            revision: None,
            error: None,
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&TimelineEntry> {
        self.entries.iter().find(|e| e.message.id == *id)
    }

    pub fn bodies(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| e.message.content.body())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimelineSettings {
    pub limit: usize,
    pub pending_limit: usize,
    pub echo_timeout: Duration,
    pub pinned_cap: usize,
}

impl From<&SyncConfig> for TimelineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            limit: config.timeline_limit,
            pending_limit: config.pending_limit,
            echo_timeout: config.echo_timeout,
            pinned_cap: config.pinned_cap,
        }
    }
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

#[derive(Debug, Clone)]
struct Echo {
    message: Message,
    outgoing: OutgoingMessage,
    local_created: DateTime<Utc>,
    sent_at: Instant,
    failed: bool,
    /// Bumped on every retry so a stale append failure is ignored.
    attempt: u32,
    assigned: Option<MessageId>,
}

impl Echo {
    fn token(&self) -> ClientToken {
        self.outgoing.client_token
    }
}

#[derive(Debug, Clone)]
enum OverlayOp {
    Patch(MessagePatch),
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    InFlight,
    /// Reflected by every snapshot at or past this revision.
    At(Revision),
    /// The store no longer has the message.
    Gone,
}

#[derive(Debug, Clone)]
struct Overlay {
    op: OpId,
    message_id: MessageId,
    kind: OverlayOp,
    at: DateTime<Utc>,
    ack: Ack,
}

/// Result of feeding one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub applied: bool,
    /// State changed (e.g. `Loading` or `Error` to `Live`).
    pub state_changed: bool,
    pub matched_echoes: usize,
}

pub struct Timeline {
    conversation_id: ConversationId,
    local_user: UserId,
    settings: TimelineSettings,
    state: TimelineState,
    revision: Option<Revision>,
    confirmed: Vec<Message>,
    known_ids: HashSet<MessageId>,
    echoes: Vec<Echo>,
    overlays: Vec<Overlay>,
    next_op: OpId,
    last_error: Option<String>,
}

impl Timeline {
    pub fn new(conversation_id: ConversationId, local_user: UserId, settings: TimelineSettings) -> Self {
        Self {
            conversation_id,
            local_user,
            settings,
            state: TimelineState::Idle,
            revision: None,
            confirmed: Vec::new(),
            known_ids: HashSet::new(),
            echoes: Vec::new(),
            overlays: Vec::new(),
            next_op: 0,
            last_error: None,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn state(&self) -> TimelineState {
        self.state
    }

    /// Echoes still waiting for the store. Failed echoes are not counted.
    pub fn in_flight(&self) -> usize {
        self.echoes.iter().filter(|e| !e.failed).count()
    }

    pub fn begin_loading(&mut self) {
        if self.state == TimelineState::Idle {
            self.state = TimelineState::Loading;
        }
    }

    /// Record a subscription failure. Messages are kept.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        if self.state == TimelineState::Closed {
            return;
        }
        self.state = TimelineState::Error;
        self.last_error = Some(reason.into());
    }

    /// Tear down: drop every echo and overlay. Returns the number of echoes
    /// dropped.
    pub fn close(&mut self) -> usize {
        let dropped = self.echoes.len();
        self.echoes.clear();
        self.overlays.clear();
        self.state = TimelineState::Closed;
        dropped
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();

        if self.state == TimelineState::Closed {
            return outcome;
        }
        if snapshot.conversation_id != self.conversation_id {
            warn!(
                expected = %self.conversation_id,
                got = %snapshot.conversation_id,
                "Dropping snapshot for another conversation"
            );
            return outcome;
        }

        let previous_state = self.state;
        self.state = TimelineState::Live;
        self.last_error = None;
        outcome.state_changed = previous_state != TimelineState::Live;

        if self.revision.is_some_and(|current| snapshot.revision < current) {
            debug!(
                conversation = %self.conversation_id,
                revision = snapshot.revision,
                "Ignoring stale snapshot"
            );
            return outcome;
        }

        let mut seen = HashSet::new();
        let mut messages: Vec<Message> = snapshot
            .messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        if messages.len() > self.settings.limit {
            let excess = messages.len() - self.settings.limit;
            messages.drain(..excess);
        }

        outcome.matched_echoes = self.match_echoes(&messages);
        self.retain_overlays(&messages, snapshot.revision);

        self.known_ids = messages.iter().map(|m| m.id.clone()).collect();
        self.confirmed = messages;
        self.revision = Some(snapshot.revision);
        outcome.applied = true;

        debug!(
            conversation = %self.conversation_id,
            revision = snapshot.revision,
            confirmed = self.confirmed.len(),
            pending = self.echoes.len(),
            matched = outcome.matched_echoes,
            "Snapshot applied"
        );
        outcome
    }

    fn match_echoes(&mut self, confirmed: &[Message]) -> usize {
        let tokens: HashMap<ClientToken, &MessageId> = confirmed
            .iter()
            .filter_map(|m| m.client_token.map(|t| (t, &m.id)))
            .collect();
        let ids: HashSet<&MessageId> = confirmed.iter().map(|m| &m.id).collect();
        let mut claimed: HashSet<MessageId> = HashSet::new();
        let before = self.echoes.len();

        self.echoes.retain(|echo| {
            let hit = tokens
                .get(&echo.token())
                .map(|id| (*id).clone())
                .or_else(|| echo.assigned.clone().filter(|id| ids.contains(id)));
            match hit {
                Some(id) => !claimed.insert(id),
                None => true,
            }
        });

        // The first snapshot is history: nothing in it arrived after our echoes.
        if self.revision.is_none() {
            return before - self.echoes.len();
        }

        // Tokenless records: newly arrived, from us, same content, not older
        // than the echo, oldest echo first.
        let mut arrivals: Vec<&Message> = confirmed
            .iter()
            .filter(|m| {
                m.client_token.is_none()
                    && m.sender.id == self.local_user
                    && !self.known_ids.contains(&m.id)
                    && !claimed.contains(&m.id)
            })
            .collect();
        if !arrivals.is_empty() {
            self.echoes.retain(|echo| {
                let earliest = echo.local_created - chrono::Duration::milliseconds(ECHO_CLOCK_SKEW_MS);
                match arrivals.iter().position(|m| {
                    m.content == echo.message.content
                        && m.created_at.is_some_and(|at| at >= earliest)
                }) {
                    Some(pos) => {
                        arrivals.remove(pos);
                        false
                    }
                    None => true,
                }
            });
        }

        before - self.echoes.len()
    }

    fn retain_overlays(&mut self, confirmed: &[Message], revision: Revision) {
        let present: HashSet<&MessageId> = confirmed.iter().map(|m| &m.id).collect();
        self.overlays.retain(|overlay| match overlay.ack {
            Ack::InFlight => true,
            Ack::At(ack) => revision < ack && present.contains(&overlay.message_id),
            Ack::Gone => present.contains(&overlay.message_id),
        });
    }

    // ----- sends ---------------------------------------------------------

    /// Show `outgoing` immediately as a pending echo. Returns its local id.
    pub fn push_echo(
        &mut self,
        outgoing: &OutgoingMessage,
        local_created: DateTime<Utc>,
        now: Instant,
    ) -> Result<MessageId> {
        let pending = self.in_flight();
        if pending >= self.settings.pending_limit {
            return Err(SyncError::SendBacklog { pending });
        }

        let message = Message {
            id: MessageId::local(),
            conversation_id: self.conversation_id.clone(),
            sender: outgoing.sender.clone(),
            content: outgoing.content.clone(),
            created_at: None,
            edited: false,
            pinned: false,
            pinned_at: None,
            reply_to: outgoing.reply_to.clone(),
            reactions: ReactionSet::new(),
            mentions: outgoing.mentions.clone(),
            client_token: Some(outgoing.client_token),
        };
        let id = message.id.clone();

        self.echoes.push(Echo {
            message,
            outgoing: outgoing.clone(),
            local_created,
            sent_at: now,
            failed: false,
            attempt: 0,
            assigned: None,
        });
        Ok(id)
    }

    /// The store accepted the append. Returns `true` if the echo was
    /// resolved right away because the snapshot already had the record.
    pub fn echo_acked(&mut self, token: ClientToken, receipt: &Receipt) -> bool {
        let Some(pos) = self.echoes.iter().position(|e| e.token() == token) else {
            return false;
        };

        if self.known_ids.contains(&receipt.id) {
            self.echoes.remove(pos);
            return true;
        }
        self.echoes[pos].assigned = Some(receipt.id.clone());
        false
    }

    /// The append failed. Removes the echo and returns it so the caller can
    /// restore the draft. An echo that already timed out stays visible as
    /// failed, and a failure of a superseded attempt is ignored; both
    /// return `None`.
    pub fn echo_failed(&mut self, token: ClientToken, attempt: u32) -> Option<Message> {
        let pos = self.echoes.iter().position(|e| e.token() == token)?;
        let echo = &self.echoes[pos];
        if echo.failed || echo.attempt != attempt {
            return None;
        }
        Some(self.echoes.remove(pos).message)
    }

    /// Mark echoes older than the timeout as failed. Returns their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<MessageId> {
        let timeout = self.settings.echo_timeout;
        self.echoes
            .iter_mut()
            .filter(|e| !e.failed && now.saturating_duration_since(e.sent_at) >= timeout)
            .map(|e| {
                e.failed = true;
                e.message.id.clone()
            })
            .collect()
    }

    /// Put a failed echo back in flight. Returns the original append
    /// payload, same token included, and the new attempt number.
    pub fn retry(&mut self, id: &MessageId, now: Instant) -> Result<(OutgoingMessage, u32)> {
        let pending = self.in_flight();
        let echo = self
            .echoes
            .iter_mut()
            .find(|e| e.message.id == *id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if !echo.failed {
            return Err(ValidationError::StillSending.into());
        }
        if pending >= self.settings.pending_limit {
            return Err(SyncError::SendBacklog { pending });
        }

        echo.failed = false;
        echo.sent_at = now;
        echo.attempt += 1;
        Ok((echo.outgoing.clone(), echo.attempt))
    }

    /// Drop a failed echo for good.
    pub fn discard(&mut self, id: &MessageId) -> Result<Message> {
        let pos = self
            .echoes
            .iter()
            .position(|e| e.message.id == *id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if !self.echoes[pos].failed {
            return Err(ValidationError::StillSending.into());
        }
        Ok(self.echoes.remove(pos).message)
    }

    // ----- mutations -----------------------------------------------------

    /// A confirmed message as currently rendered, overlays applied.
    pub fn rendered(&self, id: &MessageId) -> Option<Message> {
        let mut message = self.confirmed.iter().find(|m| m.id == *id)?.clone();
        for overlay in self.overlays.iter().filter(|o| o.message_id == *id) {
            match &overlay.kind {
                OverlayOp::Patch(patch) => patch.apply(&mut message, overlay.at),
                OverlayOp::Remove => return None,
            }
        }
        Some(message)
    }

    fn target(&self, id: &MessageId) -> Result<Message> {
        if self.echoes.iter().any(|e| e.message.id == *id) {
            return Err(ValidationError::StillSending.into());
        }
        self.rendered(id).ok_or_else(|| SyncError::NotFound(id.clone()))
    }

    fn authored_target(&self, id: &MessageId, user: &UserId) -> Result<Message> {
        let message = self.target(id)?;
        if message.sender.id != *user {
            return Err(ValidationError::NotAuthor.into());
        }
        Ok(message)
    }

    fn push_overlay(&mut self, message_id: MessageId, kind: OverlayOp, at: DateTime<Utc>) -> OpId {
        self.next_op += 1;
        let op = self.next_op;
        self.overlays.push(Overlay {
            op,
            message_id,
            kind,
            at,
            ack: Ack::InFlight,
        });
        op
    }

    /// Replace the body of one of `user`'s messages. The caller validates
    /// the body.
    pub fn edit(
        &mut self,
        id: &MessageId,
        user: &UserId,
        body: String,
        now: DateTime<Utc>,
    ) -> Result<(OpId, MessagePatch)> {
        self.authored_target(id, user)?;
        let patch = MessagePatch::Body { body };
        let op = self.push_overlay(id.clone(), OverlayOp::Patch(patch.clone()), now);
        Ok((op, patch))
    }

    pub fn toggle_reaction(
        &mut self,
        id: &MessageId,
        emoji: &str,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(OpId, MessagePatch)> {
        let mut message = self.target(id)?;
        let patch = reactions::toggle_reaction(&mut message, emoji, user);
        let op = self.push_overlay(id.clone(), OverlayOp::Patch(patch.clone()), now);
        Ok((op, patch))
    }

    pub fn toggle_pin(&mut self, id: &MessageId, now: DateTime<Utc>) -> Result<(OpId, MessagePatch)> {
        let mut message = self.target(id)?;
        let patch = reactions::toggle_pin(&mut message, now);
        let op = self.push_overlay(id.clone(), OverlayOp::Patch(patch.clone()), now);
        Ok((op, patch))
    }

    pub fn remove(&mut self, id: &MessageId, user: &UserId, now: DateTime<Utc>) -> Result<OpId> {
        self.authored_target(id, user)?;
        Ok(self.push_overlay(id.clone(), OverlayOp::Remove, now))
    }

    pub fn op_acked(&mut self, op: OpId, revision: Revision) {
        let reflected = self.revision.is_some_and(|current| current >= revision);
        if reflected {
            self.overlays.retain(|o| o.op != op);
        } else if let Some(overlay) = self.overlays.iter_mut().find(|o| o.op == op) {
            overlay.ack = Ack::At(revision);
        }
    }

    /// The write failed: drop the overlay so the message reverts. Returns
    /// the affected message id.
    pub fn op_failed(&mut self, op: OpId) -> Option<MessageId> {
        let pos = self.overlays.iter().position(|o| o.op == op)?;
        Some(self.overlays.remove(pos).message_id)
    }

    /// The target vanished at the store. A removal is complete once the
    /// message leaves the snapshot; a patch has nothing left to apply to.
    pub fn op_not_found(&mut self, op: OpId) {
        let Some(pos) = self.overlays.iter().position(|o| o.op == op) else {
            return;
        };
        match self.overlays[pos].kind {
            OverlayOp::Remove => self.overlays[pos].ack = Ack::Gone,
            OverlayOp::Patch(_) => {
                self.overlays.remove(pos);
            }
        }
    }

    // ----- view ----------------------------------------------------------

    pub fn view(&self) -> TimelineView {
        let mut seen: HashSet<&MessageId> = HashSet::new();
        let mut rendered: Vec<Message> = Vec::with_capacity(self.confirmed.len());
        for message in &self.confirmed {
            if !seen.insert(&message.id) {
                continue;
            }
            if let Some(m) = self.rendered(&message.id) {
                rendered.push(m);
            }
        }

        let pinned = PinnedIndex::build(&rendered, self.settings.pinned_cap);

        let mut entries: Vec<TimelineEntry> = rendered
            .into_iter()
            .map(|message| TimelineEntry {
                timestamp: message.created_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
                message,
                delivery: Delivery::Confirmed,
            })
            .collect();
        entries.extend(self.echoes.iter().map(|echo| TimelineEntry {
            message: echo.message.clone(),
            delivery: if echo.failed {
                Delivery::Failed
            } else {
                Delivery::Pending
            },
            timestamp: echo.local_created,
        }));
        entries.sort_by_key(|e| e.timestamp);

        TimelineView {
            conversation_id: self.conversation_id.clone(),
            state: self.state,
            entries,
            pinned: pinned.ids().to_vec(),
            pending: self.in_flight(),
            revision: self.revision,
            error: self.last_error.clone(),
        }
    }
}
