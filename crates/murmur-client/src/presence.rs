//! Typing presence for one open conversation.
//!
//! Local keystrokes publish `is_typing=true` at once and `false` after a
//! quiet period. Remote records are kept per user and dropped from the
//! summary once they stop being refreshed, even without an explicit `false`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use murmur_shared::{ConversationId, PresenceFrame, TypingRecord, UserId};
use murmur_store::PresenceTransport;

/// "X is typing…" line for the given typists, in the order given.
pub fn typing_summary<S: AsRef<str>>(names: &[S]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing…", one.as_ref())),
        [a, b] => Some(format!("{} and {} are typing…", a.as_ref(), b.as_ref())),
        [a, b, rest @ ..] => Some(format!(
            "{}, {}, and {} others are typing…",
            a.as_ref(),
            b.as_ref(),
            rest.len()
        )),
    }
}

#[derive(Debug, Clone)]
struct RemoteTypist {
    display_name: String,
    started: Instant,
    refreshed: Instant,
}

#[derive(Default)]
struct TrackerState {
    local_typing: bool,
    /// When `is_typing=true` last went out. Refreshed well inside the
    /// receivers' stale window while typing continues.
    last_published: Option<Instant>,
    /// Bumped on every keystroke so a superseded debounce timer does nothing.
    generation: u64,
    timers: HashMap<(ConversationId, UserId), JoinHandle<()>>,
    remote: HashMap<UserId, RemoteTypist>,
}

struct Inner {
    conversation_id: ConversationId,
    user_id: UserId,
    display_name: String,
    transport: Arc<dyn PresenceTransport>,
    debounce: Duration,
    stale_after: Duration,
    state: Mutex<TrackerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer_key(&self) -> (ConversationId, UserId) {
        (self.conversation_id.clone(), self.user_id.clone())
    }

    fn publish_typing(&self, is_typing: bool) {
        trace!(conversation = %self.conversation_id, is_typing, "Publishing typing state");
        self.transport.publish(PresenceFrame::Typing(TypingRecord {
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            is_typing,
            last_activity_at: Utc::now(),
        }));
    }

    fn apply_frame(&self, frame: PresenceFrame) {
        match frame {
            PresenceFrame::Typing(record) => self.apply_record(record),
            PresenceFrame::Left {
                conversation_id,
                user_id,
            } => {
                if conversation_id == self.conversation_id {
                    self.lock().remote.remove(&user_id);
                }
            }
        }
    }

    fn apply_record(&self, record: TypingRecord) {
        if record.conversation_id != self.conversation_id || record.user_id == self.user_id {
            return;
        }

        let mut state = self.lock();
        if !record.is_typing {
            state.remote.remove(&record.user_id);
            return;
        }

        let age = Utc::now()
            .signed_duration_since(record.last_activity_at)
            .to_std()
            .unwrap_or_default();
        if age >= self.stale_after {
            debug!(user = %record.user_id, ?age, "Ignoring stale typing record");
            state.remote.remove(&record.user_id);
            return;
        }

        let now = Instant::now();
        state
            .remote
            .entry(record.user_id)
            .and_modify(|typist| {
                typist.display_name = record.display_name.clone();
                typist.refreshed = now;
            })
            .or_insert(RemoteTypist {
                display_name: record.display_name,
                started: now,
                refreshed: now,
            });
    }
}

/// Typing state of one conversation. Dropping or closing the tracker stops
/// every timer it owns.
pub struct TypingTracker {
    inner: Arc<Inner>,
    listener: Option<JoinHandle<()>>,
}

impl TypingTracker {
    pub fn new(
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: impl Into<String>,
        transport: Arc<dyn PresenceTransport>,
        debounce: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conversation_id,
                user_id,
                display_name: display_name.into(),
                transport,
                debounce,
                stale_after,
                state: Mutex::new(TrackerState::default()),
            }),
            listener: None,
        }
    }

    /// Start consuming remote frames from the transport.
    pub fn start(&mut self) {
        if self.listener.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut frames = inner.transport.subscribe(&inner.conversation_id);
        self.listener = Some(tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                inner.apply_frame(frame);
            }
            debug!(conversation = %inner.conversation_id, "Presence stream ended");
        }));
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation_id
    }

    /// Feed the current draft text. Empty text stops typing; anything else
    /// marks the user typing and restarts the debounce timer.
    pub fn on_local_input_change(&self, text: &str) {
        if text.is_empty() {
            self.stop();
            return;
        }

        let inner = &self.inner;
        let mut state = inner.lock();
        let now = Instant::now();

        let refresh_due = state
            .last_published
            .map_or(true, |at| now.saturating_duration_since(at) >= inner.stale_after / 2);
        if !state.local_typing || refresh_due {
            state.local_typing = true;
            state.last_published = Some(now);
            inner.publish_typing(true);
        }

        state.generation += 1;
        let generation = state.generation;
        let key = inner.timer_key();
        if let Some(previous) = state.timers.remove(&key) {
            previous.abort();
        }

        let timer_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timer_inner.debounce).await;

            let mut state = timer_inner.lock();
            if state.generation != generation || !state.local_typing {
                return;
            }
            state.local_typing = false;
            state.timers.remove(&timer_inner.timer_key());
            timer_inner.publish_typing(false);
        });
        state.timers.insert(key, handle);
    }

    /// Explicit stop, e.g. after sending or clearing the input.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut state = inner.lock();
        state.generation += 1;
        if let Some(timer) = state.timers.remove(&inner.timer_key()) {
            timer.abort();
        }
        if state.local_typing {
            state.local_typing = false;
            inner.publish_typing(false);
        }
    }

    pub fn is_local_typing(&self) -> bool {
        self.inner.lock().local_typing
    }

    /// Merge a remote typing record.
    pub fn on_remote_update(&self, record: TypingRecord) {
        self.inner.apply_record(record);
    }

    /// Display names of remote users currently typing, earliest first.
    /// Records not refreshed within the stale window are left out.
    pub fn typing_users(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.inner.lock();

        let mut fresh: Vec<&RemoteTypist> = state
            .remote
            .values()
            .filter(|t| now.saturating_duration_since(t.refreshed) < self.inner.stale_after)
            .collect();
        fresh.sort_by(|a, b| {
            a.started
                .cmp(&b.started)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        fresh.into_iter().map(|t| t.display_name.clone()).collect()
    }

    pub fn summary(&self) -> Option<String> {
        typing_summary(&self.typing_users())
    }

    /// Leave the conversation: announce it, cancel every timer and stop
    /// listening.
    pub fn close(&mut self) {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            state.generation += 1;
            for (_, timer) in state.timers.drain() {
                timer.abort();
            }
            state.local_typing = false;
            state.remote.clear();
        }

        inner.transport.publish(PresenceFrame::Left {
            conversation_id: inner.conversation_id.clone(),
            user_id: inner.user_id.clone(),
        });

        if let Some(listener) = self.listener.take() {
            listener.abort();
        }

        debug!(conversation = %inner.conversation_id, "Typing tracker closed");
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        for (_, timer) in self.inner.lock().timers.drain() {
            timer.abort();
        }
    }
}
