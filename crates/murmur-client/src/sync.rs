//! Per-conversation synchronizer task.
//!
//! One tokio task owns the [`Timeline`] of the open conversation. External
//! code talks to it through a [`TimelineHandle`]: commands go in over an
//! mpsc channel, the rendered view comes out over a `watch` channel and
//! one-off events over the shared event channel.
//!
//! Store writes run in spawned tasks, one at a time and in the order they
//! were issued, and report back over an internal completion channel. The
//! task loop never awaits the store directly.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use murmur_shared::{
    ClientToken, ConversationId, MessageId, MessagePatch, OutgoingMessage, Revision, Snapshot,
    UserId,
};
use murmur_store::{MessageStore, Receipt, SnapshotStream, StoreError};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{emit_event, TimelineEvent};
use crate::timeline::{OpId, Timeline, TimelineSettings, TimelineState, TimelineView};

const COMMAND_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Command / completion types
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent *into* the synchronizer task.
enum Command {
    Send {
        outgoing: OutgoingMessage,
        reply: Reply<MessageId>,
    },
    Edit {
        id: MessageId,
        user: UserId,
        body: String,
        reply: Reply<()>,
    },
    ToggleReaction {
        id: MessageId,
        emoji: String,
        user: UserId,
        reply: Reply<bool>,
    },
    TogglePin {
        id: MessageId,
        reply: Reply<bool>,
    },
    Remove {
        id: MessageId,
        user: UserId,
        reply: Reply<()>,
    },
    Retry {
        id: MessageId,
        reply: Reply<()>,
    },
    Discard {
        id: MessageId,
        reply: Reply<()>,
    },
    Shutdown,
}

/// Queued store write.
enum Write {
    Append {
        outgoing: OutgoingMessage,
        attempt: u32,
    },
    Patch {
        op: OpId,
        id: MessageId,
        patch: MessagePatch,
    },
    Remove {
        op: OpId,
        id: MessageId,
    },
}

/// Results reported back *to* the synchronizer task.
enum Completion {
    Subscribed(std::result::Result<SnapshotStream, StoreError>),
    Appended {
        token: ClientToken,
        attempt: u32,
        result: std::result::Result<Receipt, StoreError>,
    },
    Written {
        op: OpId,
        id: MessageId,
        result: std::result::Result<Revision, StoreError>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner's side of a running synchronizer. Dropping the handle stops the
/// task; [`TimelineHandle::close`] stops it and waits for it.
pub struct TimelineHandle {
    conversation_id: ConversationId,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<TimelineView>,
    task: Option<JoinHandle<()>>,
}

impl TimelineHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Current rendered timeline.
    pub fn view(&self) -> TimelineView {
        self.view.borrow().clone()
    }

    /// Receiver that is notified on every timeline change.
    pub fn watch(&self) -> watch::Receiver<TimelineView> {
        self.view.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Queue a message. Returns the local id of its echo as soon as the
    /// echo is visible; the store write completes in the background.
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<MessageId> {
        self.request(|reply| Command::Send { outgoing, reply }).await
    }

    pub async fn edit(&self, id: MessageId, user: UserId, body: String) -> Result<()> {
        self.request(|reply| Command::Edit {
            id,
            user,
            body,
            reply,
        })
        .await
    }

    /// Returns whether the reaction is now present.
    pub async fn toggle_reaction(&self, id: MessageId, emoji: String, user: UserId) -> Result<bool> {
        self.request(|reply| Command::ToggleReaction {
            id,
            emoji,
            user,
            reply,
        })
        .await
    }

    /// Returns whether the message is now pinned.
    pub async fn toggle_pin(&self, id: MessageId) -> Result<bool> {
        self.request(|reply| Command::TogglePin { id, reply }).await
    }

    pub async fn remove(&self, id: MessageId, user: UserId) -> Result<()> {
        self.request(|reply| Command::Remove { id, user, reply }).await
    }

    pub async fn retry(&self, id: MessageId) -> Result<()> {
        self.request(|reply| Command::Retry { id, reply }).await
    }

    pub async fn discard(&self, id: MessageId) -> Result<()> {
        self.request(|reply| Command::Discard { id, reply }).await
    }

    /// Stop the task and wait until it has torn everything down.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(conversation = %self.conversation_id, error = %e, "Synchronizer task failed");
                }
            }
        }
    }
}

impl Drop for TimelineHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start synchronizing `conversation_id`. Subscribes right away.
pub fn spawn_timeline(
    conversation_id: ConversationId,
    local_user: UserId,
    store: Arc<dyn MessageStore>,
    config: &SyncConfig,
    events: mpsc::Sender<TimelineEvent>,
) -> TimelineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let mut timeline = Timeline::new(
        conversation_id.clone(),
        local_user,
        TimelineSettings::from(config),
    );
    timeline.begin_loading();
    let (view_tx, view_rx) = watch::channel(timeline.view());

    let synchronizer = Synchronizer {
        last_state: timeline.state(),
        timeline,
        store,
        config: config.clone(),
        view_tx,
        events,
        done_tx,
        writes: VecDeque::new(),
        writing: false,
        attempt: 0,
    };

    info!(conversation = %conversation_id, "Opening conversation");
    emit_event(
        &synchronizer.events,
        TimelineEvent::StateChanged {
            conversation_id: conversation_id.clone(),
            state: TimelineState::Loading,
        },
    );

    let task = tokio::spawn(synchronizer.run(cmd_rx, done_rx));

    TimelineHandle {
        conversation_id,
        commands: cmd_tx,
        view: view_rx,
        task: Some(task),
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct Synchronizer {
    timeline: Timeline,
    store: Arc<dyn MessageStore>,
    config: SyncConfig,
    view_tx: watch::Sender<TimelineView>,
    events: mpsc::Sender<TimelineEvent>,
    done_tx: mpsc::UnboundedSender<Completion>,
    writes: VecDeque<Write>,
    writing: bool,
    /// Consecutive subscription failures.
    attempt: u32,
    last_state: TimelineState,
}

async fn next_snapshot(
    stream: &mut Option<SnapshotStream>,
) -> Option<std::result::Result<Snapshot, StoreError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn within<T>(
    deadline: Duration,
    call: impl std::future::Future<Output = std::result::Result<T, StoreError>>,
) -> std::result::Result<T, StoreError> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "no answer within {deadline:?}"
        ))),
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

impl Synchronizer {
    fn conversation_id(&self) -> ConversationId {
        self.timeline.conversation_id().clone()
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut done: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut snapshots: Option<SnapshotStream> = None;
        let mut reconnect: Option<Pin<Box<Sleep>>> = None;
        let mut sweep = tokio::time::interval(self.config.echo_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.subscribe();

        loop {
            tokio::select! {
                // --- Requests from the handle ---
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }

                // --- Snapshot stream ---
                item = next_snapshot(&mut snapshots) => {
                    match item {
                        Some(Ok(snapshot)) => self.on_snapshot(snapshot),
                        Some(Err(e)) => {
                            snapshots = None;
                            reconnect = Some(self.on_subscription_error(e.to_string()));
                        }
                        None => {
                            snapshots = None;
                            reconnect = Some(self.on_subscription_error("snapshot stream ended".into()));
                        }
                    }
                }

                // --- Store write results ---
                Some(completion) = done.recv() => {
                    match completion {
                        Completion::Subscribed(Ok(stream)) => {
                            debug!(conversation = %self.conversation_id(), "Subscribed");
                            snapshots = Some(stream);
                        }
                        Completion::Subscribed(Err(e)) => {
                            reconnect = Some(self.on_subscription_error(e.to_string()));
                        }
                        other => self.on_write_done(other),
                    }
                }

                // --- Echo expiry ---
                _ = sweep.tick() => self.expire_echoes(),

                // --- Resubscribe after an error ---
                _ = reconnect_due(&mut reconnect) => {
                    reconnect = None;
                    self.subscribe();
                }
            }
        }

        let dropped = self.timeline.close();
        self.publish();
        info!(
            conversation = %self.conversation_id(),
            dropped_echoes = dropped,
            "Conversation closed"
        );
    }

    fn subscribe(&self) {
        let store = Arc::clone(&self.store);
        let done = self.done_tx.clone();
        let conversation_id = self.conversation_id();
        let limit = self.config.timeline_limit;

        tokio::spawn(async move {
            let result = store.subscribe(&conversation_id, limit).await;
            let _ = done.send(Completion::Subscribed(result));
        });
    }

    fn publish(&mut self) {
        let view = self.timeline.view();
        let state = view.state;
        self.view_tx.send_replace(view);

        if state != self.last_state {
            debug!(conversation = %self.conversation_id(), from = %self.last_state, to = %state, "Timeline state changed");
            self.last_state = state;
            emit_event(
                &self.events,
                TimelineEvent::StateChanged {
                    conversation_id: self.conversation_id(),
                    state,
                },
            );
        }
    }

    fn on_snapshot(&mut self, snapshot: Snapshot) {
        let outcome = self.timeline.apply_snapshot(snapshot);
        if outcome.state_changed && self.attempt > 0 {
            info!(conversation = %self.conversation_id(), attempts = self.attempt, "Subscription recovered");
        }
        self.attempt = 0;
        self.publish();
    }

    /// Enter `Error` and return the timer for the next resubscribe.
    fn on_subscription_error(&mut self, error: String) -> Pin<Box<Sleep>> {
        let delay = self.backoff();
        self.attempt = self.attempt.saturating_add(1);

        warn!(
            conversation = %self.conversation_id(),
            error = %error,
            attempt = self.attempt,
            retry_in = ?delay,
            "Subscription dropped"
        );

        self.timeline.set_error(error.clone());
        self.publish();
        emit_event(
            &self.events,
            TimelineEvent::SubscriptionError {
                conversation_id: self.conversation_id(),
                error,
                retry_in: delay,
            },
        );

        Box::pin(tokio::time::sleep(delay))
    }

    /// Exponential backoff with up to 25% jitter, capped.
    fn backoff(&self) -> Duration {
        let base = self.config.reconnect_base;
        let max = self.config.reconnect_max;
        let exp = base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(max);
        let jitter_ms = (capped.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (capped + jitter).min(max)
    }

    fn expire_echoes(&mut self) {
        let expired = self.timeline.expire(Instant::now());
        if expired.is_empty() {
            return;
        }

        for message_id in expired {
            warn!(conversation = %self.conversation_id(), message = %message_id, "Echo timed out");
            emit_event(
                &self.events,
                TimelineEvent::EchoTimedOut {
                    conversation_id: self.conversation_id(),
                    message_id,
                },
            );
        }
        self.publish();
    }

    // ----- commands ------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        let now = Utc::now();
        match cmd {
            Command::Send { outgoing, reply } => {
                let result = self.timeline.push_echo(&outgoing, now, Instant::now());
                match &result {
                    Ok(local_id) => {
                        debug!(conversation = %self.conversation_id(), echo = %local_id, "Echo queued");
                        self.enqueue(Write::Append {
                            outgoing,
                            attempt: 0,
                        });
                    }
                    Err(SyncError::SendBacklog { pending }) => {
                        warn!(conversation = %self.conversation_id(), pending, "Send backlog");
                        emit_event(
                            &self.events,
                            TimelineEvent::SendBacklog {
                                conversation_id: self.conversation_id(),
                                pending: *pending,
                            },
                        );
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result);
            }
            Command::Edit {
                id,
                user,
                body,
                reply,
            } => {
                let result = self
                    .timeline
                    .edit(&id, &user, body, now)
                    .map(|(op, patch)| self.enqueue(Write::Patch { op, id, patch }));
                let _ = reply.send(result);
            }
            Command::ToggleReaction {
                id,
                emoji,
                user,
                reply,
            } => {
                let result = self
                    .timeline
                    .toggle_reaction(&id, &emoji, &user, now)
                    .map(|(op, patch)| {
                        let present = matches!(patch, MessagePatch::Reaction { present: true, .. });
                        self.enqueue(Write::Patch { op, id, patch });
                        present
                    });
                let _ = reply.send(result);
            }
            Command::TogglePin { id, reply } => {
                let result = self.timeline.toggle_pin(&id, now).map(|(op, patch)| {
                    let pinned = matches!(patch, MessagePatch::Pin { pinned: true });
                    self.enqueue(Write::Patch { op, id, patch });
                    pinned
                });
                let _ = reply.send(result);
            }
            Command::Remove { id, user, reply } => {
                let result = self
                    .timeline
                    .remove(&id, &user, now)
                    .map(|op| self.enqueue(Write::Remove { op, id }));
                let _ = reply.send(result);
            }
            Command::Retry { id, reply } => {
                let result = self
                    .timeline
                    .retry(&id, Instant::now())
                    .map(|(outgoing, attempt)| self.enqueue(Write::Append { outgoing, attempt }));
                let _ = reply.send(result);
            }
            Command::Discard { id, reply } => {
                let result = self.timeline.discard(&id).map(|_| ());
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
        self.publish();
    }

    // ----- writes --------------------------------------------------------

    fn enqueue(&mut self, write: Write) {
        self.writes.push_back(write);
        self.pump();
    }

    /// Start the next queued write unless one is already running.
    fn pump(&mut self) {
        if self.writing {
            return;
        }
        let Some(write) = self.writes.pop_front() else {
            return;
        };
        self.writing = true;

        let store = Arc::clone(&self.store);
        let done = self.done_tx.clone();
        let conversation_id = self.conversation_id();
        let deadline = self.config.write_timeout;

        tokio::spawn(async move {
            let completion = match write {
                Write::Append { outgoing, attempt } => {
                    let token = outgoing.client_token;
                    Completion::Appended {
                        token,
                        attempt,
                        result: within(deadline, store.append(outgoing)).await,
                    }
                }
                Write::Patch { op, id, patch } => {
                    let result = within(deadline, store.patch(&conversation_id, &id, patch)).await;
                    Completion::Written { op, id, result }
                }
                Write::Remove { op, id } => {
                    let result = within(deadline, store.remove(&conversation_id, &id)).await;
                    Completion::Written { op, id, result }
                }
            };
            let _ = done.send(completion);
        });
    }

    fn on_write_done(&mut self, completion: Completion) {
        self.writing = false;
        let conversation_id = self.conversation_id();

        match completion {
            Completion::Appended {
                token,
                result: Ok(receipt),
                ..
            } => {
                debug!(conversation = %conversation_id, id = %receipt.id, revision = receipt.revision, "Send confirmed");
                self.timeline.echo_acked(token, &receipt);
            }
            Completion::Appended {
                token,
                attempt,
                result: Err(e),
            } => {
                if let Some(echo) = self.timeline.echo_failed(token, attempt) {
                    warn!(conversation = %conversation_id, error = %e, "Send failed, restoring draft");
                    let text = echo
                        .content
                        .body()
                        .map(str::to_string)
                        .unwrap_or_default();
                    emit_event(
                        &self.events,
                        TimelineEvent::DraftRestored {
                            conversation_id,
                            text,
                            error: e.to_string(),
                        },
                    );
                } else {
                    debug!(conversation = %conversation_id, error = %e, "Stale append failure ignored");
                }
            }
            Completion::Written {
                op,
                result: Ok(revision),
                ..
            } => {
                self.timeline.op_acked(op, revision);
            }
            Completion::Written {
                op,
                id,
                result: Err(e),
            } => {
                if e.is_not_found() {
                    debug!(conversation = %conversation_id, message = %id, "Write target already gone");
                    self.timeline.op_not_found(op);
                } else {
                    warn!(conversation = %conversation_id, message = %id, error = %e, "Write failed, reverting");
                    self.timeline.op_failed(op);
                    emit_event(
                        &self.events,
                        TimelineEvent::WriteFailed {
                            conversation_id,
                            message_id: id,
                            error: e.to_string(),
                        },
                    );
                }
            }
            Completion::Subscribed(_) => {}
        }

        self.publish();
        self.pump();
    }
}
