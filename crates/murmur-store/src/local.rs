//! SQLite-backed [`MessageStore`] with in-process snapshot fan-out.
//!
//! Every write bumps a store-wide revision and notifies a broadcast channel
//! with the conversation it touched. Each subscription runs a small tokio
//! task that re-queries its conversation on every relevant notification and
//! pushes the full snapshot to the subscriber.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::{
    ConversationId, Message, MessageId, MessagePatch, OutgoingMessage, ReactionSet, Revision,
    Snapshot, UserId,
};

use crate::contract::{receiver_stream, MessageStore, PinStore, Receipt, SnapshotStream};
use crate::database::Database;
use crate::error::{Result, StoreError};

const CHANGE_BUFFER: usize = 256;
const SNAPSHOT_BUFFER: usize = 16;

struct Shared {
    db: Mutex<Database>,
    /// Only written while `db` is locked, so a snapshot read under the same
    /// lock sees a revision consistent with its rows.
    revision: AtomicU64,
    last_created_micros: AtomicI64,
}

/// Local durable store. Cheap to clone; clones share the same database.
#[derive(Clone)]
pub struct LocalStore {
    shared: Arc<Shared>,
    changes: broadcast::Sender<ConversationId>,
}

impl LocalStore {
    pub fn new(db: Database) -> Result<Self> {
        let last = db.latest_created_micros()?.unwrap_or(0);
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        info!(path = ?db.path(), "Local message store ready");

        Ok(Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                revision: AtomicU64::new(0),
                last_created_micros: AtomicI64::new(last),
            }),
            changes,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Database::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.shared
            .db
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {e}")))
    }

    /// Current state of a conversation.
    pub fn snapshot(&self, conversation_id: &ConversationId, limit: usize) -> Result<Snapshot> {
        let db = self.lock()?;
        let messages = db.get_recent_messages(conversation_id, limit)?;
        Ok(Snapshot {
            conversation_id: conversation_id.clone(),
            revision: self.shared.revision.load(Ordering::SeqCst),
            messages,
        })
    }

    // caller holds the db lock
    fn bump_revision(&self) -> Revision {
        self.shared.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    // caller holds the db lock
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let last = self.shared.last_created_micros.load(Ordering::SeqCst);
        let next = now.max(last + 1);
        self.shared.last_created_micros.store(next, Ordering::SeqCst);
        DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now)
    }

    fn notify(&self, conversation_id: &ConversationId) {
        // No receivers just means nobody is subscribed right now.
        let _ = self.changes.send(conversation_id.clone());
    }
}

#[async_trait]
impl MessageStore for LocalStore {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<SnapshotStream> {
        // Subscribe before reading so no write can slip between the two.
        let mut changes = self.changes.subscribe();
        let initial = self.snapshot(conversation_id, limit)?;

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let store = self.clone();
        let conversation_id = conversation_id.clone();

        debug!(conversation = %conversation_id, limit, "Snapshot subscription opened");

        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }

            loop {
                let changed = tokio::select! {
                    _ = tx.closed() => break,
                    changed = changes.recv() => changed,
                };

                match changed {
                    Ok(id) if id != conversation_id => continue,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            conversation = %conversation_id,
                            skipped,
                            "Change notifications lagged, resyncing"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                let snapshot = store.snapshot(&conversation_id, limit);
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }

            debug!(conversation = %conversation_id, "Snapshot subscription closed");
        });

        Ok(receiver_stream(rx))
    }

    async fn append(&self, message: OutgoingMessage) -> Result<Receipt> {
        let conversation_id = message.conversation_id.clone();

        let receipt = {
            let db = self.lock()?;

            if let Some(existing) =
                db.find_by_client_token(&conversation_id, &message.client_token)?
            {
                debug!(
                    conversation = %conversation_id,
                    token = %message.client_token,
                    id = %existing,
                    "Duplicate append, returning existing record"
                );
                return Ok(Receipt {
                    id: existing,
                    revision: self.shared.revision.load(Ordering::SeqCst),
                });
            }

            let record = Message {
                id: MessageId::new(Uuid::new_v4().to_string()),
                conversation_id: conversation_id.clone(),
                sender: message.sender,
                content: message.content,
                created_at: Some(self.next_timestamp()),
                edited: false,
                pinned: false,
                pinned_at: None,
                reply_to: message.reply_to,
                reactions: ReactionSet::new(),
                mentions: message.mentions,
                client_token: Some(message.client_token),
            };
            db.insert_message(&record)?;

            Receipt {
                id: record.id,
                revision: self.bump_revision(),
            }
        };

        debug!(conversation = %conversation_id, id = %receipt.id, revision = receipt.revision, "Message appended");
        self.notify(&conversation_id);
        Ok(receipt)
    }

    async fn patch(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> Result<Revision> {
        let revision = {
            let db = self.lock()?;
            db.apply_patch(conversation_id, message_id, &patch, Utc::now())?;
            self.bump_revision()
        };

        debug!(conversation = %conversation_id, id = %message_id, ?patch, revision, "Message patched");
        self.notify(conversation_id);
        Ok(revision)
    }

    async fn remove(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Revision> {
        let revision = {
            let db = self.lock()?;
            if !db.delete_message(conversation_id, message_id)? {
                return Err(StoreError::NotFound);
            }
            self.bump_revision()
        };

        debug!(conversation = %conversation_id, id = %message_id, revision, "Message removed");
        self.notify(conversation_id);
        Ok(revision)
    }
}

impl PinStore for LocalStore {
    fn load_pins(&self, user: &UserId) -> Result<Vec<ConversationId>> {
        self.lock()?.list_pinned_sessions(user)
    }

    fn set_pinned(
        &self,
        user: &UserId,
        conversation_id: &ConversationId,
        pinned: bool,
    ) -> Result<()> {
        let db = self.lock()?;
        if pinned {
            db.pin_session(user, conversation_id)
        } else {
            db.unpin_session(user, conversation_id).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use murmur_shared::{Author, ClientToken, MessageContent};

    use super::*;

    fn outgoing(conversation: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            conversation_id: ConversationId::new(conversation),
            sender: Author {
                id: UserId::new("sam"),
                display_name: "Sam".into(),
                avatar_ref: None,
            },
            content: MessageContent::text(body),
            reply_to: None,
            mentions: Vec::new(),
            client_token: ClientToken::new(),
        }
    }

    async fn next(stream: &mut SnapshotStream) -> Snapshot {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("snapshot in time")
            .expect("stream open")
            .expect("snapshot ok")
    }

    #[tokio::test]
    async fn test_subscribe_receives_initial_then_updates() {
        let store = LocalStore::open_in_memory().unwrap();
        let general = ConversationId::new("general");
        store.append(outgoing("general", "first")).await.unwrap();

        let mut stream = store.subscribe(&general, 150).await.unwrap();
        let initial = next(&mut stream).await;
        assert_eq!(initial.messages.len(), 1);

        let receipt = store.append(outgoing("general", "second")).await.unwrap();
        let update = next(&mut stream).await;
        assert_eq!(update.messages.len(), 2);
        assert_eq!(update.messages[1].id, receipt.id);
        assert!(update.revision >= receipt.revision);
    }

    #[tokio::test]
    async fn test_other_conversations_do_not_wake_subscriber() {
        let store = LocalStore::open_in_memory().unwrap();
        let general = ConversationId::new("general");

        let mut stream = store.subscribe(&general, 150).await.unwrap();
        next(&mut stream).await;

        store.append(outgoing("random", "elsewhere")).await.unwrap();
        store.append(outgoing("general", "here")).await.unwrap();

        let update = next(&mut stream).await;
        assert_eq!(update.messages.len(), 1);
        assert_eq!(update.messages[0].content.body(), Some("here"));
    }

    #[tokio::test]
    async fn test_append_is_idempotent_per_token() {
        let store = LocalStore::open_in_memory().unwrap();
        let msg = outgoing("general", "once");

        let first = store.append(msg.clone()).await.unwrap();
        let second = store.append(msg).await.unwrap();
        assert_eq!(first.id, second.id);

        let snapshot = store.snapshot(&ConversationId::new("general"), 150).unwrap();
        assert_eq!(snapshot.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let store = LocalStore::open_in_memory().unwrap();
        for i in 0..20 {
            store.append(outgoing("general", &format!("m{i}"))).await.unwrap();
        }
        let snapshot = store.snapshot(&ConversationId::new("general"), 150).unwrap();
        let stamps: Vec<_> = snapshot.messages.iter().map(|m| m.created_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_concurrent_reaction_patches_converge() {
        let store = LocalStore::open_in_memory().unwrap();
        let general = ConversationId::new("general");
        let receipt = store.append(outgoing("general", "react to me")).await.unwrap();

        let (a, b) = (UserId::new("sam"), UserId::new("lee"));
        let patch_a = store.patch(
            &general,
            &receipt.id,
            MessagePatch::Reaction {
                emoji: "👍".into(),
                user: a.clone(),
                present: true,
            },
        );
        let patch_b = store.patch(
            &general,
            &receipt.id,
            MessagePatch::Reaction {
                emoji: "👍".into(),
                user: b.clone(),
                present: true,
            },
        );
        let (ra, rb) = tokio::join!(patch_a, patch_b);
        assert_ne!(ra.unwrap(), rb.unwrap());

        let snapshot = store.snapshot(&general, 150).unwrap();
        assert_eq!(snapshot.messages[0].reactions.count("👍"), 2);
    }

    #[tokio::test]
    async fn test_patch_and_remove_missing_are_not_found() {
        let store = LocalStore::open_in_memory().unwrap();
        let general = ConversationId::new("general");
        let missing = MessageId::new("gone");

        assert!(store
            .patch(&general, &missing, MessagePatch::Pin { pinned: true })
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.remove(&general, &missing).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_pin_store_round_trip() {
        let store = LocalStore::open_in_memory().unwrap();
        let sam = UserId::new("sam");
        let general = ConversationId::new("general");

        store.set_pinned(&sam, &general, true).unwrap();
        assert_eq!(store.load_pins(&sam).unwrap(), vec![general.clone()]);
        store.set_pinned(&sam, &general, false).unwrap();
        assert!(store.load_pins(&sam).unwrap().is_empty());
    }
}
