#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{oneshot, watch};

use murmur_client::{ChatClient, Collaborators, SyncConfig, TimelineEvent, TimelineView};
use murmur_shared::{
    ConversationId, MessageId, MessagePatch, OutgoingMessage, Principal, Revision, StaticIdentity,
};
use murmur_store::{
    LocalStore, MessageStore, ObjectStore, PresenceBus, Receipt, Result, SnapshotStream,
    StoreError,
};

/// [`LocalStore`] with switchable faults.
pub struct ScriptedStore {
    pub inner: LocalStore,
    fail_appends: AtomicBool,
    hang_appends: watch::Sender<bool>,
    failing_subscribes: AtomicUsize,
    appends: AtomicUsize,
    breakers: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalStore::open_in_memory().unwrap(),
            fail_appends: AtomicBool::new(false),
            hang_appends: watch::Sender::new(false),
            failing_subscribes: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
            breakers: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_appends(&self, on: bool) {
        self.fail_appends.store(on, Ordering::SeqCst);
    }

    /// Appends wait while this is on and resume once it is turned off.
    pub fn hang_appends(&self, on: bool) {
        self.hang_appends.send_replace(on);
    }

    /// The next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Number of append calls seen, including failed ones.
    pub fn append_calls(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Push an error into every open snapshot stream.
    pub fn break_subscriptions(&self) {
        for breaker in self.breakers.lock().unwrap().drain(..) {
            let _ = breaker.send(());
        }
    }
}

#[async_trait]
impl MessageStore for ScriptedStore {
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<SnapshotStream> {
        let remaining = self.failing_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("store offline".into()));
        }

        let snapshots = self.inner.subscribe(conversation_id, limit).await?;
        let (tx, rx) = oneshot::channel();
        self.breakers.lock().unwrap().push(tx);
        let broken = futures::stream::once(async move {
            let _ = rx.await;
            Err(StoreError::Unavailable("connection reset".into()))
        });

        Ok(futures::stream::select(snapshots, broken).boxed())
    }

    async fn append(&self, message: OutgoingMessage) -> Result<Receipt> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        let mut hang = self.hang_appends.subscribe();
        let _ = hang.wait_for(|on| !*on).await;
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        self.inner.append(message).await
    }

    async fn patch(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> Result<Revision> {
        self.inner.patch(conversation_id, message_id, patch).await
    }

    async fn remove(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Revision> {
        self.inner.remove(conversation_id, message_id).await
    }
}

/// Object store that hands back a fixed URL.
pub struct FakeObjects;

#[async_trait]
impl ObjectStore for FakeObjects {
    async fn upload(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<String> {
        if bytes.is_empty() {
            return Err(StoreError::InvalidObject("empty upload".into()));
        }
        Ok(format!("mem://objects/{suggested_name}"))
    }
}

/// Settings that keep the tests fast.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        echo_sweep_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

pub fn collaborators(
    principal: Principal,
    store: Arc<ScriptedStore>,
    bus: Arc<PresenceBus>,
) -> Collaborators {
    Collaborators {
        identity: Arc::new(StaticIdentity::signed_in(principal)),
        pins: Arc::new(store.inner.clone()),
        store,
        presence: bus,
        objects: Arc::new(FakeObjects),
    }
}

pub fn client(
    principal: Principal,
    store: Arc<ScriptedStore>,
    config: SyncConfig,
) -> (ChatClient, tokio::sync::mpsc::Receiver<TimelineEvent>) {
    let bus = Arc::new(PresenceBus::default());
    ChatClient::new(config, collaborators(principal, store, bus)).unwrap()
}

pub async fn wait_for(
    rx: &mut watch::Receiver<TimelineView>,
    pred: impl FnMut(&TimelineView) -> bool,
) -> TimelineView {
    let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("condition reached in time")
        .expect("synchronizer alive");
    view.clone()
}

pub async fn next_event(
    events: &mut tokio::sync::mpsc::Receiver<TimelineEvent>,
    mut pred: impl FnMut(&TimelineEvent) -> bool,
) -> TimelineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived in time")
}
