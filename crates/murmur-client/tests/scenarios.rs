//! End-to-end behavior of the sync core through the client facade.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use murmur_client::{ChatClient, Delivery, SyncConfig, SyncError, TimelineEvent, TimelineState};
use murmur_shared::mentions::extract_mentions;
use murmur_shared::{ConversationId, Principal, ValidationError};
use murmur_store::PresenceBus;

use support::{client, collaborators, next_event, test_config, wait_for, ScriptedStore};

fn sam() -> Principal {
    Principal::new("sam", "Sam")
}

fn general() -> ConversationId {
    ConversationId::new("general")
}

#[tokio::test]
async fn test_transport_failure_restores_draft() {
    let store = ScriptedStore::new();
    let (mut chat, mut events) = client(sam(), store.clone(), test_config());
    let mut view = chat.open(general()).await.unwrap();
    wait_for(&mut view, |v| v.state == TimelineState::Live).await;

    store.hang_appends(true);
    let id = chat.send("hello", None).await.unwrap();
    assert!(id.is_local());

    let echoed = wait_for(&mut view, |v| v.get(&id).is_some()).await;
    assert_eq!(echoed.get(&id).unwrap().delivery, Delivery::Pending);
    assert_eq!(echoed.bodies(), vec!["hello"]);
    assert_eq!(echoed.pending, 1);

    store.fail_appends(true);
    store.hang_appends(false);

    let event = next_event(&mut events, |e| matches!(e, TimelineEvent::DraftRestored { .. })).await;
    let TimelineEvent::DraftRestored { text, .. } = event else {
        unreachable!()
    };
    assert_eq!(text, "hello");

    let after = wait_for(&mut view, |v| v.pending == 0).await;
    assert!(after.entries.is_empty());
    assert!(after.get(&id).is_none());
}

#[tokio::test]
async fn test_switching_conversations_drops_pending_echoes() {
    let store = ScriptedStore::new();
    let (mut chat, _events) = client(sam(), store.clone(), test_config());

    let mut a = chat.open(ConversationId::new("study-hall")).await.unwrap();
    wait_for(&mut a, |v| v.state == TimelineState::Live).await;

    store.hang_appends(true);
    for body in ["one", "two", "three"] {
        chat.send(body, None).await.unwrap();
    }
    let pending = wait_for(&mut a, |v| v.pending == 3).await;
    assert!(pending.entries.iter().all(|e| e.delivery == Delivery::Pending));

    let mut b = chat.open(ConversationId::new("off-topic")).await.unwrap();
    let live = wait_for(&mut b, |v| v.state == TimelineState::Live).await;
    assert!(live.entries.is_empty());
    assert_eq!(live.pending, 0);

    let closed = a.borrow().clone();
    assert_eq!(closed.state, TimelineState::Closed);
    assert!(closed.entries.is_empty());

    store.hang_appends(false);
    chat.send("fresh start", None).await.unwrap();
    let b_view = wait_for(&mut b, |v| v.pending == 0 && v.entries.len() == 1).await;
    assert_eq!(b_view.bodies(), vec!["fresh start"]);
}

#[tokio::test]
async fn test_burst_of_sends_settles_without_duplicates() {
    let store = ScriptedStore::new();
    let bus = Arc::new(PresenceBus::default());
    let (mut chat, _events) =
        ChatClient::new(test_config(), collaborators(sam(), store.clone(), bus.clone())).unwrap();
    let (mut other, _other_events) = ChatClient::new(
        test_config(),
        collaborators(Principal::new("lee", "Lee"), store.clone(), bus),
    )
    .unwrap();

    let mut view = chat.open(general()).await.unwrap();
    let mut other_view = other.open(general()).await.unwrap();

    let bodies = ["a", "b", "c", "d", "e"];
    for body in bodies {
        chat.send(body, None).await.unwrap();
    }

    let mine = wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 5).await;
    let theirs = wait_for(&mut other_view, |v| v.entries.len() == 5).await;

    assert_eq!(mine.bodies(), bodies.to_vec());
    assert_eq!(theirs.bodies(), bodies.to_vec());
    let ids: HashSet<_> = mine.entries.iter().map(|e| e.message.id.clone()).collect();
    assert_eq!(ids.len(), 5);
    assert!(mine.entries.iter().all(|e| !e.message.id.is_local()));
    assert_eq!(store.append_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_rate_gate_allows_limit_then_recovers() {
    let store = ScriptedStore::new();
    let config = SyncConfig {
        rate_max_sends: 3,
        rate_window: Duration::from_secs(1),
        ..test_config()
    };
    let (mut chat, _events) = client(sam(), store, config);
    let mut view = chat.open(general()).await.unwrap();
    wait_for(&mut view, |v| v.state == TimelineState::Live).await;

    // rejected input does not count against the window
    assert!(matches!(
        chat.send("   ", None).await,
        Err(SyncError::Validation(ValidationError::Empty))
    ));

    for i in 0..3 {
        chat.send(&format!("msg {i}"), None).await.unwrap();
    }
    let Err(SyncError::RateLimited { retry_after }) = chat.send("one too many", None).await else {
        panic!("fourth send should be throttled");
    };
    assert!(retry_after <= Duration::from_secs(1));

    let settled = wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 3).await;
    assert!(!settled.bodies().contains(&"one too many"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    chat.send("back again", None).await.unwrap();
    wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 4).await;
}

#[tokio::test]
async fn test_subscription_error_keeps_messages_and_recovers() {
    let store = ScriptedStore::new();
    let (mut chat, mut events) = client(sam(), store.clone(), test_config());
    let mut view = chat.open(general()).await.unwrap();

    chat.send("first", None).await.unwrap();
    chat.send("second", None).await.unwrap();
    wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 2).await;

    store.fail_next_subscribes(usize::MAX);
    store.break_subscriptions();

    let broken = wait_for(&mut view, |v| v.state == TimelineState::Error).await;
    assert_eq!(broken.bodies(), vec!["first", "second"]);
    assert!(broken.error.is_some());
    next_event(&mut events, |e| matches!(e, TimelineEvent::SubscriptionError { .. })).await;

    store.fail_next_subscribes(0);
    let recovered = wait_for(&mut view, |v| v.state == TimelineState::Live).await;
    assert_eq!(recovered.bodies(), vec!["first", "second"]);
    assert!(recovered.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_echo_can_be_retried() {
    let store = ScriptedStore::new();
    let config = SyncConfig {
        echo_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(300),
        echo_sweep_interval: Duration::from_millis(20),
        ..test_config()
    };
    let (mut chat, mut events) = client(sam(), store.clone(), config);
    let mut view = chat.open(general()).await.unwrap();
    wait_for(&mut view, |v| v.state == TimelineState::Live).await;

    store.hang_appends(true);
    let id = chat.send("slow one", None).await.unwrap();
    next_event(&mut events, |e| matches!(e, TimelineEvent::EchoTimedOut { .. })).await;
    let failed = view.borrow().clone();
    assert_eq!(failed.get(&id).unwrap().delivery, Delivery::Failed);

    chat.retry(&id).await.unwrap();
    store.hang_appends(false);

    let done = wait_for(&mut view, |v| {
        v.entries.len() == 1 && v.entries[0].delivery == Delivery::Confirmed
    })
    .await;
    assert_eq!(done.bodies(), vec!["slow one"]);
    assert_eq!(done.pending, 0);
}

#[tokio::test]
async fn test_reply_to_pending_message_is_refused() {
    let store = ScriptedStore::new();
    let (mut chat, mut events) = client(sam(), store.clone(), test_config());
    let mut view = chat.open(general()).await.unwrap();
    wait_for(&mut view, |v| v.state == TimelineState::Live).await;

    chat.send("confirmed", None).await.unwrap();
    let live = wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 1).await;
    let target = live.entries[0].message.id.clone();

    store.hang_appends(true);
    let pending = chat.send("not yet", None).await.unwrap();
    assert!(matches!(
        chat.send("replying", Some(&pending)).await,
        Err(SyncError::Validation(ValidationError::StillSending))
    ));

    store.fail_appends(true);
    store.hang_appends(false);
    next_event(&mut events, |e| {
        matches!(e, TimelineEvent::DraftRestored { text, .. } if text == "not yet")
    })
    .await;
    wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 1).await;

    store.fail_appends(false);
    chat.send("replying", Some(&target)).await.unwrap();
    let replied = wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 2).await;
    let quote = replied.entries[1].message.reply_to.clone().unwrap();
    assert_eq!(quote.message_id, target);
    assert_eq!(quote.snippet, "confirmed");
}

#[tokio::test]
async fn test_mentions_travel_with_the_message() {
    assert_eq!(extract_mentions("hi @sam and @lee"), vec!["sam", "lee"]);

    let store = ScriptedStore::new();
    let (mut chat, _events) = client(sam(), store.clone(), test_config());
    let mut view = chat.open(general()).await.unwrap();

    chat.send("hi @sam and @lee", None).await.unwrap();
    let done = wait_for(&mut view, |v| v.pending == 0 && v.entries.len() == 1).await;
    assert_eq!(done.entries[0].message.mentions, vec!["sam", "lee"]);

    let stored = store.inner.snapshot(&general(), 10).unwrap();
    assert_eq!(stored.messages[0].mentions, vec!["sam", "lee"]);
}

#[tokio::test]
async fn test_typing_is_visible_to_the_other_side() {
    let store = ScriptedStore::new();
    let bus = Arc::new(PresenceBus::default());
    let lee = Principal::new("lee", "Lee");
    let (mut sam_chat, _a) =
        ChatClient::new(test_config(), collaborators(sam(), store.clone(), bus.clone())).unwrap();
    let (mut lee_chat, _b) =
        ChatClient::new(test_config(), collaborators(lee.clone(), store, bus)).unwrap();

    sam_chat.open_direct(&lee.id).await.unwrap();
    lee_chat.open_direct(&sam().id).await.unwrap();
    assert_eq!(sam_chat.active_conversation(), lee_chat.active_conversation());

    lee_chat.on_input_change("hold on");
    let mut summary = None;
    for _ in 0..100 {
        summary = sam_chat.typing_summary();
        if summary.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(summary.as_deref(), Some("Lee is typing…"));
    assert!(lee_chat.typing_summary().is_none());
}

#[tokio::test]
async fn test_no_identity_refuses_everything() {
    let store = ScriptedStore::new();
    let mut services = collaborators(sam(), store, Arc::new(PresenceBus::default()));
    services.identity = Arc::new(murmur_shared::StaticIdentity::signed_out());

    assert!(matches!(
        ChatClient::new(test_config(), services),
        Err(SyncError::NoIdentity)
    ));
}

#[tokio::test]
async fn test_session_pins_survive_a_new_client() {
    let store = ScriptedStore::new();
    let (mut chat, _events) = client(sam(), store.clone(), test_config());
    let study = ConversationId::new("study-hall");

    assert!(chat.toggle_session_pin(&study).unwrap());
    assert!(chat.is_session_pinned(&study));
    drop(chat);

    let (again, _events) = client(sam(), store, test_config());
    assert!(again.is_session_pinned(&study));
    let channels = again.list_channels();
    assert!(channels.iter().any(|c| c.id == study && c.pinned_by_local_user));
}
