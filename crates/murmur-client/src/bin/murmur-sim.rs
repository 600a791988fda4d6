//! Two clients, one local store, one direct conversation.
//!
//! Runs a short exchange between `sam` and `lee` through the full sync core
//! (optimistic echo, reply, reaction, pin, typing, image) and prints what
//! each side ends up seeing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use murmur_client::{
    ChatClient, Collaborators, Delivery, SyncConfig, TimelineState, TimelineView,
};
use murmur_shared::{MessageId, Principal, StaticIdentity};
use murmur_store::{FsObjectStore, LocalStore, PresenceBus};

const WAIT: Duration = Duration::from_secs(5);
const MAX_OBJECT_SIZE: usize = 8 * 1024 * 1024;

async fn wait_for(
    view: &mut watch::Receiver<TimelineView>,
    what: &str,
    pred: impl FnMut(&TimelineView) -> bool,
) -> anyhow::Result<TimelineView> {
    let view = tokio::time::timeout(WAIT, view.wait_for(pred))
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
        .context("synchronizer stopped")?;
    Ok(view.clone())
}

fn print_timeline(owner: &str, view: &TimelineView) {
    println!("--- {owner} ({}, {}) ---", view.conversation_id, view.state);
    for entry in &view.entries {
        let message = &entry.message;
        let marker = match entry.delivery {
            Delivery::Confirmed => " ",
            Delivery::Pending => "…",
            Delivery::Failed => "!",
        };
        let pin = if message.pinned { "📌" } else { "" };
        let body = match (message.content.body(), message.content.attachment_url()) {
            (Some(body), Some(url)) => format!("{body} <{url}>"),
            (Some(body), None) => body.to_string(),
            (None, Some(url)) => format!("<{url}>"),
            (None, None) => String::new(),
        };
        let quote = message
            .reply_to
            .as_ref()
            .map(|r| format!(" [re {}: {}]", r.sender_display_name, r.snippet))
            .unwrap_or_default();
        let reactions: Vec<String> = message
            .reactions
            .iter()
            .map(|(emoji, users)| format!("{emoji}{}", users.len()))
            .collect();

        println!(
            "{marker} {pin}{}: {body}{quote} {}",
            message.sender.display_name,
            reactions.join(" ")
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    murmur_client::init_tracing();

    info!("Starting murmur-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::from_env();
    info!(?config, "Loaded configuration");

    let store = Arc::new(LocalStore::new(config.open_database()?)?);
    let bus = Arc::new(PresenceBus::default());
    let objects = Arc::new(
        FsObjectStore::new(std::env::temp_dir().join("murmur-sim"), MAX_OBJECT_SIZE).await?,
    );

    let services = |principal: Principal| Collaborators {
        identity: Arc::new(StaticIdentity::signed_in(principal)),
        store: store.clone(),
        presence: bus.clone(),
        objects: objects.clone(),
        pins: store.clone(),
    };

    let sam = Principal::new("sam", "Sam");
    let lee = Principal::new("lee", "Lee");
    let (mut sam_client, mut sam_events) = ChatClient::new(config.clone(), services(sam.clone()))?;
    let (mut lee_client, _lee_events) = ChatClient::new(config.clone(), services(lee.clone()))?;

    let dm = sam_client.direct_session(&lee.id, &lee.display_name);
    sam_client.toggle_session_pin(&dm.id)?;

    let mut sam_view = sam_client.open_direct(&lee.id).await?;
    let mut lee_view = lee_client.open_direct(&sam.id).await?;
    // the database may hold earlier runs of this exchange
    let history: HashSet<MessageId> =
        wait_for(&mut sam_view, "sam live", |v| v.state == TimelineState::Live)
            .await?
            .entries
            .into_iter()
            .map(|e| e.message.id)
            .collect();
    wait_for(&mut lee_view, "lee live", |v| v.state == TimelineState::Live).await?;
    info!(history = history.len(), "Direct conversation open");
    let fresh = |v: &TimelineView| {
        v.entries
            .iter()
            .filter(|e| !history.contains(&e.message.id))
            .count()
    };

    lee_client.on_input_change("one sec");
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "sam sees: {}",
        sam_client.typing_summary().unwrap_or_else(|| "(nobody typing)".into())
    );

    sam_client.send("hi @lee, got a minute?", None).await?;
    let seen = wait_for(&mut lee_view, "first message", |v| fresh(v) > 0).await?;
    let first = seen
        .entries
        .iter()
        .find(|e| !history.contains(&e.message.id))
        .map(|e| e.message.id.clone())
        .context("first message vanished")?;

    lee_client.send("sure, what's up?", Some(&first)).await?;
    lee_client.toggle_reaction(&first, "👍").await?;

    wait_for(&mut sam_view, "sam's echo confirmed", |v| {
        v.get(&first).is_some_and(|e| e.delivery == Delivery::Confirmed)
    })
    .await?;
    sam_client.toggle_pin(&first).await?;
    sam_client
        .send_image(b"\x89PNG\r\n\x1a\n".to_vec(), "plan.png", Some("the plan"))
        .await?;

    let settled = |v: &TimelineView| {
        v.pending == 0
            && fresh(v) == 3
            && v.entries.iter().all(|e| e.delivery == Delivery::Confirmed)
            && v.pinned.contains(&first)
            && v.get(&first).is_some_and(|e| e.message.reactions.count("👍") == 1)
    };
    let sam_final = wait_for(&mut sam_view, "sam settled", settled).await?;
    let lee_final = wait_for(&mut lee_view, "lee settled", settled).await?;

    print_timeline("sam", &sam_final);
    print_timeline("lee", &lee_final);
    println!(
        "sam has {} pinned: {}",
        dm.display_name,
        sam_client.is_session_pinned(&dm.id)
    );

    sam_client.close().await;
    lee_client.close().await;

    while let Ok(event) = sam_events.try_recv() {
        info!(?event, "sam event");
    }

    Ok(())
}
