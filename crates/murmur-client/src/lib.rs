//! # murmur-client
//!
//! Real-time conversation sync core: keeps one ordered, de-duplicated view
//! of a conversation while local sends, edits, reactions and pins are shown
//! optimistically ahead of the durable store.
//!
//! - [`ChatClient`] is the entry point: identity, session directory, send
//!   gating and the open conversation.
//! - [`sync`] runs one task per open conversation around the
//!   [`timeline::Timeline`] merge engine.
//! - [`presence`] tracks who is typing.

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod presence;
pub mod rate_gate;
pub mod reactions;
pub mod sync;
pub mod timeline;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::{ChatClient, Collaborators};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use events::TimelineEvent;
pub use sync::TimelineHandle;
pub use timeline::{Delivery, TimelineEntry, TimelineState, TimelineView};

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "murmur_client=debug,murmur_store=info,warn";

/// Install the global tracing subscriber. Respects `RUST_LOG`.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
