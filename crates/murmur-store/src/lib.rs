//! # murmur-store
//!
//! Durable and ephemeral collaborators of the Murmur sync core.
//!
//! [`contract`] defines the message store, presence transport, object store
//! and pin store the core talks to. The rest of the crate provides local
//! implementations: a SQLite message log with snapshot subscriptions
//! ([`LocalStore`]), an in-process topic bus for typing frames
//! ([`PresenceBus`]) and a filesystem object store ([`FsObjectStore`]).

pub mod blob_store;
pub mod contract;
pub mod database;
pub mod local;
pub mod messages;
pub mod migrations;
pub mod presence;
pub mod session_pins;

mod error;

pub use blob_store::FsObjectStore;
pub use contract::{
    receiver_stream, MessageStore, ObjectStore, PinStore, PresenceStream, PresenceTransport,
    Receipt, SnapshotStream,
};
pub use database::Database;
pub use error::{Result, StoreError};
pub use local::LocalStore;
pub use presence::{BusMessage, PresenceBus};
