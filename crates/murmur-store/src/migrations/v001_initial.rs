//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table: the append-mostly, server-ordered log that
//! backs every conversation.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4, assigned on append
    conversation_id TEXT NOT NULL,               -- channel id or sorted participant pair
    sender_id       TEXT NOT NULL,
    sender_name     TEXT NOT NULL,
    sender_avatar   TEXT,
    content         TEXT NOT NULL,               -- JSON MessageContent (tagged text|image)
    created_at      INTEGER NOT NULL,            -- unix micros, strictly increasing
    edited          INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    pinned          INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    pinned_at       INTEGER,                     -- unix micros
    reply_to        TEXT,                        -- JSON ReplyRef snapshot
    reactions       TEXT NOT NULL DEFAULT '{}',  -- JSON emoji -> [user id]
    mentions        TEXT NOT NULL DEFAULT '[]',  -- JSON [name]
    client_token    TEXT                         -- idempotency token of the append
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_token
    ON messages(conversation_id, client_token)
    WHERE client_token IS NOT NULL;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
