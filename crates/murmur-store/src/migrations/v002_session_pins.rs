use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Conversations each local user has pinned in the sidebar
CREATE TABLE IF NOT EXISTS session_pins (
    user_id         TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    pinned_at       TEXT NOT NULL,               -- ISO-8601

    PRIMARY KEY (user_id, conversation_id)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
