//! Per-user pinned conversations.

use chrono::Utc;
use rusqlite::params;

use murmur_shared::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Pin a conversation for `user`. Pinning twice is a no-op.
    pub fn pin_session(&self, user: &UserId, conversation_id: &ConversationId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO session_pins (user_id, conversation_id, pinned_at)
             VALUES (?1, ?2, ?3)",
            params![
                user.as_str(),
                conversation_id.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Unpin a conversation.  Returns `true` if it was pinned.
    pub fn unpin_session(&self, user: &UserId, conversation_id: &ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM session_pins WHERE user_id = ?1 AND conversation_id = ?2",
            params![user.as_str(), conversation_id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Conversations pinned by `user`, oldest pin first.
    pub fn list_pinned_sessions(&self, user: &UserId) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM session_pins
             WHERE user_id = ?1
             ORDER BY pinned_at ASC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], |row| {
            row.get::<_, String>(0).map(ConversationId::new)
        })?;

        let mut pins = Vec::new();
        for row in rows {
            pins.push(row?);
        }
        Ok(pins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_scoped_per_user() {
        let db = Database::open_in_memory().unwrap();
        let sam = UserId::new("sam");
        let lee = UserId::new("lee");
        let general = ConversationId::new("general");

        db.pin_session(&sam, &general).unwrap();
        db.pin_session(&sam, &general).unwrap();

        assert_eq!(db.list_pinned_sessions(&sam).unwrap(), vec![general.clone()]);
        assert!(db.list_pinned_sessions(&lee).unwrap().is_empty());

        assert!(db.unpin_session(&sam, &general).unwrap());
        assert!(!db.unpin_session(&sam, &general).unwrap());
        assert!(db.list_pinned_sessions(&sam).unwrap().is_empty());
    }
}
