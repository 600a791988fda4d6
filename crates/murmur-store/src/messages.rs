//! CRUD operations for [`Message`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use murmur_shared::{
    Author, ClientToken, ConversationId, Message, MessageId, MessagePatch, ReactionSet,
};

use crate::database::Database;
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_name, sender_avatar, \
     content, created_at, edited, pinned, pinned_at, reply_to, reactions, mentions, client_token";

impl Database {
    /// Insert a confirmed message. `created_at` must already be assigned.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let created_at = message
            .created_at
            .ok_or_else(|| StoreError::Unavailable("message has no server timestamp".into()))?;

        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, sender_id, sender_name, sender_avatar,
                                   content, created_at, edited, pinned, pinned_at, reply_to,
                                   reactions, mentions, client_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                message.id.as_str(),
                message.conversation_id.as_str(),
                message.sender.id.as_str(),
                message.sender.display_name,
                message.sender.avatar_ref,
                serde_json::to_string(&message.content)?,
                created_at.timestamp_micros(),
                message.edited as i32,
                message.pinned as i32,
                message.pinned_at.map(|t| t.timestamp_micros()),
                message
                    .reply_to
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&message.reactions)?,
                serde_json::to_string(&message.mentions)?,
                message.client_token.map(|t| t.to_string()),
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages of a conversation, oldest first.
    pub fn get_recent_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
    ) -> Result<Message> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND id = ?2"
                ),
                params![conversation_id.as_str(), id.as_str()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Id of the message previously appended with `token`, if any.
    pub fn find_by_client_token(
        &self,
        conversation_id: &ConversationId,
        token: &ClientToken,
    ) -> Result<Option<MessageId>> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM messages WHERE conversation_id = ?1 AND client_token = ?2",
                params![conversation_id.as_str(), token.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(MessageId::new))
    }

    /// Apply a field-level patch and return the updated message.
    pub fn apply_patch(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
        patch: &MessagePatch,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let mut message = self.get_message(conversation_id, id)?;
        patch.apply(&mut message, now);

        self.conn().execute(
            "UPDATE messages
             SET content = ?1, edited = ?2, pinned = ?3, pinned_at = ?4, reactions = ?5
             WHERE conversation_id = ?6 AND id = ?7",
            params![
                serde_json::to_string(&message.content)?,
                message.edited as i32,
                message.pinned as i32,
                message.pinned_at.map(|t| t.timestamp_micros()),
                serde_json::to_string(&message.reactions)?,
                conversation_id.as_str(),
                id.as_str(),
            ],
        )?;

        Ok(message)
    }

    pub fn delete_message(&self, conversation_id: &ConversationId, id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND id = ?2",
            params![conversation_id.as_str(), id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Largest `created_at` ever assigned, in unix micros.
    pub fn latest_created_micros(&self) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row("SELECT MAX(created_at) FROM messages", [], |row| row.get(0))?)
    }
}

fn conversion_error(col: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn micros_to_datetime(col: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(col, micros))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let sender_name: String = row.get(3)?;
    let sender_avatar: Option<String> = row.get(4)?;
    let content_json: String = row.get(5)?;
    let created_micros: i64 = row.get(6)?;
    let edited: i32 = row.get(7)?;
    let pinned: i32 = row.get(8)?;
    let pinned_micros: Option<i64> = row.get(9)?;
    let reply_json: Option<String> = row.get(10)?;
    let reactions_json: String = row.get(11)?;
    let mentions_json: String = row.get(12)?;
    let token_str: Option<String> = row.get(13)?;

    let content = serde_json::from_str(&content_json).map_err(|e| conversion_error(5, e))?;
    let reply_to = reply_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| conversion_error(10, e))?;
    let reactions: ReactionSet =
        serde_json::from_str(&reactions_json).map_err(|e| conversion_error(11, e))?;
    let mentions: Vec<String> =
        serde_json::from_str(&mentions_json).map_err(|e| conversion_error(12, e))?;
    let client_token = token_str
        .map(|s| uuid::Uuid::parse_str(&s).map(ClientToken))
        .transpose()
        .map_err(|e| conversion_error(13, e))?;

    Ok(Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation_id),
        sender: Author {
            id: sender_id.as_str().into(),
            display_name: sender_name,
            avatar_ref: sender_avatar,
        },
        content,
        created_at: Some(micros_to_datetime(6, created_micros)?),
        edited: edited != 0,
        pinned: pinned != 0,
        pinned_at: pinned_micros
            .map(|m| micros_to_datetime(9, m))
            .transpose()?,
        reply_to,
        reactions,
        mentions,
        client_token,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use murmur_shared::{MessageContent, UserId};

    use super::*;

    fn message(id: &str, conversation: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new(conversation),
            sender: Author {
                id: UserId::new("sam"),
                display_name: "Sam".into(),
                avatar_ref: None,
            },
            content: MessageContent::text(format!("body of {id}")),
            created_at: Some(at),
            edited: false,
            pinned: false,
            pinned_at: None,
            reply_to: None,
            reactions: ReactionSet::new(),
            mentions: vec!["lee".into()],
            client_token: Some(ClientToken::new()),
        }
    }

    #[test]
    fn insert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        let now = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
        let msg = message("m1", "general", now);
        db.insert_message(&msg).unwrap();

        let read = db.get_message(&msg.conversation_id, &msg.id).unwrap();
        assert_eq!(read, msg);
    }

    #[test]
    fn recent_messages_are_bounded_and_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..5 {
            db.insert_message(&message(&format!("m{i}"), "general", base + Duration::seconds(i)))
                .unwrap();
        }
        db.insert_message(&message("other", "random", base)).unwrap();

        let recent = db
            .get_recent_messages(&ConversationId::new("general"), 3)
            .unwrap();
        let ids: Vec<&str> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn find_by_token() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("m1", "general", Utc::now());
        db.insert_message(&msg).unwrap();

        let token = msg.client_token.unwrap();
        assert_eq!(
            db.find_by_client_token(&msg.conversation_id, &token).unwrap(),
            Some(msg.id.clone())
        );
        assert_eq!(
            db.find_by_client_token(&msg.conversation_id, &ClientToken::new())
                .unwrap(),
            None
        );
    }

    #[test]
    fn patch_reaction_and_pin() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("m1", "general", Utc::now());
        db.insert_message(&msg).unwrap();

        let lee = UserId::new("lee");
        let patched = db
            .apply_patch(
                &msg.conversation_id,
                &msg.id,
                &MessagePatch::Reaction {
                    emoji: "👍".into(),
                    user: lee.clone(),
                    present: true,
                },
                Utc::now(),
            )
            .unwrap();
        assert!(patched.reactions.contains("👍", &lee));

        db.apply_patch(
            &msg.conversation_id,
            &msg.id,
            &MessagePatch::Pin { pinned: true },
            Utc::now(),
        )
        .unwrap();
        let read = db.get_message(&msg.conversation_id, &msg.id).unwrap();
        assert!(read.pinned);
        assert!(read.pinned_at.is_some());
        assert!(read.reactions.contains("👍", &lee));
    }

    #[test]
    fn patch_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .apply_patch(
                &ConversationId::new("general"),
                &MessageId::new("nope"),
                &MessagePatch::Pin { pinned: true },
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn delete_reports_whether_removed() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("m1", "general", Utc::now());
        db.insert_message(&msg).unwrap();

        assert!(db.delete_message(&msg.conversation_id, &msg.id).unwrap());
        assert!(!db.delete_message(&msg.conversation_id, &msg.id).unwrap());
    }
}
