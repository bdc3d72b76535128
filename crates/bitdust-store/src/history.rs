//! CRUD operations for the `history` and `conversations` tables.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ConversationRow, HistoryRow, MessageDirection, MessageType};

impl Database {
    /// Insert a message and update its conversation row. The conversation's
    /// `last_updated_at` only moves forward, even when messages arrive out
    /// of order.
    pub fn insert_history(&self, row: &HistoryRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO history
                 (id, conversation_id, sender_local_key_id, recipient_local_key_id,
                  direction, message_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.conversation_id,
                row.sender_local_key_id,
                row.recipient_local_key_id,
                row.direction.as_str(),
                row.message_type.as_str(),
                row.payload,
                row.created_at.to_rfc3339(),
            ],
        )?;
        self.touch_conversation(
            &row.conversation_id,
            row.message_type,
            &row.id,
            row.created_at,
        )?;
        Ok(())
    }

    /// Whether a message id is already stored (duplicate suppression).
    pub fn history_contains(&self, id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM history WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Messages of a conversation in chronological order.
    pub fn list_history(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HistoryRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_local_key_id, recipient_local_key_id,
                    direction, message_type, payload, created_at
             FROM history
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit, offset], row_to_history)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_history(&self, conversation_id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM history WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Conversations ordered by most recent activity.
    pub fn list_conversations(&self) -> Result<Vec<ConversationRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id, message_type, started_at, last_updated_at, last_message_id
             FROM conversations
             ORDER BY last_updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<ConversationRow> {
        self.conn()
            .query_row(
                "SELECT conversation_id, message_type, started_at, last_updated_at, last_message_id
                 FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    fn touch_conversation(
        &self,
        conversation_id: &str,
        message_type: MessageType,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        match self.get_conversation(conversation_id) {
            Ok(existing) => {
                // Monotone timestamp: never move the conversation backwards.
                if at >= existing.last_updated_at {
                    self.conn().execute(
                        "UPDATE conversations
                         SET last_updated_at = ?1, last_message_id = ?2
                         WHERE conversation_id = ?3",
                        params![at.to_rfc3339(), message_id, conversation_id],
                    )?;
                }
            }
            Err(StoreError::NotFound) => {
                self.conn().execute(
                    "INSERT INTO conversations
                         (conversation_id, message_type, started_at, last_updated_at, last_message_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        conversation_id,
                        message_type.as_str(),
                        at.to_rfc3339(),
                        at.to_rfc3339(),
                        message_id,
                    ],
                )?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    let direction_raw: String = row.get(4)?;
    let type_raw: String = row.get(5)?;
    let created_raw: String = row.get(7)?;

    let direction = MessageDirection::parse(&direction_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad direction: {direction_raw}").into(),
        )
    })?;
    let message_type = MessageType::parse(&type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("bad message type: {type_raw}").into(),
        )
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(HistoryRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_local_key_id: row.get(2)?,
        recipient_local_key_id: row.get(3)?,
        direction,
        message_type,
        payload: row.get(6)?,
        created_at,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let type_raw: String = row.get(1)?;
    let started_raw: String = row.get(2)?;
    let updated_raw: String = row.get(3)?;

    let message_type = MessageType::parse(&type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("bad message type: {type_raw}").into(),
        )
    })?;
    let started_at = DateTime::parse_from_rfc3339(&started_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let last_updated_at = DateTime::parse_from_rfc3339(&updated_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ConversationRow {
        conversation_id: row.get(0)?,
        message_type,
        started_at,
        last_updated_at,
        last_message_id: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::private_conversation_id;

    fn sample_row(db: &Database, id: &str, at: DateTime<Utc>) -> HistoryRow {
        let a = db.register_key("master$alice@id-a_8084", "pk-a").unwrap();
        let b = db.register_key("master$bob@id-b_8084", "pk-b").unwrap();
        HistoryRow {
            id: id.to_string(),
            conversation_id: private_conversation_id(a, b),
            sender_local_key_id: a,
            recipient_local_key_id: b,
            direction: MessageDirection::Outgoing,
            message_type: MessageType::PrivateMessage,
            payload: br#"{"text":"hi"}"#.to_vec(),
            created_at: at,
        }
    }

    #[test]
    fn insert_and_list_in_order() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc::now();
        let first = sample_row(&db, "m1", base);
        let second = sample_row(&db, "m2", base + chrono::Duration::seconds(1));
        db.insert_history(&first).unwrap();
        db.insert_history(&second).unwrap();

        let listed = db.list_history(&first.conversation_id, 100, 0).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "m1");
        assert_eq!(listed[1].id, "m2");
        assert_eq!(db.count_history(&first.conversation_id).unwrap(), 2);
    }

    #[test]
    fn duplicate_ids_detected() {
        let db = Database::open_in_memory().unwrap();
        let row = sample_row(&db, "m1", Utc::now());
        db.insert_history(&row).unwrap();
        assert!(db.history_contains("m1").unwrap());
        assert!(!db.history_contains("m2").unwrap());
        assert!(db.insert_history(&row).is_err());
    }

    #[test]
    fn conversation_timestamp_is_monotone() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc::now();
        let newer = sample_row(&db, "m1", base + chrono::Duration::seconds(10));
        let older = sample_row(&db, "m2", base);
        db.insert_history(&newer).unwrap();
        db.insert_history(&older).unwrap();

        let conv = db.get_conversation(&newer.conversation_id).unwrap();
        assert_eq!(conv.last_updated_at, newer.created_at);
        assert_eq!(conv.last_message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn conversations_ordered_by_activity() {
        let db = Database::open_in_memory().unwrap();
        let base = Utc::now();

        let a = db.register_key("master$a@h_1", "pk1").unwrap();
        let b = db.register_key("master$b@h_1", "pk2").unwrap();
        let c = db.register_key("group_x$a@h_1", "pk3").unwrap();

        db.insert_history(&HistoryRow {
            id: "p1".into(),
            conversation_id: private_conversation_id(a, b),
            sender_local_key_id: a,
            recipient_local_key_id: b,
            direction: MessageDirection::Outgoing,
            message_type: MessageType::PrivateMessage,
            payload: vec![1],
            created_at: base,
        })
        .unwrap();
        db.insert_history(&HistoryRow {
            id: "g1".into(),
            conversation_id: crate::models::group_conversation_id(c),
            sender_local_key_id: a,
            recipient_local_key_id: c,
            direction: MessageDirection::Incoming,
            message_type: MessageType::GroupMessage,
            payload: vec![2],
            created_at: base + chrono::Duration::seconds(5),
        })
        .unwrap();

        let conversations = db.list_conversations().unwrap();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].message_type, MessageType::GroupMessage);
    }
}
