use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{Database, now_rfc3339, parse_ts};

/// An ordered message history scoped to a (channel, externalId) pair.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub channel_id: String,
    pub external_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Message roles as persisted. Append-only; rows are never mutated.
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL_RESULT: &str = "tool_result";

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Value>,
    pub tool_use_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Database {
    /// Idempotent upsert by (channel_id, external_id).
    pub fn get_or_create_conversation(
        &self,
        channel_id: &str,
        external_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO conversations (channel_id, external_id, title, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel_id, external_id) DO NOTHING",
            params![channel_id, external_id, title, now_rfc3339()],
        )?;
        let (id, title, created_at): (i64, Option<String>, String) = conn.query_row(
            "SELECT id, title, created_at FROM conversations
             WHERE channel_id = ?1 AND external_id = ?2",
            params![channel_id, external_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(Conversation {
            id,
            channel_id: channel_id.to_string(),
            external_id: external_id.to_string(),
            title,
            created_at: parse_ts(&created_at)?,
        })
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, channel_id, external_id, title, created_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, channel_id, external_id, title, created_at)) => Ok(Some(Conversation {
                id,
                channel_id,
                external_id,
                title,
                created_at: parse_ts(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    pub fn append_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        tool_calls: Option<&Value>,
        tool_use_id: Option<&str>,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, tool_calls, tool_use_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                role,
                content,
                tool_calls.map(serde_json::to_string).transpose()?,
                tool_use_id,
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` messages, returned in insertion order.
    pub fn conversation_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, tool_calls, tool_use_id, created_at
             FROM (SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2)
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, conversation_id, role, content, tool_calls, tool_use_id, created_at) in rows {
            messages.push(StoredMessage {
                id,
                conversation_id,
                role,
                content,
                tool_calls: tool_calls.and_then(|raw| serde_json::from_str(&raw).ok()),
                tool_use_id,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_upsert_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let a = db
            .get_or_create_conversation("webhook-w1", "ext-9", Some("First"))
            .unwrap();
        let b = db
            .get_or_create_conversation("webhook-w1", "ext-9", Some("Ignored"))
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.title.as_deref(), Some("First"));
    }

    #[test]
    fn test_distinct_pairs_get_distinct_conversations() {
        let db = Database::in_memory().unwrap();
        let a = db
            .get_or_create_conversation("scheduler", "job-1", None)
            .unwrap();
        let b = db
            .get_or_create_conversation("scheduler", "job-2", None)
            .unwrap();
        let c = db
            .get_or_create_conversation("webhook-x", "job-1", None)
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_messages_preserve_order() {
        let db = Database::in_memory().unwrap();
        let conv = db.get_or_create_conversation("cli", "1", None).unwrap();
        db.append_message(conv.id, ROLE_USER, "hi", None, None)
            .unwrap();
        let calls = json!([{"id": "tc_1", "name": "web_browse", "arguments": {"url": "https://example.com"}}]);
        db.append_message(conv.id, ROLE_ASSISTANT, "", Some(&calls), None)
            .unwrap();
        db.append_message(conv.id, ROLE_TOOL_RESULT, "page text", None, Some("tc_1"))
            .unwrap();

        let messages = db.conversation_messages(conv.id, 50).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, ROLE_USER);
        assert_eq!(messages[1].tool_calls.as_ref().unwrap()[0]["name"], "web_browse");
        assert_eq!(messages[2].tool_use_id.as_deref(), Some("tc_1"));
    }

    #[test]
    fn test_message_limit_keeps_most_recent() {
        let db = Database::in_memory().unwrap();
        let conv = db.get_or_create_conversation("cli", "1", None).unwrap();
        for i in 0..10 {
            db.append_message(conv.id, ROLE_USER, &format!("m{i}"), None, None)
                .unwrap();
        }
        let messages = db.conversation_messages(conv.id, 3).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "m7");
        assert_eq!(messages[2].content, "m9");
    }
}
