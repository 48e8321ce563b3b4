use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Database, now_rfc3339, parse_ts};

/// Fixed agent role catalog. `Primary` is the top-level loop; the others
/// exist only as sub-agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Builder,
    Reviewer,
    Researcher,
    Primary,
}

impl AgentRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "planner" => Some(Self::Planner),
            "builder" => Some(Self::Builder),
            "reviewer" => Some(Self::Reviewer),
            "researcher" => Some(Self::Researcher),
            "primary" => Some(Self::Primary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Builder => "builder",
            Self::Reviewer => "reviewer",
            Self::Researcher => "researcher",
            Self::Primary => "primary",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running agent's identity. Lifetime is bounded by a single invocation;
/// only the copies embedded in persisted messages outlive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub role: AgentRole,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentIdentity {
    pub fn new(role: AgentRole, tenant_id: Option<String>) -> Self {
        Self {
            id: format!("agent-{}", Uuid::new_v4()),
            role,
            tenant_id,
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Processed,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "delivered" => Self::Delivered,
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

/// Broadcast recipient marker.
pub const BROADCAST: &str = "*";

/// One message on the agent-to-agent fabric, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aMessage {
    pub id: String,
    pub kind: MessageKind,
    pub from: AgentIdentity,
    /// Target agent id, or `"*"` for broadcast.
    pub to: String,
    pub conversation_id: Option<i64>,
    pub action: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    pub reply_to: Option<String>,
    pub ttl_ms: Option<i64>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl A2aMessage {
    pub fn new(
        kind: MessageKind,
        from: AgentIdentity,
        to: impl Into<String>,
        action: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("a2a-{}", Uuid::new_v4()),
            kind,
            from,
            to: to.into(),
            conversation_id: None,
            action: action.into(),
            content: content.into(),
            metadata: Value::Null,
            reply_to: None,
            ttl_ms: None,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

impl Database {
    pub fn insert_a2a_message(&self, msg: &A2aMessage) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO a2a_messages
                (id, kind, from_agent, to_agent, conversation_id, action, content, metadata,
                 reply_to, ttl_ms, status, created_at, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                msg.id,
                match msg.kind {
                    MessageKind::Request => "request",
                    MessageKind::Response => "response",
                    MessageKind::Event => "event",
                },
                serde_json::to_string(&msg.from)?,
                msg.to,
                msg.conversation_id,
                msg.action,
                msg.content,
                if msg.metadata.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&msg.metadata)?)
                },
                msg.reply_to,
                msg.ttl_ms,
                msg.status.as_str(),
                msg.created_at.to_rfc3339(),
                msg.processed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn set_a2a_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE a2a_messages SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Transition to `processed`, stamping `processed_at`. Idempotent:
    /// returns false when the row was already processed (no-op).
    pub fn mark_a2a_processed(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE a2a_messages SET status = 'processed', processed_at = ?2
             WHERE id = ?1 AND status != 'processed'",
            params![id, now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Flip pending messages whose TTL elapsed to `expired`. Returns the
    /// number of rows expired.
    pub fn expire_overdue_a2a(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, ttl_ms FROM a2a_messages
             WHERE status = 'pending' AND ttl_ms IS NOT NULL",
        )?;
        let candidates = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut expired = 0;
        for (id, created_at, ttl_ms) in candidates {
            let created = parse_ts(&created_at)?;
            if created + chrono::Duration::milliseconds(ttl_ms) <= now {
                conn.execute(
                    "UPDATE a2a_messages SET status = 'expired' WHERE id = ?1",
                    params![id],
                )?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    pub fn get_a2a_message(&self, id: &str) -> Result<Option<A2aMessage>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, kind, from_agent, to_agent, conversation_id, action, content,
                        metadata, reply_to, ttl_ms, status, created_at, processed_at
                 FROM a2a_messages WHERE id = ?1",
                params![id],
                map_a2a_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Audit log for one conversation, in send-accept order.
    pub fn a2a_log(&self, conversation_id: i64) -> Result<Vec<A2aMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, from_agent, to_agent, conversation_id, action, content,
                    metadata, reply_to, ttl_ms, status, created_at, processed_at
             FROM a2a_messages WHERE conversation_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], map_a2a_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn map_a2a_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<A2aMessage> {
    let kind: String = row.get(1)?;
    let from_raw: String = row.get(2)?;
    let metadata_raw: Option<String> = row.get(7)?;
    let status_raw: String = row.get(10)?;
    let created_raw: String = row.get(11)?;
    let processed_raw: Option<String> = row.get(12)?;
    Ok(A2aMessage {
        id: row.get(0)?,
        kind: match kind.as_str() {
            "response" => MessageKind::Response,
            "event" => MessageKind::Event,
            _ => MessageKind::Request,
        },
        from: serde_json::from_str(&from_raw).unwrap_or(AgentIdentity {
            id: "unknown".into(),
            role: AgentRole::Primary,
            tenant_id: None,
            capabilities: Vec::new(),
        }),
        to: row.get(3)?,
        conversation_id: row.get(4)?,
        action: row.get(5)?,
        content: row.get(6)?,
        metadata: metadata_raw
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null),
        reply_to: row.get(8)?,
        ttl_ms: row.get(9)?,
        status: MessageStatus::parse(&status_raw),
        created_at: DateTime::parse_from_rfc3339(&created_raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        processed_at: processed_raw
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}
