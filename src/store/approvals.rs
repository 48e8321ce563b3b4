use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Database, parse_ts};

/// What to do when an approval expires unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnTimeout {
    Approve,
    Reject,
}

impl OnTimeout {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "approve" {
            Self::Approve
        } else {
            Self::Reject
        }
    }
}

/// Per-tool approval policy. A tenant-scoped rule shadows the global one
/// (`tenant_id = NULL`) for the same tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub tenant_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_on_timeout")]
    pub on_timeout: OnTimeout,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_sec() -> u64 {
    300
}

fn default_on_timeout() -> OnTimeout {
    OnTimeout::Reject
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "timeout" => Self::Timeout,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub id: String,
    pub tenant_id: Option<String>,
    pub agent_id: String,
    pub tool: String,
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl Database {
    pub fn upsert_approval_rule(&self, rule: &ApprovalRule) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO approval_rules
                (tenant_id, tool_name, auto_approve, require_approval, timeout_sec, on_timeout, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(tenant_id, tool_name) DO UPDATE SET
                auto_approve=excluded.auto_approve,
                require_approval=excluded.require_approval,
                timeout_sec=excluded.timeout_sec,
                on_timeout=excluded.on_timeout,
                enabled=excluded.enabled",
            params![
                rule.tenant_id,
                rule.tool_name,
                rule.auto_approve,
                rule.require_approval,
                rule.timeout_sec as i64,
                rule.on_timeout.as_str(),
                rule.enabled,
            ],
        )?;
        Ok(())
    }

    /// Effective rule for (tenant, tool): tenant-scoped first, then global.
    pub fn find_approval_rule(
        &self,
        tenant_id: Option<&str>,
        tool_name: &str,
    ) -> Result<Option<ApprovalRule>> {
        let conn = self.lock();
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ApprovalRule> {
            let on_timeout: String = row.get(5)?;
            Ok(ApprovalRule {
                tenant_id: row.get(0)?,
                tool_name: row.get(1)?,
                auto_approve: row.get(2)?,
                require_approval: row.get(3)?,
                timeout_sec: row.get::<_, i64>(4)? as u64,
                on_timeout: OnTimeout::parse(&on_timeout),
                enabled: row.get(6)?,
            })
        };

        if let Some(tenant) = tenant_id {
            let scoped = conn
                .query_row(
                    "SELECT tenant_id, tool_name, auto_approve, require_approval, timeout_sec,
                            on_timeout, enabled
                     FROM approval_rules WHERE tenant_id = ?1 AND tool_name = ?2",
                    params![tenant, tool_name],
                    map,
                )
                .optional()?;
            if scoped.is_some() {
                return Ok(scoped);
            }
        }
        let global = conn
            .query_row(
                "SELECT tenant_id, tool_name, auto_approve, require_approval, timeout_sec,
                        on_timeout, enabled
                 FROM approval_rules WHERE tenant_id IS NULL AND tool_name = ?1",
                params![tool_name],
                map,
            )
            .optional()?;
        Ok(global)
    }

    pub fn insert_pending_approval(&self, approval: &PendingApproval) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pending_approvals
                (id, tenant_id, agent_id, tool, input, created_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                approval.id,
                approval.tenant_id,
                approval.agent_id,
                approval.tool,
                serde_json::to_string(&approval.input)?,
                approval.created_at.to_rfc3339(),
                approval.expires_at.to_rfc3339(),
                approval.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Move a pending approval to a terminal state. Returns false when the
    /// row was already terminal (terminal states are immutable).
    pub fn resolve_approval(&self, id: &str, status: ApprovalStatus) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE pending_approvals SET status = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, status.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_pending_approval(&self, id: &str) -> Result<Option<PendingApproval>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, agent_id, tool, input, created_at, expires_at, status
                 FROM pending_approvals WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, tenant_id, agent_id, tool, input, created_at, expires_at, status)) => {
                Ok(Some(PendingApproval {
                    id,
                    tenant_id,
                    agent_id,
                    tool,
                    input: serde_json::from_str(&input).unwrap_or(Value::Null),
                    created_at: parse_ts(&created_at)?,
                    expires_at: parse_ts(&expires_at)?,
                    status: ApprovalStatus::parse(&status),
                }))
            }
            None => Ok(None),
        }
    }

    /// Ids of approvals still `pending` whose deadline already passed.
    /// Used at boot to apply each rule's timeout policy to leftovers.
    pub fn stale_pending_approvals(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM pending_approvals WHERE status = 'pending' AND expires_at <= ?1",
        )?;
        let ids = stmt
            .query_map(params![now.to_rfc3339()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}
