//! Human-in-the-loop gate for risky tools. A gated execution persists a
//! pending approval, emits `approval:required`, and blocks the calling
//! loop until an operator resolves it or the rule's timer expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::events::{EventBus, names};
use crate::store::Database;
use crate::store::approvals::{ApprovalStatus, OnTimeout, PendingApproval};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Approved,
    Rejected,
}

pub struct ApprovalBroker {
    db: Arc<Database>,
    events: EventBus,
    waiters: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
}

impl ApprovalBroker {
    pub fn new(db: Arc<Database>, events: EventBus) -> Self {
        Self {
            db,
            events,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Gate one tool execution. `Ok(())` means the caller may run the
    /// handler; rejection and timeout come back as loop-recoverable errors.
    pub async fn gate(
        &self,
        tenant_id: Option<&str>,
        agent_id: &str,
        tool: &str,
        input: &Value,
    ) -> Result<(), GatewayError> {
        let rule = self
            .db
            .find_approval_rule(tenant_id, tool)
            .map_err(GatewayError::Internal)?;
        let Some(rule) = rule else {
            return Ok(());
        };
        if !rule.enabled {
            return Ok(());
        }
        if rule.auto_approve {
            // Short-circuit: no row, no event.
            return Ok(());
        }
        if !rule.require_approval {
            return Ok(());
        }

        let approval = PendingApproval {
            id: format!("ap-{}", Uuid::new_v4()),
            tenant_id: tenant_id.map(str::to_string),
            agent_id: agent_id.to_string(),
            tool: tool.to_string(),
            input: input.clone(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(rule.timeout_sec as i64),
            status: ApprovalStatus::Pending,
        };
        self.db
            .insert_pending_approval(&approval)
            .map_err(GatewayError::Internal)?;

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(approval.id.clone(), tx);

        self.events.emit(
            names::APPROVAL_REQUIRED,
            json!({
                "id": approval.id,
                "tool": tool,
                "agentId": agent_id,
                "input": input,
                "expiresAt": approval.expires_at.to_rfc3339(),
            }),
            tenant_id.map(str::to_string),
        );
        info!("approval {} pending for tool '{}' ({}s timeout)", approval.id, tool, rule.timeout_sec);

        match tokio::time::timeout(Duration::from_secs(rule.timeout_sec), rx).await {
            Ok(Ok(Decision::Approved)) => Ok(()),
            Ok(Ok(Decision::Rejected)) => Err(GatewayError::ApprovalRejected(tool.to_string())),
            Ok(Err(_)) => {
                // Broker shut down under us; fail closed.
                Err(GatewayError::ApprovalRejected(tool.to_string()))
            }
            Err(_) => {
                self.waiters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&approval.id);
                // An operator may have raced the deadline.
                let timed_out = self
                    .db
                    .resolve_approval(&approval.id, ApprovalStatus::Timeout)
                    .map_err(GatewayError::Internal)?;
                if !timed_out {
                    let row = self
                        .db
                        .get_pending_approval(&approval.id)
                        .map_err(GatewayError::Internal)?;
                    if let Some(row) = row
                        && row.status == ApprovalStatus::Approved
                    {
                        return Ok(());
                    }
                    return Err(GatewayError::ApprovalRejected(tool.to_string()));
                }
                self.emit_resolved(&approval.id, tool, "timeout", tenant_id);
                warn!("approval {} for '{}' timed out", approval.id, tool);
                match rule.on_timeout {
                    OnTimeout::Approve => Ok(()),
                    OnTimeout::Reject => Err(GatewayError::ApprovalTimeout(tool.to_string())),
                }
            }
        }
    }

    /// Operator action. Idempotent: resolving a terminal approval returns
    /// its current status without error.
    pub fn approve(&self, id: &str) -> Result<ApprovalStatus, GatewayError> {
        self.resolve(id, ApprovalStatus::Approved, Decision::Approved)
    }

    pub fn reject(&self, id: &str) -> Result<ApprovalStatus, GatewayError> {
        self.resolve(id, ApprovalStatus::Rejected, Decision::Rejected)
    }

    fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        decision: Decision,
    ) -> Result<ApprovalStatus, GatewayError> {
        let row = self
            .db
            .get_pending_approval(id)
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("unknown approval '{id}'")))?;

        let flipped = self
            .db
            .resolve_approval(id, status)
            .map_err(GatewayError::Internal)?;
        if !flipped {
            return Ok(row.status);
        }

        if let Some(waiter) = self
            .waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id)
        {
            let _ = waiter.send(decision);
        }
        self.emit_resolved(id, &row.tool, status.as_str(), row.tenant_id.as_deref());
        info!("approval {} resolved: {}", id, status.as_str());
        Ok(status)
    }

    fn emit_resolved(&self, id: &str, tool: &str, resolution: &str, tenant_id: Option<&str>) {
        self.events.emit(
            names::APPROVAL_RESOLVED,
            json!({"id": id, "tool": tool, "resolution": resolution}),
            tenant_id.map(str::to_string),
        );
    }

    /// Apply timeout policy to approvals left pending by a previous
    /// process. Called once at boot; there are no waiters to notify.
    pub fn expire_stale(&self) -> Result<usize, GatewayError> {
        let stale = self
            .db
            .stale_pending_approvals(Utc::now())
            .map_err(GatewayError::Internal)?;
        let mut expired = 0;
        for id in stale {
            if self
                .db
                .resolve_approval(&id, ApprovalStatus::Timeout)
                .map_err(GatewayError::Internal)?
            {
                if let Ok(Some(row)) = self.db.get_pending_approval(&id) {
                    self.emit_resolved(&id, &row.tool, "timeout", row.tenant_id.as_deref());
                }
                expired += 1;
            }
        }
        if expired > 0 {
            info!("expired {} stale pending approval(s) at boot", expired);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::approvals::ApprovalRule;

    fn broker() -> (Arc<Database>, Arc<ApprovalBroker>, EventBus) {
        let db = Arc::new(Database::in_memory().unwrap());
        let events = EventBus::default();
        let broker = Arc::new(ApprovalBroker::new(db.clone(), events.clone()));
        (db, broker, events)
    }

    fn rule(tool: &str, require: bool, auto: bool, timeout_sec: u64, on_timeout: OnTimeout) -> ApprovalRule {
        ApprovalRule {
            tenant_id: None,
            tool_name: tool.into(),
            auto_approve: auto,
            require_approval: require,
            timeout_sec,
            on_timeout,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_no_rule_allows() {
        let (_db, broker, _events) = broker();
        broker
            .gate(None, "agent-1", "web_browse", &json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_auto_approve_short_circuits_without_row() {
        let (db, broker, _events) = broker();
        db.upsert_approval_rule(&rule("run_script", true, true, 60, OnTimeout::Reject))
            .unwrap();
        broker
            .gate(None, "agent-1", "run_script", &json!({"script": "ls"}))
            .await
            .unwrap();
        // No pending row was created.
        assert!(db.stale_pending_approvals(Utc::now() + chrono::Duration::days(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operator_approval_unblocks_caller() {
        let (db, broker, events) = broker();
        db.upsert_approval_rule(&rule("run_script", true, false, 60, OnTimeout::Reject))
            .unwrap();
        let mut rx = events.subscribe();

        let gate_broker = broker.clone();
        let gate = tokio::spawn(async move {
            gate_broker
                .gate(Some("t1"), "agent-1", "run_script", &json!({"script": "ls"}))
                .await
        });

        // Pick up the approval id from the emitted event.
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "approval:required");
        let id = event.payload["id"].as_str().unwrap().to_string();

        assert_eq!(broker.approve(&id).unwrap(), ApprovalStatus::Approved);
        gate.await.unwrap().unwrap();

        let resolved = rx.recv().await.unwrap();
        assert_eq!(resolved.name, "approval:resolved");
        assert_eq!(resolved.payload["resolution"], "approved");
    }

    #[tokio::test]
    async fn test_operator_rejection_surfaces_error() {
        let (db, broker, events) = broker();
        db.upsert_approval_rule(&rule("run_script", true, false, 60, OnTimeout::Reject))
            .unwrap();
        let mut rx = events.subscribe();

        let gate_broker = broker.clone();
        let gate = tokio::spawn(async move {
            gate_broker
                .gate(None, "agent-1", "run_script", &json!({}))
                .await
        });
        let id = rx.recv().await.unwrap().payload["id"]
            .as_str()
            .unwrap()
            .to_string();
        broker.reject(&id).unwrap();

        let err = gate.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::ApprovalRejected(_)));
        assert!(err.is_loop_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_reject_policy() {
        let (db, broker, _events) = broker();
        db.upsert_approval_rule(&rule("run_script", true, false, 2, OnTimeout::Reject))
            .unwrap();

        let err = broker
            .gate(None, "agent-1", "run_script", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ApprovalTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_approve_policy() {
        let (db, broker, _events) = broker();
        db.upsert_approval_rule(&rule("git_commit_push", true, false, 2, OnTimeout::Approve))
            .unwrap();
        broker
            .gate(None, "agent-1", "git_commit_push", &json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolving_terminal_approval_is_noop() {
        let (db, broker, events) = broker();
        db.upsert_approval_rule(&rule("run_script", true, false, 60, OnTimeout::Reject))
            .unwrap();
        let mut rx = events.subscribe();
        let gate_broker = broker.clone();
        let gate = tokio::spawn(async move {
            gate_broker
                .gate(None, "agent-1", "run_script", &json!({}))
                .await
        });
        let id = rx.recv().await.unwrap().payload["id"]
            .as_str()
            .unwrap()
            .to_string();

        broker.approve(&id).unwrap();
        gate.await.unwrap().unwrap();
        // Late reject does not overwrite the terminal state.
        assert_eq!(broker.reject(&id).unwrap(), ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_boot_expiry_of_stale_rows() {
        let (db, broker, _events) = broker();
        db.insert_pending_approval(&PendingApproval {
            id: "ap-stale".into(),
            tenant_id: None,
            agent_id: "agent-1".into(),
            tool: "run_script".into(),
            input: json!({}),
            created_at: Utc::now() - chrono::Duration::hours(2),
            expires_at: Utc::now() - chrono::Duration::hours(1),
            status: ApprovalStatus::Pending,
        })
        .unwrap();

        assert_eq!(broker.expire_stale().unwrap(), 1);
        assert_eq!(
            db.get_pending_approval("ap-stale").unwrap().unwrap().status,
            ApprovalStatus::Timeout
        );
        // Second sweep finds nothing.
        assert_eq!(broker.expire_stale().unwrap(), 0);
    }
}
