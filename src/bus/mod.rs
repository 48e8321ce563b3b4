//! In-process agent-to-agent fabric: registered identities with ordered
//! inboxes, persisted sends, broadcast fan-out and request/response
//! correlation by message id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

pub use crate::store::a2a::{
    A2aMessage, AgentIdentity, AgentRole, BROADCAST, MessageKind, MessageStatus,
};
use crate::errors::GatewayError;
use crate::store::Database;

/// Default wait for `request_and_wait`.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;

const INBOX_CAPACITY: usize = 64;

struct AgentEntry {
    identity: AgentIdentity,
    inbox: mpsc::Sender<A2aMessage>,
}

pub struct AgentBus {
    db: Arc<Database>,
    /// Guarded by an async mutex: holding it across the non-blocking
    /// `try_send` calls makes send-accept order equal inbox order.
    agents: Mutex<HashMap<String, AgentEntry>>,
    waiters: std::sync::Mutex<HashMap<String, oneshot::Sender<A2aMessage>>>,
}

impl AgentBus {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            agents: Mutex::new(HashMap::new()),
            waiters: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register an agent and hand back its inbox.
    pub async fn register_agent(&self, identity: AgentIdentity) -> mpsc::Receiver<A2aMessage> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut agents = self.agents.lock().await;
        agents.insert(
            identity.id.clone(),
            AgentEntry {
                identity,
                inbox: tx,
            },
        );
        rx
    }

    pub async fn unregister_agent(&self, id: &str) {
        self.agents.lock().await.remove(id);
    }

    pub async fn active_count(&self, tenant_id: Option<&str>, role: AgentRole) -> usize {
        let agents = self.agents.lock().await;
        agents
            .values()
            .filter(|entry| entry.identity.role == role)
            .filter(|entry| entry.identity.tenant_id.as_deref() == tenant_id)
            .count()
    }

    pub async fn list_agents(&self) -> Vec<AgentIdentity> {
        let agents = self.agents.lock().await;
        let mut out: Vec<AgentIdentity> =
            agents.values().map(|entry| entry.identity.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Persist and route one message. Broadcast (`to = "*"`) reaches every
    /// registered agent except the sender. Undeliverable direct sends stay
    /// `pending` until their TTL expires them.
    pub async fn send(&self, msg: A2aMessage) -> Result<(), GatewayError> {
        self.db
            .insert_a2a_message(&msg)
            .map_err(GatewayError::Internal)?;

        let agents = self.agents.lock().await;
        if msg.to == BROADCAST {
            let mut delivered = 0usize;
            for entry in agents.values() {
                if entry.identity.id == msg.from.id {
                    continue;
                }
                if entry.inbox.try_send(msg.clone()).is_ok() {
                    delivered += 1;
                }
            }
            drop(agents);
            debug!("broadcast {} delivered to {} agent(s)", msg.id, delivered);
            let status = if delivered > 0 {
                MessageStatus::Delivered
            } else {
                MessageStatus::Pending
            };
            self.db
                .set_a2a_status(&msg.id, status)
                .map_err(GatewayError::Internal)?;
            return Ok(());
        }

        match agents.get(&msg.to) {
            Some(entry) => {
                let result = entry.inbox.try_send(msg.clone());
                drop(agents);
                match result {
                    Ok(()) => self
                        .db
                        .set_a2a_status(&msg.id, MessageStatus::Delivered)
                        .map_err(GatewayError::Internal)?,
                    Err(e) => {
                        warn!("inbox for {} rejected message {}: {}", msg.to, msg.id, e);
                        self.db
                            .set_a2a_status(&msg.id, MessageStatus::Failed)
                            .map_err(GatewayError::Internal)?;
                    }
                }
            }
            None => {
                drop(agents);
                debug!("no recipient '{}' for message {}, left pending", msg.to, msg.id);
            }
        }
        Ok(())
    }

    /// Send a request and block until a response correlated via `reply_to`
    /// arrives through [`Self::mark_processed`], or the timeout elapses.
    pub async fn request_and_wait(
        &self,
        msg: A2aMessage,
        timeout_ms: Option<u64>,
    ) -> Result<A2aMessage, GatewayError> {
        let timeout_ms = timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let request_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id.clone(), tx);

        if let Err(e) = self.send(msg).await {
            self.waiters
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.waiters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&request_id);
                Err(GatewayError::A2aTimeout(timeout_ms))
            }
        }
    }

    /// Mark a message processed, optionally publishing a response. The
    /// response's `reply_to` resolves a matching continuation. Idempotent:
    /// re-processing an already processed id is a no-op.
    pub async fn mark_processed(
        &self,
        id: &str,
        mut response: Option<A2aMessage>,
    ) -> Result<(), GatewayError> {
        let newly = self
            .db
            .mark_a2a_processed(id)
            .map_err(GatewayError::Internal)?;
        if !newly {
            debug!("message {} already processed", id);
            return Ok(());
        }

        if let Some(ref mut resp) = response {
            if resp.reply_to.is_none() {
                resp.reply_to = Some(id.to_string());
            }
            resp.processed_at = Some(Utc::now());
            resp.status = MessageStatus::Processed;
            self.db
                .insert_a2a_message(resp)
                .map_err(GatewayError::Internal)?;

            if let Some(reply_to) = resp.reply_to.clone() {
                let waiter = self
                    .waiters
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&reply_to);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(resp.clone());
                }
            }
        }
        Ok(())
    }

    /// Flip pending messages past their TTL to `expired`.
    pub fn expire_overdue(&self) -> Result<usize, GatewayError> {
        self.db
            .expire_overdue_a2a(Utc::now())
            .map_err(GatewayError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (Arc<Database>, AgentBus) {
        let db = Arc::new(Database::in_memory().unwrap());
        (db.clone(), AgentBus::new(db))
    }

    fn identity(role: AgentRole) -> AgentIdentity {
        AgentIdentity::new(role, Some("t1".into()))
    }

    fn request(from: &AgentIdentity, to: &str, content: &str) -> A2aMessage {
        A2aMessage::new(MessageKind::Request, from.clone(), to, "delegate_task", content)
    }

    #[tokio::test]
    async fn test_direct_send_delivers_and_persists() {
        let (db, bus) = bus();
        let sender = identity(AgentRole::Primary);
        let receiver = identity(AgentRole::Planner);
        let mut inbox = bus.register_agent(receiver.clone()).await;

        let msg = request(&sender, &receiver.id, "plan the sprint");
        let id = msg.id.clone();
        bus.send(msg).await.unwrap();

        let got = inbox.recv().await.unwrap();
        assert_eq!(got.content, "plan the sprint");
        assert_eq!(
            db.get_a2a_message(&id).unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_inbox_order_matches_send_accept_order() {
        let (_db, bus) = bus();
        let sender = identity(AgentRole::Primary);
        let receiver = identity(AgentRole::Builder);
        let mut inbox = bus.register_agent(receiver.clone()).await;

        for i in 0..10 {
            bus.send(request(&sender, &receiver.id, &format!("msg-{i}")))
                .await
                .unwrap();
        }
        for i in 0..10 {
            assert_eq!(inbox.recv().await.unwrap().content, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (_db, bus) = bus();
        let sender = identity(AgentRole::Primary);
        let mut sender_inbox = bus.register_agent(sender.clone()).await;
        let mut a = bus.register_agent(identity(AgentRole::Planner)).await;
        let mut b = bus.register_agent(identity(AgentRole::Reviewer)).await;

        let mut msg = request(&sender, BROADCAST, "status check");
        msg.kind = MessageKind::Event;
        bus.send(msg).await.unwrap();

        assert_eq!(a.recv().await.unwrap().content, "status check");
        assert_eq!(b.recv().await.unwrap().content, "status check");
        assert!(sender_inbox.try_recv().is_err(), "sender must not self-receive");
    }

    #[tokio::test]
    async fn test_request_and_wait_resolves_on_reply() {
        let (_db, bus) = bus();
        let bus = Arc::new(bus);
        let parent = identity(AgentRole::Primary);
        let child = identity(AgentRole::Planner);
        let mut child_inbox = bus.register_agent(child.clone()).await;

        let responder_bus = bus.clone();
        let responder_child = child.clone();
        tokio::spawn(async move {
            let req = child_inbox.recv().await.unwrap();
            let mut resp = A2aMessage::new(
                MessageKind::Response,
                responder_child,
                req.from.id.clone(),
                "delegate_task",
                "here is the outline",
            );
            resp.reply_to = Some(req.id.clone());
            responder_bus.mark_processed(&req.id, Some(resp)).await.unwrap();
        });

        let response = bus
            .request_and_wait(request(&parent, &child.id, "outline"), Some(5_000))
            .await
            .unwrap();
        assert_eq!(response.content, "here is the outline");
        assert_eq!(response.from.role, AgentRole::Planner);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_and_wait_times_out() {
        let (_db, bus) = bus();
        let parent = identity(AgentRole::Primary);
        let silent = identity(AgentRole::Researcher);
        let _inbox = bus.register_agent(silent.clone()).await;

        let err = bus
            .request_and_wait(request(&parent, &silent.id, "anything?"), Some(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::A2aTimeout(1_000)));
    }

    #[tokio::test]
    async fn test_mark_processed_idempotent_and_stamps() {
        let (db, bus) = bus();
        let sender = identity(AgentRole::Primary);
        let msg = request(&sender, "nobody", "hello");
        let id = msg.id.clone();
        bus.send(msg).await.unwrap();

        bus.mark_processed(&id, None).await.unwrap();
        let row = db.get_a2a_message(&id).unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Processed);
        assert!(row.processed_at.unwrap() >= row.created_at);

        // Second call: no-op, not an error.
        bus.mark_processed(&id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_role_concurrency_counting() {
        let (_db, bus) = bus();
        let _a = bus.register_agent(identity(AgentRole::Planner)).await;
        let _b = bus.register_agent(identity(AgentRole::Planner)).await;
        let _c = bus
            .register_agent(AgentIdentity::new(AgentRole::Planner, Some("t2".into())))
            .await;

        assert_eq!(bus.active_count(Some("t1"), AgentRole::Planner).await, 2);
        assert_eq!(bus.active_count(Some("t2"), AgentRole::Planner).await, 1);
        assert_eq!(bus.active_count(Some("t1"), AgentRole::Builder).await, 0);
    }

    #[tokio::test]
    async fn test_unregister_removes_from_counts() {
        let (_db, bus) = bus();
        let agent = identity(AgentRole::Reviewer);
        let _inbox = bus.register_agent(agent.clone()).await;
        assert_eq!(bus.active_count(Some("t1"), AgentRole::Reviewer).await, 1);
        bus.unregister_agent(&agent.id).await;
        assert_eq!(bus.active_count(Some("t1"), AgentRole::Reviewer).await, 0);
    }
}
