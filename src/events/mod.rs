//! In-process event fan-out. Components emit named events; the outbound
//! webhook dispatcher (and tests) subscribe. Subscribers that lag simply
//! miss events; the bus never blocks an emitter.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

pub mod names {
    pub const AGENT_RUN_START: &str = "agent:run:start";
    pub const AGENT_RUN_COMPLETE: &str = "agent:run:complete";
    pub const AGENT_RUN_ERROR: &str = "agent:run:error";
    pub const TASK_START: &str = "task:start";
    pub const TASK_COMPLETE: &str = "task:complete";
    pub const TASK_ERROR: &str = "task:error";
    pub const TASK_ITERATION: &str = "task:iteration";
    pub const APPROVAL_REQUIRED: &str = "approval:required";
    pub const APPROVAL_RESOLVED: &str = "approval:resolved";
    pub const SCHEDULER_JOB_COMPLETE: &str = "scheduler:job:complete";
    pub const MESSAGE_INCOMING: &str = "message:incoming";
    pub const MESSAGE_REPLY: &str = "message:reply";
}

#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub name: String,
    pub payload: Value,
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, name: &str, payload: Value, tenant_id: Option<String>) {
        let event = GatewayEvent {
            name: name.to_string(),
            payload,
            tenant_id,
            timestamp: Utc::now(),
        };
        // A send error only means nobody is listening right now.
        if self.tx.send(event).is_err() {
            debug!("event '{}' emitted with no subscribers", name);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(names::TASK_COMPLETE, json!({"jobId": "j1"}), Some("t1".into()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "task:complete");
        assert_eq!(event.payload["jobId"], "j1");
        assert_eq!(event.tenant_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(names::AGENT_RUN_START, json!({}), None);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(names::APPROVAL_REQUIRED, json!({"id": "ap-1"}), None);
        assert_eq!(a.recv().await.unwrap().name, "approval:required");
        assert_eq!(b.recv().await.unwrap().name, "approval:required");
    }
}
