//! Agent-to-agent tools exposed to primary agents: delegation to role
//! sub-agents, fabric-wide broadcast and agent discovery.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::bus::{A2aMessage, AgentBus, AgentIdentity, AgentRole, BROADCAST, MessageKind};
use crate::errors::GatewayError;
use crate::tools::{RiskClass, Tool, ToolContext, ToolResult};

/// Spawns a role-bound sub-agent and returns its final text. Implemented
/// by the sub-agent spawner; injected as a trait so the tool layer stays
/// testable without a live engine.
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(
        &self,
        role: &str,
        task: &str,
        context: Option<&str>,
        ctx: &ToolContext,
    ) -> Result<String, GatewayError>;
}

pub struct DelegateTaskTool {
    delegator: Arc<dyn Delegator>,
}

impl DelegateTaskTool {
    pub fn new(delegator: Arc<dyn Delegator>) -> Self {
        Self { delegator }
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Delegate a task to a specialized sub-agent (planner, builder, reviewer or researcher) and return its result"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "role": {
                    "type": "string",
                    "enum": ["planner", "builder", "reviewer", "researcher"],
                    "description": "Which specialist to spawn"
                },
                "task": {"type": "string", "description": "What the sub-agent should do"},
                "context": {"type": "string", "description": "Optional extra context"}
            },
            "required": ["role", "task"]
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::Medium
    }

    fn execution_timeout(&self) -> std::time::Duration {
        // Sub-agents run their own loop; give them room.
        std::time::Duration::from_secs(600)
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let role = params["role"].as_str().unwrap_or_default();
        let task = params["task"].as_str().unwrap_or_default();
        let context = params["context"].as_str();

        match self.delegator.delegate(role, task, context, ctx).await {
            Ok(text) => Ok(ToolResult::new(text)),
            Err(e) if e.is_loop_recoverable() => Ok(ToolResult::error(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct BroadcastEventTool {
    bus: Arc<AgentBus>,
}

impl BroadcastEventTool {
    pub fn new(bus: Arc<AgentBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for BroadcastEventTool {
    fn name(&self) -> &str {
        "broadcast_event"
    }

    fn description(&self) -> &str {
        "Broadcast an event message to every other registered agent"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "description": "Event name"},
                "content": {"type": "string", "description": "Event payload text"}
            },
            "required": ["action", "content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let action = params["action"].as_str().unwrap_or("event");
        let content = params["content"].as_str().unwrap_or_default();

        let from = AgentIdentity {
            id: ctx.agent_id.clone(),
            role: AgentRole::Primary,
            tenant_id: ctx.tenant_id.clone(),
            capabilities: Vec::new(),
        };
        let mut msg = A2aMessage::new(MessageKind::Event, from, BROADCAST, action, content);
        msg.conversation_id = ctx.conversation_id;
        self.bus.send(msg).await?;
        Ok(ToolResult::new(format!("Broadcast '{action}' sent")))
    }
}

pub struct QueryAgentsTool {
    bus: Arc<AgentBus>,
}

impl QueryAgentsTool {
    pub fn new(bus: Arc<AgentBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for QueryAgentsTool {
    fn name(&self) -> &str {
        "query_agents"
    }

    fn description(&self) -> &str {
        "List the agents currently registered on the bus"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "role": {"type": "string", "description": "Optional role filter"}
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let role_filter = params["role"].as_str().and_then(AgentRole::parse);
        let agents = self.bus.list_agents().await;
        let rows: Vec<Value> = agents
            .iter()
            .filter(|a| role_filter.is_none_or(|r| a.role == r))
            .filter(|a| {
                ctx.tenant_id.is_none() || a.tenant_id == ctx.tenant_id
            })
            .map(|a| json!({"id": a.id, "role": a.role.as_str()}))
            .collect();
        Ok(ToolResult::new(serde_json::to_string_pretty(&rows)?))
    }
}
