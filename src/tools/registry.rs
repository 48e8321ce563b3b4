use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{Tool, ToolContext, ToolResult};
use crate::approval::ApprovalBroker;
use crate::providers::base::ToolDefinition;
use crate::utils::truncate_chars;

const MAX_RESULT_CHARS: usize = 10_000;

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
    /// Set for dynamically loaded skills so hot reload can replace them.
    from_skill: bool,
}

/// Named tool catalog: schema validation, per-tenant allow-list filtering
/// and approval gating in front of every execution.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    broker: Option<Arc<ApprovalBroker>>,
}

impl ToolRegistry {
    pub fn new(broker: Option<Arc<ApprovalBroker>>) -> Self {
        Self {
            tools: HashMap::new(),
            broker,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.register_inner(tool, false);
    }

    pub fn register_skill(&mut self, tool: Arc<dyn Tool>) {
        self.register_inner(tool, true);
    }

    fn register_inner(&mut self, tool: Arc<dyn Tool>, from_skill: bool) {
        let name = tool.name().to_string();
        let schema = tool.parameters();
        let validator = match jsonschema::validator_for(&schema) {
            Ok(v) => v,
            Err(e) => {
                error!("tool '{}' has an invalid input schema, skipping: {}", name, e);
                return;
            }
        };
        if self.tools.contains_key(&name) {
            warn!("tool registry: overwriting duplicate tool '{}'", name);
        }
        self.tools.insert(
            name,
            RegisteredTool {
                tool,
                validator,
                from_skill,
            },
        );
    }

    /// Drop every skill-sourced tool; called before a hot reload re-adds
    /// the current set.
    pub fn clear_skills(&mut self) {
        self.tools.retain(|_, entry| !entry.from_skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.tool.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions exposed to the LLM: the allow-list filters, the
    /// `mandatory` names are always included. An empty allow-list means
    /// everything is visible.
    pub fn definitions(
        &self,
        allow_list: Option<&[String]>,
        mandatory: &[&str],
    ) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|entry| {
                let name = entry.tool.name();
                if mandatory.contains(&name) {
                    return true;
                }
                match allow_list {
                    Some(list) if !list.is_empty() => list.iter().any(|n| n == name),
                    _ => true,
                }
            })
            .map(|entry| ToolDefinition {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Resolve and validate a call without executing it. Returns the
    /// handler plus the broker so the caller can run the async phase
    /// without borrowing the registry: nested tool execution
    /// (`delegate_task` spawning a sub-loop) re-enters the registry lock
    /// otherwise.
    pub fn prepare(
        &self,
        name: &str,
        params: &Value,
    ) -> Result<(Arc<dyn Tool>, Option<Arc<ApprovalBroker>>), ToolResult> {
        let Some(entry) = self.tools.get(name) else {
            warn!("unknown tool requested: '{}'", name);
            return Err(ToolResult::error(format!("Unknown tool '{name}'")));
        };
        if let Err(validation) = entry.validator.validate(params) {
            debug!("tool '{}' input rejected: {}", name, validation);
            return Err(ToolResult::error(format!(
                "Invalid input for '{}': {} (at {})",
                name, validation, validation.instance_path()
            )));
        }
        Ok((entry.tool.clone(), self.broker.clone()))
    }

    /// Gate and run a prepared call. Every recoverable failure comes back
    /// as `ToolResult { is_error: true }` so the loop can show it to the
    /// model; only systemic errors propagate as `Err`.
    pub async fn run_prepared(
        tool: Arc<dyn Tool>,
        broker: Option<Arc<ApprovalBroker>>,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        let name = tool.name().to_string();
        if let Some(broker) = broker
            && let Err(e) = broker
                .gate(ctx.tenant_id.as_deref(), &ctx.agent_id, &name, &params)
                .await
        {
            if e.is_loop_recoverable() {
                return Ok(ToolResult::error(e.to_string()));
            }
            return Err(e.into());
        }

        let result = Self::execute_with_guards(tool, params, ctx).await?;
        Ok(ToolResult {
            content: truncate_chars(&result.content, MAX_RESULT_CHARS),
            is_error: result.is_error,
        })
    }

    /// Convenience for callers holding the registry directly (tests, one
    /// shot invocations). Shared callers should `prepare` under the lock
    /// and `run_prepared` outside it.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
        match self.prepare(name, &params) {
            Ok((tool, broker)) => Self::run_prepared(tool, broker, params, ctx).await,
            Err(result) => Ok(result),
        }
    }

    /// Run the handler in a spawned task with timeout and panic isolation.
    async fn execute_with_guards(
        tool: Arc<dyn Tool>,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        let name = tool.name().to_string();
        let timeout = tool.execution_timeout();
        let ctx = ctx.clone();
        let handle =
            tokio::spawn(
                async move { tokio::time::timeout(timeout, tool.execute(params, &ctx)).await },
            );

        match handle.await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => {
                warn!("tool '{}' failed: {:#}", name, e);
                Ok(ToolResult::error(format!("Tool '{name}' failed: {e}")))
            }
            Ok(Err(_elapsed)) => {
                warn!("tool '{}' timed out after {:?}", name, timeout);
                Ok(ToolResult::error(format!(
                    "Tool '{}' timed out after {}s",
                    name,
                    timeout.as_secs()
                )))
            }
            Err(join_err) if join_err.is_panic() => {
                error!("tool '{}' panicked: {:?}", name, join_err);
                Ok(ToolResult::error(format!("Tool '{name}' crashed unexpectedly")))
            }
            Err(_) => Err(anyhow::anyhow!("tool '{name}' was cancelled")),
        }
    }
}
