pub mod builtin;
pub mod registry;
pub mod skills;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

/// Per-execution context handed to tool handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tenant_id: Option<String>,
    pub agent_id: String,
    pub conversation_id: Option<i64>,
    pub cancel: CancellationToken,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            tenant_id: None,
            agent_id: "agent-test".into(),
            conversation_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A named invocable capability with a JSON Schema input contract.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the input object.
    fn parameters(&self) -> Value;

    fn risk_class(&self) -> RiskClass {
        RiskClass::Low
    }

    fn container_compatible(&self) -> bool {
        true
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_ordering() {
        assert!(RiskClass::Low < RiskClass::Medium);
        assert!(RiskClass::High < RiskClass::Critical);
    }

    #[test]
    fn test_result_display() {
        let result = ToolResult::new("42");
        assert_eq!(result.to_string(), "42");
        assert!(!result.is_error);
        assert!(ToolResult::error("boom").is_error);
    }

    #[test]
    fn test_risk_serde() {
        assert_eq!(serde_json::to_string(&RiskClass::Critical).unwrap(), "\"critical\"");
    }
}
