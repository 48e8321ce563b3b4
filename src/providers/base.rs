use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ProviderError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One turn of provider-facing conversation state.
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_use_id: Option<String>,
    /// For tool results: whether the tool failed.
    pub is_error: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_use_id: Some(tool_use_id.into()),
            is_error,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    End,
    ToolUse,
    Length,
    Cancelled,
}

/// Result of one chat completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub stop_reason: StopReason,
}

impl Completion {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolDefinition],
    pub max_tokens: u32,
}

/// Uniform "chat completion with tools" abstraction over LLM vendors.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    async fn complete(&self, req: CompletionRequest<'_>) -> Result<Completion, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let user = ChatMessage::user("hi");
        assert_eq!(user.role, "user");
        assert!(user.tool_calls.is_none());

        let result = ChatMessage::tool_result("tc_1", "oops", true);
        assert_eq!(result.role, "tool");
        assert!(result.is_error);
        assert_eq!(result.tool_use_id.as_deref(), Some("tc_1"));
    }

    #[test]
    fn test_has_tool_calls() {
        let mut completion = Completion {
            content: Some("text".into()),
            tool_calls: vec![],
            input_tokens: 1,
            output_tokens: 1,
            stop_reason: StopReason::End,
        };
        assert!(!completion.has_tool_calls());
        completion.tool_calls.push(ToolCallRequest {
            id: "tc_1".into(),
            name: "web_browse".into(),
            arguments: serde_json::json!({}),
        });
        assert!(completion.has_tool_calls());
    }
}
