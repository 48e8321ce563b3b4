use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use super::base::{
    ChatMessage, Completion, CompletionRequest, Provider, StopReason, ToolCallRequest,
};
use super::errors::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Native tool-calling adapter speaking the Anthropic messages API.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    base_url: String,
    /// Opaque per-tenant overrides merged into the request body.
    extra_body: Option<Value>,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: Option<String>, extra_body: Option<Value>) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL.to_string(), extra_body)
    }

    pub fn with_base_url(
        api_key: String,
        model: Option<String>,
        base_url: String,
        extra_body: Option<Value>,
    ) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url,
            extra_body,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_messages(messages: &[ChatMessage]) -> Vec<Value> {
        let mut out = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg.role.as_str() {
                "assistant" => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    for tc in msg.tool_calls.iter().flatten() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    out.push(json!({"role": "assistant", "content": blocks}));
                }
                "tool" => {
                    out.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_use_id,
                            "content": msg.content,
                            "is_error": msg.is_error,
                        }],
                    }));
                }
                _ => {
                    out.push(json!({"role": "user", "content": msg.content}));
                }
            }
        }
        out
    }

    fn parse_response(json: &Value) -> Result<Completion, ProviderError> {
        let blocks = json["content"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing content array".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    text.push_str(block["text"].as_str().unwrap_or(""));
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallRequest {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block["input"].clone(),
                    });
                }
                _ => {}
            }
        }

        let stop_reason = match json["stop_reason"].as_str() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::Length,
            _ => StopReason::End,
        };

        Ok(Completion {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            input_tokens: json["usage"]["input_tokens"].as_i64().unwrap_or(0),
            output_tokens: json["usage"]["output_tokens"].as_i64().unwrap_or(0),
            stop_reason,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": req.max_tokens,
            "messages": Self::build_messages(req.messages),
        });
        if !req.system.is_empty() {
            body["system"] = json!(req.system);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(
                req.tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    }))
                    .collect::<Vec<_>>()
            );
        }
        if let Some(Value::Object(ref extra)) = self.extra_body {
            for (key, value) in extra {
                body[key.as_str()] = value.clone();
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status().as_u16();
        let raw = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        if status != 200 {
            return Err(ProviderError::from_status(status, &raw));
        }

        let json: Value = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Malformed(format!("invalid JSON: {e}")))?;
        Self::parse_response(&json)
    }
}
