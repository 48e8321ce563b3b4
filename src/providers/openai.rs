use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use super::base::{
    ChatMessage, Completion, CompletionRequest, Provider, StopReason, ToolCallRequest,
};
use super::errors::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const CONNECT_TIMEOUT_SECS: u64 = 30;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// OpenAI-compatible `chat/completions` adapter. Doubles as the local
/// adapter via `base_url`; with `supports_tools` off, tool traffic is
/// folded into plain text.
pub struct OpenAiProvider {
    name: String,
    api_key: String,
    model: String,
    base_url: String,
    supports_tools: bool,
    extra_body: Option<Value>,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>, extra_body: Option<Value>) -> Self {
        Self::with_base_url(
            "openai",
            api_key,
            model,
            DEFAULT_BASE_URL.to_string(),
            false,
            extra_body,
        )
    }

    /// Local/self-hosted OpenAI-compatible endpoint.
    pub fn local(base_url: String, model: Option<String>, extra_body: Option<Value>) -> Self {
        Self::with_base_url("local", String::new(), model, base_url, false, extra_body)
    }

    pub fn with_base_url(
        name: &str,
        api_key: String,
        model: Option<String>,
        base_url: String,
        supports_tools: bool,
        extra_body: Option<Value>,
    ) -> Self {
        Self {
            name: name.to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url,
            supports_tools,
            extra_body,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_messages(&self, system: &str, messages: &[ChatMessage]) -> Vec<Value> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            out.push(json!({"role": "system", "content": system}));
        }
        for msg in messages {
            match msg.role.as_str() {
                "assistant" if self.supports_tools => {
                    let mut m = json!({"role": "assistant", "content": msg.content});
                    if let Some(ref calls) = msg.tool_calls {
                        m["tool_calls"] = json!(
                            calls
                                .iter()
                                .map(|tc| json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    },
                                }))
                                .collect::<Vec<_>>()
                        );
                    }
                    out.push(m);
                }
                "assistant" => {
                    // Fold tool calls into readable text for models without
                    // native tool support.
                    let mut content = msg.content.clone();
                    for tc in msg.tool_calls.iter().flatten() {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(&format!("[tool call {}: {}]", tc.name, tc.arguments));
                    }
                    out.push(json!({"role": "assistant", "content": content}));
                }
                "tool" if self.supports_tools => {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": msg.tool_use_id,
                        "content": msg.content,
                    }));
                }
                "tool" => {
                    out.push(json!({
                        "role": "user",
                        "content": format!(
                            "[tool result{}] {}",
                            if msg.is_error { " (error)" } else { "" },
                            msg.content
                        ),
                    }));
                }
                _ => out.push(json!({"role": msg.role, "content": msg.content})),
            }
        }
        out
    }

    fn parse_response(json: &Value) -> Result<Completion, ProviderError> {
        let choice = json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| ProviderError::Malformed("no choices in response".into()))?;

        let message = &choice["message"];
        let content = message["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut tool_calls = Vec::new();
        for tc in message["tool_calls"].as_array().into_iter().flatten() {
            let function = &tc["function"];
            let arguments = function["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCallRequest {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: function["name"].as_str().unwrap_or("").to_string(),
                arguments,
            });
        }

        let stop_reason = match choice["finish_reason"].as_str() {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::Length,
            _ => {
                if tool_calls.is_empty() {
                    StopReason::End
                } else {
                    StopReason::ToolUse
                }
            }
        };

        Ok(Completion {
            content,
            tool_calls,
            input_tokens: json["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            output_tokens: json["usage"]["completion_tokens"].as_i64().unwrap_or(0),
            stop_reason,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": req.max_tokens,
            "messages": self.build_messages(req.system, req.messages),
        });
        if self.supports_tools && !req.tools.is_empty() {
            body["tools"] = json!(
                req.tools
                    .iter()
                    .map(|t| json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    }))
                    .collect::<Vec<_>>()
            );
        }
        if let Some(Value::Object(ref extra)) = self.extra_body {
            for (key, value) in extra {
                body[key.as_str()] = value.clone();
            }
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
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
