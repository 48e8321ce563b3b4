use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use url::Url;

use crate::tools::{RiskClass, Tool, ToolContext, ToolResult};
use crate::utils::url_security::validate_fetch_url;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_BODY_CHARS: usize = 20_000;

/// Generic HTTP client exposed to the model.
pub struct HttpRequestTool {
    client: Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Separated from `execute` so tests can drive it with loopback
    /// wiremock URLs; `execute` vets the URL first.
    async fn send_request(&self, url: Url, params: &Value) -> anyhow::Result<ToolResult> {
        let method = params["method"].as_str().unwrap_or("GET");
        let mut request = match method {
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.get(url),
        };
        if let Some(headers) = params["headers"].as_object() {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        if let Some(body) = params["body"].as_str() {
            request = request.body(body.to_string());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let body = crate::utils::truncate_chars(&body, MAX_BODY_CHARS);
                Ok(ToolResult::new(format!("HTTP {status}\n{body}")))
            }
            Err(e) => Ok(ToolResult::error(format!("Request failed: {e}"))),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP request (GET/POST/PUT/PATCH/DELETE) and return status and body"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]},
                "url": {"type": "string"},
                "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                "body": {"type": "string"}
            },
            "required": ["method", "url"]
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::Medium
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let url = params["url"].as_str().unwrap_or_default();
        // Scheme and SSRF vetting before anything leaves the process.
        let parsed = match validate_fetch_url(url) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(ToolResult::error(e)),
        };
        self.send_request(parsed, &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&server)
            .await;

        let tool = HttpRequestTool::new();
        let url = Url::parse(&format!("{}/data", server.uri())).unwrap();
        let result = tool
            .send_request(url, &json!({"method": "GET"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.content.starts_with("HTTP 200"));
        assert!(result.content.contains("payload"));
    }

    #[tokio::test]
    async fn test_post_forwards_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-custom", "yes"))
            .and(body_string("hello"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let tool = HttpRequestTool::new();
        let url = Url::parse(&format!("{}/submit", server.uri())).unwrap();
        let result = tool
            .send_request(
                url,
                &json!({
                    "method": "POST",
                    "headers": {"x-custom": "yes"},
                    "body": "hello"
                }),
            )
            .await
            .unwrap();
        assert!(result.content.starts_with("HTTP 201"));
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let tool = HttpRequestTool::new();
        let result = tool
            .execute(
                json!({"method": "GET", "url": "file:///etc/passwd"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("scheme"));
    }

    #[tokio::test]
    async fn test_execute_blocks_internal_targets() {
        let tool = HttpRequestTool::new();
        for url in [
            "http://127.0.0.1/admin",
            "http://169.254.169.254/latest/meta-data/",
            "http://192.168.1.1/router",
            "http://[::1]:6379/",
        ] {
            let result = tool
                .execute(
                    json!({"method": "GET", "url": url}),
                    &ToolContext::default(),
                )
                .await
                .unwrap();
            assert!(result.is_error, "{url} must be blocked");
            assert!(result.content.contains("not allowed"), "{url}");
        }
    }
}
