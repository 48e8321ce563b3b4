use thiserror::Error;

/// Classified provider failure. Retryability drives the fallback chain:
/// network trouble, 5xx, rate limits (429) and vendor overload (529)
/// are worth another attempt; everything else is not.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (429)")]
    RateLimit { retry_after: Option<u64> },

    #[error("provider overloaded (529)")]
    Overloaded,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    Request { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimit { .. } | Self::Overloaded | Self::Server { .. }
        )
    }

    /// Classify a non-2xx HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_api_message(body).unwrap_or_else(|| truncate(body, 300));
        match status {
            429 => Self::RateLimit { retry_after: None },
            529 => Self::Overloaded,
            s if s >= 500 => Self::Server { status: s, message },
            s => Self::Request { status: s, message },
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

fn extract_api_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = json.get("error")?;
    let message = error.get("message").and_then(|m| m.as_str())?;
    Some(message.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProviderError::from_status(429, "").is_retryable());
        assert!(ProviderError::from_status(529, "").is_retryable());
        assert!(ProviderError::from_status(500, "").is_retryable());
        assert!(ProviderError::from_status(503, "").is_retryable());
        assert!(!ProviderError::from_status(400, "").is_retryable());
        assert!(!ProviderError::from_status(401, "").is_retryable());
        assert!(!ProviderError::from_status(404, "").is_retryable());
        assert!(ProviderError::Network("connection refused".into()).is_retryable());
        assert!(!ProviderError::Malformed("no choices".into()).is_retryable());
    }

    #[test]
    fn test_api_error_message_extracted() {
        let body = r#"{"error": {"type": "invalid_request_error", "message": "model not found"}}"#;
        let err = ProviderError::from_status(404, body);
        assert!(err.to_string().contains("model not found"));
    }

    #[test]
    fn test_plain_body_truncated() {
        let body = "x".repeat(1000);
        let err = ProviderError::from_status(400, &body);
        assert!(err.to_string().len() < 500);
    }
}
