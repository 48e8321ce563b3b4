use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

use crate::tools::{Tool, ToolContext, ToolResult};
use crate::utils::url_security::validate_fetch_url;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_PAGE_CHARS: usize = 50_000;

static HTML_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<script[\s\S]*?</script>").expect("script regex compiles")
});
static HTML_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<style[\s\S]*?</style>").expect("style regex compiles"));
static HTML_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex compiles"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("whitespace regex compiles"));
static NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("newline regex compiles"));

/// Drop script/style blocks and tags, then decode HTML entities.
fn strip_tags(html: &str) -> String {
    let text = HTML_SCRIPT.replace_all(html, "");
    let text = HTML_STYLE.replace_all(&text, "");
    let text = HTML_TAGS.replace_all(&text, " ");
    html_escape::decode_html_entities(&text).to_string()
}

fn normalize(text: &str) -> String {
    let text = WHITESPACE.replace_all(text, " ");
    let text = NEWLINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Flatten a page to readable text, preferring the most content-bearing
/// region: article, then main, then body, then the whole document.
fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let region = ["article", "main", "body"].iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        document
            .select(&selector)
            .next()
            .map(|element| element.html())
    });
    match region {
        Some(fragment) => normalize(&strip_tags(&fragment)),
        None => normalize(&strip_tags(html)),
    }
}

/// Fetch a web page and return its readable text.
pub struct WebBrowseTool {
    client: Client,
    max_chars: usize,
}

impl WebBrowseTool {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .user_agent("loopgate/0.4")
                .build()
                .unwrap_or_else(|_| Client::new()),
            max_chars: MAX_PAGE_CHARS,
        }
    }

    /// Separated from `execute` so tests can drive it with loopback
    /// wiremock URLs; `execute` vets the URL first.
    async fn fetch(&self, url: Url) -> anyhow::Result<ToolResult> {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(format!("Fetch failed: {e}"))),
        };
        if !response.status().is_success() {
            return Ok(ToolResult::error(format!(
                "Fetch failed with HTTP {}",
                response.status().as_u16()
            )));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));
        let body = response.text().await.unwrap_or_default();
        let text = if is_html { extract_text(&body) } else { body };
        Ok(ToolResult::new(crate::utils::truncate_chars(
            &text,
            self.max_chars,
        )))
    }
}

impl Default for WebBrowseTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebBrowseTool {
    fn name(&self) -> &str {
        "web_browse"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return the page content as plain text"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The http(s) URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let url = params["url"].as_str().unwrap_or_default();
        // Scheme and SSRF vetting before anything leaves the process.
        let parsed = match validate_fetch_url(url) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(ToolResult::error(e)),
        };
        self.fetch(parsed).await
    }
}
