//! Output routing for scheduled job results: channel, webhook, file and
//! email destinations.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{Output, ScheduledJob};
use crate::utils::{atomic_write, safe_filename};

/// Webhook output POST timeout (distinct from the 15 s dispatcher).
const WEBHOOK_OUTPUT_TIMEOUT_SECS: u64 = 30;

/// Default per-message channel limit.
pub const CHANNEL_MESSAGE_LIMIT: usize = 4000;

/// Delivery seam for channel adapters (messaging products live outside
/// the core).
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;
}

/// Fallback sink when no channel adapter is wired: logs the delivery.
pub struct LoggingChannelSink;

#[async_trait]
impl ChannelSink for LoggingChannelSink {
    async fn send(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        info!("channel '{}' <- {} chars", channel_id, text.len());
        Ok(())
    }
}

/// Delivery seam for the SMTP collaborator.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub struct SmtpEmailSender {
    transport: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
    from: lettre::message::Mailbox,
}

impl SmtpEmailSender {
    pub fn new(config: &crate::config::SmtpConfig) -> anyhow::Result<Self> {
        use lettre::transport::smtp::authentication::Credentials;
        let mut builder =
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&config.host)?
                .port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            from: config.from.parse()?,
        })
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        use lettre::AsyncTransport;
        let message = lettre::Message::builder()
            .from(self.from.clone())
            .to(to.parse()?)
            .subject(subject)
            .body(body.to_string())?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Stand-in when SMTP is not configured.
pub struct NoEmailSender;

#[async_trait]
impl EmailSender for NoEmailSender {
    async fn send(&self, to: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
        anyhow::bail!("email output to {to} requested but SMTP is not configured")
    }
}

/// Split a message for a channel with a hard length limit, preferring the
/// newline closest to the limit but no earlier than half of it.
pub fn split_for_channel(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest: &str = text;
    while rest.chars().count() > limit {
        let window: String = rest.chars().take(limit).collect();
        let half = window
            .char_indices()
            .nth(limit / 2)
            .map_or(0, |(byte, _)| byte);
        let split_at = match window[half..].rfind('\n') {
            Some(offset) => half + offset,
            None => window.len(),
        };
        chunks.push(rest[..split_at].trim_end().to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Confine a configured output path: absolute paths are taken as-is minus
/// traversal; relative paths land under the output directory. Every
/// component is filename-sanitized.
fn sanitize_output_path(base: &Path, configured: &str) -> PathBuf {
    let raw = Path::new(configured);
    let mut out = if raw.is_absolute() {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    for component in raw.components() {
        if let Component::Normal(part) = component {
            out.push(safe_filename(&part.to_string_lossy()));
        }
    }
    out
}

pub struct OutputRouter {
    channels: Arc<dyn ChannelSink>,
    email: Arc<dyn EmailSender>,
    http: Client,
    output_dir: PathBuf,
    channel_limit: usize,
}

impl OutputRouter {
    pub fn new(
        channels: Arc<dyn ChannelSink>,
        email: Arc<dyn EmailSender>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            channels,
            email,
            http: Client::builder()
                .timeout(Duration::from_secs(WEBHOOK_OUTPUT_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            output_dir,
            channel_limit: CHANNEL_MESSAGE_LIMIT,
        }
    }

    #[cfg(test)]
    pub fn with_channel_limit(mut self, limit: usize) -> Self {
        self.channel_limit = limit;
        self
    }

    pub async fn route(&self, job: &ScheduledJob, result: &str) -> anyhow::Result<()> {
        match job.output {
            Output::Channel { ref channel_id } => {
                for chunk in split_for_channel(result, self.channel_limit) {
                    self.channels.send(channel_id, &chunk).await?;
                }
                Ok(())
            }
            Output::Webhook { ref url } => {
                let body = json!({
                    "job": job.name,
                    "result": result,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                match self.http.post(url).json(&body).send().await {
                    Ok(response) if response.status().is_success() => Ok(()),
                    Ok(response) => {
                        // Logged, never retried.
                        warn!(
                            "job '{}' webhook output returned HTTP {}",
                            job.name,
                            response.status().as_u16()
                        );
                        Ok(())
                    }
                    Err(e) => {
                        warn!("job '{}' webhook output failed: {}", job.name, e);
                        Ok(())
                    }
                }
            }
            Output::File { ref path } => {
                let target = sanitize_output_path(&self.output_dir, path);
                let content = format!(
                    "# {}\n\nGenerated: {}\n\n---\n\n{}",
                    job.name,
                    Utc::now().to_rfc3339(),
                    result
                );
                atomic_write(&target, &content)?;
                info!("job '{}' wrote {}", job.name, target.display());
                Ok(())
            }
            Output::Email { ref to } => {
                self.email
                    .send(to, &format!("[loopgate] {}", job.name), result)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::{JobAction, Trigger};
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelSink for RecordingSink {
        async fn send(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn job(output: Output) -> ScheduledJob {
        ScheduledJob::new(
            "Digest",
            Trigger::Interval { minutes: 60 },
            JobAction {
                prompt: "x".into(),
                tenant_id: None,
                max_iterations: None,
            },
            output,
        )
    }

    #[test]
    fn test_split_short_message_untouched() {
        assert_eq!(split_for_channel("hello", 4000), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_prefers_newline_past_half() {
        // limit 20; newline at position 14 (>= 10) is the split point.
        let text = "aaaaaaaaaaaaaa\nbbbbbbbbbbbbbb";
        let chunks = split_for_channel(text, 20);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "aaaaaaaaaaaaaa");
        assert_eq!(chunks[1], "bbbbbbbbbbbbbb");
    }

    #[test]
    fn test_split_ignores_early_newline() {
        // Newline at index 2 is before half the limit; hard split instead.
        let text = format!("ab\n{}", "c".repeat(40));
        let chunks = split_for_channel(&text, 20);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].chars().count(), 20);
    }

    #[test]
    fn test_split_covers_all_content() {
        let text = (0..50)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = split_for_channel(&text, 100);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
        let rejoined = chunks.join("\n");
        assert!(rejoined.contains("line number 0"));
        assert!(rejoined.contains("line number 49"));
    }

    #[test]
    fn test_sanitize_output_path() {
        let base = Path::new("/data/outputs");
        assert_eq!(
            sanitize_output_path(base, "reports/daily.md"),
            PathBuf::from("/data/outputs/reports/daily.md")
        );
        // Traversal components are dropped.
        assert_eq!(
            sanitize_output_path(base, "../../etc/passwd"),
            PathBuf::from("/data/outputs/etc/passwd")
        );
    }

    #[tokio::test]
    async fn test_channel_output_split_and_sent() {
        let sink = Arc::new(RecordingSink {
            sent: Mutex::new(vec![]),
        });
        let tmp = tempfile::TempDir::new().unwrap();
        let router = OutputRouter::new(
            sink.clone(),
            Arc::new(NoEmailSender),
            tmp.path().to_path_buf(),
        )
        .with_channel_limit(20);

        let long = "first line of text\nsecond line of text\nthird line of text";
        router
            .route(
                &job(Output::Channel {
                    channel_id: "telegram-7".into(),
                }),
                long,
            )
            .await
            .unwrap();

        let sent = sink.sent.lock().unwrap();
        assert!(sent.len() > 1);
        assert!(sent.iter().all(|(channel, _)| channel == "telegram-7"));
    }

    #[tokio::test]
    async fn test_webhook_output_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sink"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let router = OutputRouter::new(
            Arc::new(LoggingChannelSink),
            Arc::new(NoEmailSender),
            tmp.path().to_path_buf(),
        );
        router
            .route(
                &job(Output::Webhook {
                    url: format!("{}/sink", server.uri()),
                }),
                "the result",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_output_failure_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let router = OutputRouter::new(
            Arc::new(LoggingChannelSink),
            Arc::new(NoEmailSender),
            tmp.path().to_path_buf(),
        );
        // Non-2xx is logged, not an error and never retried.
        router
            .route(
                &job(Output::Webhook {
                    url: format!("{}/sink", server.uri()),
                }),
                "the result",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_file_output_written_atomically() {
        let tmp = tempfile::TempDir::new().unwrap();
        let router = OutputRouter::new(
            Arc::new(LoggingChannelSink),
            Arc::new(NoEmailSender),
            tmp.path().to_path_buf(),
        );
        router
            .route(
                &job(Output::File {
                    path: "reports/digest.md".into(),
                }),
                "body text",
            )
            .await
            .unwrap();

        let written =
            std::fs::read_to_string(tmp.path().join("reports/digest.md")).unwrap();
        assert!(written.starts_with("# Digest\n\nGenerated: "));
        assert!(written.contains("---\n\nbody text"));
    }

    #[tokio::test]
    async fn test_email_without_smtp_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let router = OutputRouter::new(
            Arc::new(LoggingChannelSink),
            Arc::new(NoEmailSender),
            tmp.path().to_path_buf(),
        );
        let err = router
            .route(
                &job(Output::Email {
                    to: "ops@example.com".into(),
                }),
                "body",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SMTP"));
    }
}
