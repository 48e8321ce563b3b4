//! Outbound event fan-out: every enabled webhook subscribed to an event
//! gets exactly one concurrent delivery attempt, never a retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::store::Database;
use crate::store::webhooks::WebhookRegistration;

const DISPATCH_TIMEOUT_SECS: u64 = 15;
const DELIVERY_LOG_CAP: usize = 200;

/// `source` field stamped on every outbound body.
pub const OUTBOUND_SOURCE: &str = "loop-gateway";

#[derive(Clone)]
pub struct WebhookDispatcher {
    db: Arc<Database>,
    http: Client,
}

impl WebhookDispatcher {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            http: Client::builder()
                .timeout(Duration::from_secs(DISPATCH_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Deliver one event to all subscribers. Deliveries run concurrently;
    /// a slow target cannot block the others.
    pub async fn dispatch(&self, event: &str, payload: &Value, tenant_id: Option<&str>) {
        let subscribers = match self.db.webhook_subscribers(event, tenant_id) {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!("cannot load webhook subscribers for '{event}': {e:#}");
                return;
            }
        };
        if subscribers.is_empty() {
            return;
        }
        debug!("dispatching '{}' to {} webhook(s)", event, subscribers.len());

        let deliveries = subscribers
            .into_iter()
            .map(|webhook| self.deliver(webhook, event, payload));
        join_all(deliveries).await;
    }

    async fn deliver(&self, webhook: WebhookRegistration, event: &str, payload: &Value) {
        let started = Instant::now();
        let status = match webhook.target_url {
            Some(ref url) => {
                let body = json!({
                    "event": event,
                    "payload": payload,
                    "timestamp": Utc::now().to_rfc3339(),
                    "source": OUTBOUND_SOURCE,
                });
                match self
                    .http
                    .post(url)
                    .header("X-Webhook-Event", event)
                    .header("X-Webhook-Id", &webhook.id)
                    .header("X-Webhook-Token", &webhook.token)
                    .json(&body)
                    .send()
                    .await
                {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        if !response.status().is_success() {
                            warn!(
                                "webhook '{}' returned HTTP {} for '{}'",
                                webhook.name, status, event
                            );
                        }
                        Some(status)
                    }
                    Err(e) => {
                        warn!("webhook '{}' delivery failed: {}", webhook.name, e);
                        None
                    }
                }
            }
            None => None,
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        if let Err(e) = self.db.record_webhook_trigger(&webhook.id) {
            warn!("cannot bump trigger count for '{}': {e:#}", webhook.name);
        }
        if let Err(e) =
            self.db
                .log_webhook_delivery(&webhook.id, event, status, duration_ms, DELIVERY_LOG_CAP)
        {
            warn!("cannot log delivery for '{}': {e:#}", webhook.name);
        }
    }

    /// Forward every gateway event to the dispatcher until stopped.
    pub fn start_forwarder(&self, events: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            info!("webhook dispatcher started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            dispatcher
                                .dispatch(&event.name, &event.payload, event.tenant_id.as_deref())
                                .await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("webhook dispatcher lagged, {missed} event(s) dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("webhook dispatcher stopped");
        })
    }
}
