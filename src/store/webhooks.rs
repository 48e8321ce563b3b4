use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::{Database, now_rfc3339, parse_ts};

/// Events a webhook may subscribe to. `"*"` subscribes to everything.
pub const KNOWN_EVENTS: &[&str] = &[
    "agent:run:start",
    "agent:run:complete",
    "agent:run:error",
    "task:start",
    "task:complete",
    "task:error",
    "task:iteration",
    "approval:required",
    "approval:resolved",
    "scheduler:job:complete",
    "message:incoming",
    "message:reply",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: String,
    pub name: String,
    /// Opaque bearer credential, 256 bits of entropy, hex-encoded.
    pub token: String,
    pub subscribed_events: Vec<String>,
    pub target_url: Option<String>,
    pub tenant_id: Option<String>,
    pub enabled: bool,
    pub trigger_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl WebhookRegistration {
    pub fn new(name: impl Into<String>, subscribed_events: Vec<String>) -> Self {
        Self {
            id: format!("wh-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            token: generate_token(),
            subscribed_events,
            target_url: None,
            tenant_id: None,
            enabled: true,
            trigger_count: 0,
            last_triggered_at: None,
        }
    }

    /// Check the subscription set against the known event catalog.
    pub fn validate_events(&self) -> Result<()> {
        for event in &self.subscribed_events {
            if event != "*" && !KNOWN_EVENTS.contains(&event.as_str()) {
                anyhow::bail!("unknown event '{event}'");
            }
        }
        Ok(())
    }

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.subscribed_events
            .iter()
            .any(|e| e == "*" || e == event)
    }
}

/// 32 random bytes, hex-encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Database {
    pub fn upsert_webhook(&self, webhook: &WebhookRegistration) -> Result<()> {
        webhook.validate_events()?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO webhooks
                (id, name, token, events, target_url, tenant_id, enabled, trigger_count, last_triggered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, token=excluded.token, events=excluded.events,
                target_url=excluded.target_url, tenant_id=excluded.tenant_id,
                enabled=excluded.enabled",
            params![
                webhook.id,
                webhook.name,
                webhook.token,
                serde_json::to_string(&webhook.subscribed_events)?,
                webhook.target_url,
                webhook.tenant_id,
                webhook.enabled,
                webhook.trigger_count,
                webhook.last_triggered_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_webhook(&self, id: &str) -> Result<Option<WebhookRegistration>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, token, events, target_url, tenant_id, enabled,
                        trigger_count, last_triggered_at
                 FROM webhooks WHERE id = ?1",
                params![id],
                map_webhook_columns,
            )
            .optional()?;
        row.map(build_webhook).transpose()
    }

    pub fn list_webhooks(&self) -> Result<Vec<WebhookRegistration>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, token, events, target_url, tenant_id, enabled,
                    trigger_count, last_triggered_at
             FROM webhooks ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], map_webhook_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_webhook).collect()
    }

    /// Look up an enabled webhook by bearer token. Comparison is
    /// constant-time over every candidate so timing does not leak which
    /// registration (if any) matched.
    pub fn find_webhook_by_token(&self, token: &str) -> Result<Option<WebhookRegistration>> {
        let webhooks = self.list_webhooks()?;
        let mut matched = None;
        for webhook in webhooks {
            let equal: bool = webhook
                .token
                .as_bytes()
                .ct_eq(token.as_bytes())
                .into();
            if equal && webhook.enabled && matched.is_none() {
                matched = Some(webhook);
            }
        }
        Ok(matched)
    }

    /// Enabled webhooks subscribed to `event` (directly or via `"*"`),
    /// filtered by tenant when one is given. Webhooks with no tenant bind
    /// globally.
    pub fn webhook_subscribers(
        &self,
        event: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<WebhookRegistration>> {
        let all = self.list_webhooks()?;
        Ok(all
            .into_iter()
            .filter(|w| w.enabled && w.subscribes_to(event))
            .filter(|w| match (tenant_id, &w.tenant_id) {
                (Some(wanted), Some(bound)) => wanted == bound,
                (_, None) => true,
                (None, Some(_)) => false,
            })
            .collect())
    }

    pub fn record_webhook_trigger(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE webhooks SET trigger_count = trigger_count + 1, last_triggered_at = ?2
             WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Append a delivery log row, keeping at most `cap` rows per webhook.
    pub fn log_webhook_delivery(
        &self,
        webhook_id: &str,
        event: &str,
        status: Option<u16>,
        duration_ms: i64,
        cap: usize,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO webhook_deliveries (webhook_id, event, status, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![webhook_id, event, status, duration_ms, now_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM webhook_deliveries WHERE webhook_id = ?1 AND id NOT IN
                (SELECT id FROM webhook_deliveries WHERE webhook_id = ?1
                 ORDER BY id DESC LIMIT ?2)",
            params![webhook_id, cap as i64],
        )?;
        Ok(())
    }

    pub fn webhook_delivery_count(&self, webhook_id: &str) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM webhook_deliveries WHERE webhook_id = ?1",
            params![webhook_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

type WebhookColumns = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    bool,
    i64,
    Option<String>,
);

fn map_webhook_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn build_webhook(columns: WebhookColumns) -> Result<WebhookRegistration> {
    let (id, name, token, events, target_url, tenant_id, enabled, trigger_count, last_triggered) =
        columns;
    Ok(WebhookRegistration {
        id,
        name,
        token,
        subscribed_events: serde_json::from_str(&events).unwrap_or_default(),
        target_url,
        tenant_id,
        enabled,
        trigger_count,
        last_triggered_at: last_triggered.as_deref().map(parse_ts).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_entropy_and_uniqueness() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64, "32 bytes hex-encoded");
        assert_ne!(a, b);
    }

    #[test]
    fn test_find_by_token_only_enabled() {
        let db = Database::in_memory().unwrap();
        let mut webhook = WebhookRegistration::new("ci", vec!["*".into()]);
        db.upsert_webhook(&webhook).unwrap();

        let found = db.find_webhook_by_token(&webhook.token).unwrap().unwrap();
        assert_eq!(found.id, webhook.id);
        assert!(db.find_webhook_by_token("bogus").unwrap().is_none());

        webhook.enabled = false;
        db.upsert_webhook(&webhook).unwrap();
        assert!(db.find_webhook_by_token(&webhook.token).unwrap().is_none());
    }

    #[test]
    fn test_unknown_event_rejected() {
        let db = Database::in_memory().unwrap();
        let webhook = WebhookRegistration::new("bad", vec!["agent:run:nope".into()]);
        assert!(db.upsert_webhook(&webhook).is_err());
    }

    #[test]
    fn test_subscriber_matching() {
        let db = Database::in_memory().unwrap();
        let mut w1 = WebhookRegistration::new("w1", vec!["agent:run:complete".into()]);
        w1.target_url = Some("https://one.example/hook".into());
        let mut w2 = WebhookRegistration::new("w2", vec!["*".into()]);
        w2.target_url = Some("https://two.example/hook".into());
        let mut w3 = WebhookRegistration::new("w3", vec!["task:error".into()]);
        w3.target_url = Some("https://three.example/hook".into());
        db.upsert_webhook(&w1).unwrap();
        db.upsert_webhook(&w2).unwrap();
        db.upsert_webhook(&w3).unwrap();

        let subs = db
            .webhook_subscribers("agent:run:complete", None)
            .unwrap();
        let names: Vec<&str> = subs.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["w1", "w2"]);
    }

    #[test]
    fn test_tenant_filter() {
        let db = Database::in_memory().unwrap();
        let mut bound = WebhookRegistration::new("bound", vec!["*".into()]);
        bound.tenant_id = Some("t1".into());
        let global = WebhookRegistration::new("global", vec!["*".into()]);
        db.upsert_webhook(&bound).unwrap();
        db.upsert_webhook(&global).unwrap();

        // Tenant t1 sees its own webhook plus globals.
        let subs = db.webhook_subscribers("task:complete", Some("t1")).unwrap();
        assert_eq!(subs.len(), 2);
        // Tenant t2 sees only globals.
        let subs = db.webhook_subscribers("task:complete", Some("t2")).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "global");
        // No tenant: globals only.
        let subs = db.webhook_subscribers("task:complete", None).unwrap();
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn test_trigger_counter_increments() {
        let db = Database::in_memory().unwrap();
        let webhook = WebhookRegistration::new("ci", vec!["*".into()]);
        db.upsert_webhook(&webhook).unwrap();
        db.record_webhook_trigger(&webhook.id).unwrap();
        db.record_webhook_trigger(&webhook.id).unwrap();
        let loaded = db.get_webhook(&webhook.id).unwrap().unwrap();
        assert_eq!(loaded.trigger_count, 2);
        assert!(loaded.last_triggered_at.is_some());
    }

    #[test]
    fn test_delivery_log_capped() {
        let db = Database::in_memory().unwrap();
        let webhook = WebhookRegistration::new("ci", vec!["*".into()]);
        db.upsert_webhook(&webhook).unwrap();
        for _ in 0..10 {
            db.log_webhook_delivery(&webhook.id, "task:complete", Some(200), 12, 5)
                .unwrap();
        }
        assert_eq!(db.webhook_delivery_count(&webhook.id).unwrap(), 5);
    }
}
