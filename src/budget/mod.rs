//! Per-tenant token accounting and the budget gate the agent loop
//! consults before every LLM call.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::errors::BudgetWindow;
use crate::events::EventBus;
use crate::store::Database;
use crate::store::usage::UsageRecord;

/// Emitted once per (tenant, window) crossing of the alert threshold.
pub const BUDGET_ALERT_EVENT: &str = "budget:alert";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Exceeded(BudgetWindow),
}

pub struct UsageLedger {
    db: Arc<Database>,
    tz: Tz,
    events: EventBus,
    /// Last window start an alert fired for, per (tenant, window). The
    /// latch resets naturally when the window rolls over.
    alerted: Mutex<HashMap<(String, BudgetWindow), DateTime<Utc>>>,
}

impl UsageLedger {
    pub fn new(db: Arc<Database>, tz: Tz, events: EventBus) -> Self {
        Self {
            db,
            tz,
            events,
            alerted: Mutex::new(HashMap::new()),
        }
    }

    /// Start of the current calendar window in the configured timezone,
    /// expressed in UTC.
    fn window_start(&self, window: BudgetWindow, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        let date = match window {
            BudgetWindow::Daily => local.date_naive(),
            BudgetWindow::Monthly => local.date_naive().with_day(1).unwrap_or(local.date_naive()),
        };
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
        self.tz
            .from_local_datetime(&midnight)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now)
    }

    /// Best-effort append. The loop must not die because accounting
    /// hiccuped, so failures are logged and swallowed.
    pub fn record_usage(&self, record: &UsageRecord) {
        if let Err(e) = self.db.record_usage(record) {
            warn!("usage ledger write failed (continuing): {e:#}");
        }
    }

    pub fn sum_tokens_in_window(
        &self,
        tenant_id: &str,
        window: BudgetWindow,
    ) -> anyhow::Result<i64> {
        let from = self.window_start(window, Utc::now());
        self.db.sum_tokens_since(tenant_id, from)
    }

    /// Gate an upcoming LLM call. A limit of 0 means unlimited. Crossing
    /// the alert percentage fires a one-shot [`BUDGET_ALERT_EVENT`] per
    /// window; the hard limit returns `Exceeded`.
    pub fn check_budget(
        &self,
        tenant_id: &str,
        daily_limit: i64,
        monthly_limit: i64,
        alert_pct: u8,
    ) -> anyhow::Result<BudgetStatus> {
        let checks = [
            (BudgetWindow::Daily, daily_limit),
            (BudgetWindow::Monthly, monthly_limit),
        ];
        for (window, limit) in checks {
            if limit <= 0 {
                continue;
            }
            let used = self.sum_tokens_in_window(tenant_id, window)?;
            if used >= limit {
                return Ok(BudgetStatus::Exceeded(window));
            }
            if alert_pct > 0 && used * 100 >= limit * i64::from(alert_pct) {
                self.fire_alert_once(tenant_id, window, used, limit);
            }
        }
        Ok(BudgetStatus::Ok)
    }

    fn fire_alert_once(&self, tenant_id: &str, window: BudgetWindow, used: i64, limit: i64) {
        let window_start = self.window_start(window, Utc::now());
        let key = (tenant_id.to_string(), window);
        let mut alerted = self
            .alerted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if alerted.get(&key) == Some(&window_start) {
            return;
        }
        alerted.insert(key, window_start);
        drop(alerted);

        warn!(
            "tenant {} at {}% of {} token budget ({}/{})",
            tenant_id,
            used * 100 / limit.max(1),
            window,
            used,
            limit
        );
        self.events.emit(
            BUDGET_ALERT_EVENT,
            serde_json::json!({
                "tenantId": tenant_id,
                "window": window.to_string(),
                "usedTokens": used,
                "limitTokens": limit,
            }),
            Some(tenant_id.to_string()),
        );
    }
}
