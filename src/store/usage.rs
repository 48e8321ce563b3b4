use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Database, now_rfc3339};

/// One LLM call's token accounting. Append-only; basis for budget
/// enforcement.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub tenant_id: Option<String>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub duration_ms: i64,
    pub isolated: bool,
}

impl Database {
    pub fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO usage_records
                (tenant_id, model, input_tokens, output_tokens, duration_ms, isolated, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.tenant_id,
                record.model,
                record.input_tokens,
                record.output_tokens,
                record.duration_ms,
                record.isolated,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Sum of input + output tokens for a tenant since `from` (UTC).
    pub fn sum_tokens_since(&self, tenant_id: &str, from: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock();
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0)
             FROM usage_records WHERE tenant_id = ?1 AND created_at >= ?2",
            params![tenant_id, from.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub fn usage_record_count(&self, tenant_id: &str) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM usage_records WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(tenant: &str, input: i64, output: i64) -> UsageRecord {
        UsageRecord {
            tenant_id: Some(tenant.to_string()),
            model: "test-model".into(),
            input_tokens: input,
            output_tokens: output,
            duration_ms: 120,
            isolated: false,
        }
    }

    #[test]
    fn test_sum_tokens_since() {
        let db = Database::in_memory().unwrap();
        db.record_usage(&record("t1", 100, 50)).unwrap();
        db.record_usage(&record("t1", 10, 5)).unwrap();
        db.record_usage(&record("t2", 1000, 1000)).unwrap();

        let from = Utc::now() - Duration::hours(1);
        assert_eq!(db.sum_tokens_since("t1", from).unwrap(), 165);
        assert_eq!(db.sum_tokens_since("t2", from).unwrap(), 2000);
        assert_eq!(db.sum_tokens_since("t3", from).unwrap(), 0);
    }

    #[test]
    fn test_window_excludes_older_rows() {
        let db = Database::in_memory().unwrap();
        db.record_usage(&record("t1", 100, 0)).unwrap();
        // A window starting in the future excludes everything just written.
        let from = Utc::now() + Duration::hours(1);
        assert_eq!(db.sum_tokens_since("t1", from).unwrap(), 0);
    }
}
