//! Embedded relational store. All durable state lives here: tenants,
//! conversations, usage, A2A audit rows, approvals, scheduled jobs,
//! calendar data and webhook registrations.

pub mod a2a;
pub mod approvals;
pub mod calendar;
pub mod conversations;
pub mod jobs;
pub mod tenants;
pub mod usage;
pub mod webhooks;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create db directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .context("Failed to set pragmas")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL DEFAULT '',
                encrypted_api_key TEXT,
                model TEXT,
                max_tokens INTEGER NOT NULL DEFAULT 4096,
                skill_allow_list TEXT NOT NULL DEFAULT '[]',
                roles TEXT NOT NULL DEFAULT '[]',
                persona TEXT,
                container_isolation INTEGER NOT NULL DEFAULT 0,
                max_concurrent_subagents INTEGER NOT NULL DEFAULT 3,
                budget_daily_tokens INTEGER NOT NULL DEFAULT 0,
                budget_monthly_tokens INTEGER NOT NULL DEFAULT 0,
                budget_alert_pct INTEGER NOT NULL DEFAULT 80,
                hot_swap TEXT,
                fallback TEXT,
                repo_binding TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channel_bindings (
                channel_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(channel_id, external_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_use_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);

            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                isolated INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_tenant_time
                ON usage_records(tenant_id, created_at);

            CREATE TABLE IF NOT EXISTS a2a_messages (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                from_agent TEXT NOT NULL,
                to_agent TEXT NOT NULL,
                conversation_id INTEGER,
                action TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                reply_to TEXT,
                ttl_ms INTEGER,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                processed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_a2a_conversation
                ON a2a_messages(conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS approval_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT,
                tool_name TEXT NOT NULL,
                auto_approve INTEGER NOT NULL DEFAULT 0,
                require_approval INTEGER NOT NULL DEFAULT 0,
                timeout_sec INTEGER NOT NULL DEFAULT 300,
                on_timeout TEXT NOT NULL DEFAULT 'reject',
                enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE(tenant_id, tool_name)
            );

            CREATE TABLE IF NOT EXISTS pending_approvals (
                id TEXT PRIMARY KEY,
                tenant_id TEXT,
                agent_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                input TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                trigger TEXT NOT NULL,
                action TEXT NOT NULL,
                output TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                delete_after_run INTEGER NOT NULL DEFAULT 0,
                last_run_at TEXT,
                last_status TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_job
                ON job_runs(job_id, started_at);

            CREATE TABLE IF NOT EXISTS calendar_sources (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                poll_interval_minutes INTEGER NOT NULL DEFAULT 15,
                last_synced_at TEXT
            );

            CREATE TABLE IF NOT EXISTS calendar_events (
                calendar_id TEXT NOT NULL,
                uid TEXT NOT NULL,
                title TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT,
                recurrence TEXT,
                PRIMARY KEY(calendar_id, uid)
            );

            CREATE TABLE IF NOT EXISTS calendar_fires (
                job_id TEXT NOT NULL,
                event_uid TEXT NOT NULL,
                occurrence_start TEXT NOT NULL,
                event_title TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                fired INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY(job_id, event_uid, occurrence_start)
            );

            CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                token TEXT NOT NULL UNIQUE,
                events TEXT NOT NULL DEFAULT '[]',
                target_url TEXT,
                tenant_id TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_count INTEGER NOT NULL DEFAULT 0,
                last_triggered_at TEXT
            );

            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                webhook_id TEXT NOT NULL,
                event TEXT NOT NULL,
                status INTEGER,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_webhook
                ON webhook_deliveries(webhook_id, id);",
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Parse an RFC 3339 column written by [`now_rfc3339`]. Rows are only ever
/// written by us, so a malformed value is treated as corruption.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("corrupt timestamp column: {raw}"))
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
