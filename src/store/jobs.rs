use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Database, now_rfc3339, parse_ts};
use crate::scheduler::types::{JobRun, RunStatus, ScheduledJob};

impl Database {
    pub fn insert_job(&self, job: &ScheduledJob) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO jobs (id, name, trigger, action, output, enabled, delete_after_run,
                last_run_at, last_status, next_run_at, run_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                job.id,
                job.name,
                serde_json::to_string(&job.trigger)?,
                serde_json::to_string(&job.action)?,
                serde_json::to_string(&job.output)?,
                job.enabled,
                job.delete_after_run,
                job.last_run_at.map(|t| t.to_rfc3339()),
                job.last_status,
                job.next_run_at.map(|t| t.to_rfc3339()),
                job.run_count,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_job(&self, job: &ScheduledJob) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET name=?2, trigger=?3, action=?4, output=?5, enabled=?6,
                delete_after_run=?7, last_run_at=?8, last_status=?9, next_run_at=?10,
                run_count=?11, updated_at=?12
             WHERE id=?1",
            params![
                job.id,
                job.name,
                serde_json::to_string(&job.trigger)?,
                serde_json::to_string(&job.action)?,
                serde_json::to_string(&job.output)?,
                job.enabled,
                job.delete_after_run,
                job.last_run_at.map(|t| t.to_rfc3339()),
                job.last_status,
                job.next_run_at.map(|t| t.to_rfc3339()),
                job.run_count,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        conn.execute("DELETE FROM job_runs WHERE job_id = ?1", params![id])?;
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, trigger, action, output, enabled, delete_after_run,
                        last_run_at, last_status, next_run_at, run_count
                 FROM jobs WHERE id = ?1",
                params![id],
                map_job_columns,
            )
            .optional()?;
        row.map(build_job).transpose()
    }

    pub fn list_jobs(&self, enabled_only: bool) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock();
        let sql = if enabled_only {
            "SELECT id, name, trigger, action, output, enabled, delete_after_run,
                    last_run_at, last_status, next_run_at, run_count
             FROM jobs WHERE enabled = 1 ORDER BY next_run_at"
        } else {
            "SELECT id, name, trigger, action, output, enabled, delete_after_run,
                    last_run_at, last_status, next_run_at, run_count
             FROM jobs ORDER BY next_run_at"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], map_job_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_job).collect()
    }

    /// Enabled jobs whose `next_run_at` is due at or before `now`.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, trigger, action, output, enabled, delete_after_run,
                    last_run_at, last_status, next_run_at, run_count
             FROM jobs
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at",
        )?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], map_job_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_job).collect()
    }

    /// Earliest pending `next_run_at` across enabled jobs, for sleep sizing.
    pub fn earliest_next_run(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT MIN(next_run_at) FROM jobs WHERE enabled = 1 AND next_run_at IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        raw.as_deref().map(parse_ts).transpose()
    }

    // --- runs ---

    pub fn insert_job_run(&self, run: &JobRun) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO job_runs (id, job_id, status, output, error, input_tokens,
                output_tokens, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.job_id,
                run.status.as_str(),
                run.output,
                run.error,
                run.input_tokens,
                run.output_tokens,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Complete a run. Terminal rows are immutable: finishing an already
    /// finished run is a no-op returning false.
    pub fn finish_job_run(
        &self,
        id: &str,
        status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE job_runs SET status=?2, output=?3, error=?4, input_tokens=?5,
                output_tokens=?6, completed_at=?7
             WHERE id=?1 AND status='running'",
            params![
                id,
                status.as_str(),
                output,
                error,
                input_tokens,
                output_tokens,
                now_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_job_run(&self, id: &str) -> Result<Option<JobRun>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, job_id, status, output, error, input_tokens, output_tokens,
                        started_at, completed_at
                 FROM job_runs WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, job_id, status, output, error, input_tokens, output_tokens, started, completed)) => {
                Ok(Some(JobRun {
                    id,
                    job_id,
                    status: RunStatus::parse(&status),
                    output,
                    error,
                    input_tokens,
                    output_tokens,
                    started_at: parse_ts(&started)?,
                    completed_at: completed.as_deref().map(parse_ts).transpose()?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Drop finished runs older than the cutoff.
    pub fn prune_job_runs(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM job_runs WHERE status != 'running' AND started_at < ?1",
            params![before.to_rfc3339()],
        )?;
        Ok(changed)
    }
}

type JobColumns = (
    String,
    String,
    String,
    String,
    String,
    bool,
    bool,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
);

fn map_job_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobColumns> {
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
        row.get(9)?,
        row.get(10)?,
    ))
}

fn build_job(columns: JobColumns) -> Result<ScheduledJob> {
    let (
        id,
        name,
        trigger,
        action,
        output,
        enabled,
        delete_after_run,
        last_run_at,
        last_status,
        next_run_at,
        run_count,
    ) = columns;
    Ok(ScheduledJob {
        id,
        name,
        trigger: serde_json::from_str(&trigger).context("corrupt trigger column")?,
        action: serde_json::from_str(&action).context("corrupt action column")?,
        output: serde_json::from_str(&output).context("corrupt output column")?,
        enabled,
        delete_after_run,
        last_run_at: last_run_at.as_deref().map(parse_ts).transpose()?,
        last_status,
        next_run_at: next_run_at.as_deref().map(parse_ts).transpose()?,
        run_count,
    })
}
