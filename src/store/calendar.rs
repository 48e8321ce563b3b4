use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{Database, now_rfc3339, parse_ts};

/// A polled iCal feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSource {
    pub id: String,
    pub url: String,
    pub poll_interval_minutes: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// One VEVENT, unique on (calendar_id, uid).
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub calendar_id: String,
    pub uid: String,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub recurrence: Option<String>,
}

/// A one-shot fire armed by calendar sync for a calendar-triggered job.
#[derive(Debug, Clone)]
pub struct CalendarFire {
    pub job_id: String,
    pub event_uid: String,
    pub occurrence_start: DateTime<Utc>,
    pub event_title: String,
    pub fire_at: DateTime<Utc>,
}

impl Database {
    pub fn upsert_calendar_source(&self, source: &CalendarSource) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO calendar_sources (id, url, poll_interval_minutes, last_synced_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                url=excluded.url, poll_interval_minutes=excluded.poll_interval_minutes",
            params![
                source.id,
                source.url,
                source.poll_interval_minutes,
                source.last_synced_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn list_calendar_sources(&self) -> Result<Vec<CalendarSource>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, url, poll_interval_minutes, last_synced_at FROM calendar_sources",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut sources = Vec::with_capacity(rows.len());
        for (id, url, poll, synced) in rows {
            sources.push(CalendarSource {
                id,
                url,
                poll_interval_minutes: poll as u32,
                last_synced_at: synced.as_deref().map(parse_ts).transpose()?,
            });
        }
        Ok(sources)
    }

    pub fn touch_calendar_synced(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE calendar_sources SET last_synced_at = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Idempotent upsert by (calendar_id, uid). Returns true when the row
    /// was inserted or materially changed; an unchanged VEVENT writes
    /// nothing.
    pub fn upsert_calendar_event(&self, event: &CalendarEvent) -> Result<bool> {
        let conn = self.lock();
        let existing: Option<(String, String, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT title, start_at, end_at, recurrence FROM calendar_events
                 WHERE calendar_id = ?1 AND uid = ?2",
                params![event.calendar_id, event.uid],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()?;

        let start = event.start_at.to_rfc3339();
        let end = event.end_at.map(|t| t.to_rfc3339());
        if let Some((title, old_start, old_end, recurrence)) = existing
            && title == event.title
            && old_start == start
            && old_end == end
            && recurrence == event.recurrence
        {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO calendar_events (calendar_id, uid, title, start_at, end_at, recurrence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(calendar_id, uid) DO UPDATE SET
                title=excluded.title, start_at=excluded.start_at,
                end_at=excluded.end_at, recurrence=excluded.recurrence",
            params![
                event.calendar_id,
                event.uid,
                event.title,
                start,
                end,
                event.recurrence,
            ],
        )?;
        Ok(true)
    }

    pub fn calendar_events(&self, calendar_id: &str) -> Result<Vec<CalendarEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT calendar_id, uid, title, start_at, end_at, recurrence
             FROM calendar_events WHERE calendar_id = ?1 ORDER BY start_at",
        )?;
        let rows = stmt
            .query_map(params![calendar_id], map_event_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_event).collect()
    }

    /// Events starting inside [from, to), across all calendars.
    pub fn events_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT calendar_id, uid, title, start_at, end_at, recurrence
             FROM calendar_events WHERE start_at >= ?1 AND start_at < ?2 ORDER BY start_at",
        )?;
        let rows = stmt
            .query_map(params![from.to_rfc3339(), to.to_rfc3339()], map_event_columns)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(build_event).collect()
    }

    /// Arm a one-shot fire. The (job, event, occurrence) key fires at most
    /// once per occurrence: returns false when already armed or fired.
    pub fn arm_calendar_fire(&self, fire: &CalendarFire) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT INTO calendar_fires
                (job_id, event_uid, occurrence_start, event_title, fire_at, fired)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(job_id, event_uid, occurrence_start) DO NOTHING",
            params![
                fire.job_id,
                fire.event_uid,
                fire.occurrence_start.to_rfc3339(),
                fire.event_title,
                fire.fire_at.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn due_calendar_fires(&self, job_id: &str, now: DateTime<Utc>) -> Result<Vec<CalendarFire>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, event_uid, occurrence_start, event_title, fire_at
             FROM calendar_fires
             WHERE job_id = ?1 AND fired = 0 AND fire_at <= ?2 ORDER BY fire_at",
        )?;
        let rows = stmt
            .query_map(params![job_id, now.to_rfc3339()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut fires = Vec::with_capacity(rows.len());
        for (job_id, event_uid, occurrence, title, fire_at) in rows {
            fires.push(CalendarFire {
                job_id,
                event_uid,
                occurrence_start: parse_ts(&occurrence)?,
                event_title: title,
                fire_at: parse_ts(&fire_at)?,
            });
        }
        Ok(fires)
    }

    pub fn mark_calendar_fire_done(
        &self,
        job_id: &str,
        event_uid: &str,
        occurrence_start: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE calendar_fires SET fired = 1
             WHERE job_id = ?1 AND event_uid = ?2 AND occurrence_start = ?3",
            params![job_id, event_uid, occurrence_start.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Earliest pending fire for a job, used to keep `next_run_at` honest.
    pub fn next_calendar_fire(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT MIN(fire_at) FROM calendar_fires WHERE job_id = ?1 AND fired = 0",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        raw.as_deref().map(parse_ts).transpose()
    }
}

type EventColumns = (String, String, String, String, Option<String>, Option<String>);

fn map_event_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn build_event(columns: EventColumns) -> Result<CalendarEvent> {
    let (calendar_id, uid, title, start_at, end_at, recurrence) = columns;
    Ok(CalendarEvent {
        calendar_id,
        uid,
        title,
        start_at: parse_ts(&start_at)?,
        end_at: end_at.as_deref().map(parse_ts).transpose()?,
        recurrence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(uid: &str, title: &str) -> CalendarEvent {
        CalendarEvent {
            calendar_id: "cal-1".into(),
            uid: uid.into(),
            title: title.into(),
            start_at: Utc::now() + chrono::Duration::hours(2),
            end_at: None,
            recurrence: None,
        }
    }

    #[test]
    fn test_event_upsert_idempotent() {
        let db = Database::in_memory().unwrap();
        let ev = event("E1", "Invoice Day");
        assert!(db.upsert_calendar_event(&ev).unwrap());
        // Unchanged VEVENT: no new write.
        assert!(!db.upsert_calendar_event(&ev).unwrap());
        assert_eq!(db.calendar_events("cal-1").unwrap().len(), 1);

        // A shifted event is a change.
        let mut shifted = ev.clone();
        shifted.start_at += chrono::Duration::hours(1);
        assert!(db.upsert_calendar_event(&shifted).unwrap());
        assert_eq!(db.calendar_events("cal-1").unwrap().len(), 1);
    }

    #[test]
    fn test_fire_dedup_per_occurrence() {
        let db = Database::in_memory().unwrap();
        let occurrence = Utc::now() + chrono::Duration::hours(2);
        let fire = CalendarFire {
            job_id: "job-k".into(),
            event_uid: "E1".into(),
            occurrence_start: occurrence,
            event_title: "Invoice Day".into(),
            fire_at: occurrence - chrono::Duration::minutes(15),
        };
        assert!(db.arm_calendar_fire(&fire).unwrap());
        // Re-arming the same occurrence is a no-op.
        assert!(!db.arm_calendar_fire(&fire).unwrap());

        // A new occurrence of the same event arms again.
        let mut next_week = fire.clone();
        next_week.occurrence_start = occurrence + chrono::Duration::days(7);
        assert!(db.arm_calendar_fire(&next_week).unwrap());
    }

    #[test]
    fn test_due_and_done_lifecycle() {
        let db = Database::in_memory().unwrap();
        let past = Utc::now() - chrono::Duration::minutes(5);
        let fire = CalendarFire {
            job_id: "job-k".into(),
            event_uid: "E1".into(),
            occurrence_start: past + chrono::Duration::minutes(15),
            event_title: "Invoice Day".into(),
            fire_at: past,
        };
        db.arm_calendar_fire(&fire).unwrap();

        let due = db.due_calendar_fires("job-k", Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event_title, "Invoice Day");

        db.mark_calendar_fire_done("job-k", "E1", fire.occurrence_start)
            .unwrap();
        assert!(db.due_calendar_fires("job-k", Utc::now()).unwrap().is_empty());
        assert!(db.next_calendar_fire("job-k").unwrap().is_none());
    }

    #[test]
    fn test_events_in_window() {
        let db = Database::in_memory().unwrap();
        let mut today = event("E1", "Standup");
        today.start_at = Utc::now() + chrono::Duration::minutes(30);
        let mut tomorrow = event("E2", "Planning");
        tomorrow.start_at = Utc::now() + chrono::Duration::days(2);
        db.upsert_calendar_event(&today).unwrap();
        db.upsert_calendar_event(&tomorrow).unwrap();

        let found = db
            .events_in_window(Utc::now(), Utc::now() + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid, "E1");
    }

    #[test]
    fn test_source_round_trip() {
        let db = Database::in_memory().unwrap();
        db.upsert_calendar_source(&CalendarSource {
            id: "cal-1".into(),
            url: "https://example.com/team.ics".into(),
            poll_interval_minutes: 15,
            last_synced_at: None,
        })
        .unwrap();
        db.touch_calendar_synced("cal-1").unwrap();
        let sources = db.list_calendar_sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].last_synced_at.is_some());
    }
}
