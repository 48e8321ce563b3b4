//! Polled iCal ingestion: fetch each source, upsert VEVENTs, arm one-shot
//! fires for calendar-triggered jobs, and classify holidays for the
//! temporal prompt block.

use std::sync::Arc;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use std::sync::OnceLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::Database;
use crate::store::calendar::{CalendarEvent, CalendarFire, CalendarSource};
use crate::scheduler::types::Trigger;

const POLL_TICK_SECS: u64 = 60;
const FETCH_TIMEOUT_SECS: u64 = 30;

/// Keywords marking an event as a holiday, matched case-insensitively.
const HOLIDAY_KEYWORDS: &[&str] = &[
    "holiday",
    "feiertag",
    "christmas",
    "weihnachten",
    "ostern",
    "easter",
    "pfingsten",
    "neujahr",
    "new year",
    "silvester",
    "urlaub",
];

fn holiday_matcher() -> &'static AhoCorasick {
    static MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
    MATCHER.get_or_init(|| {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(HOLIDAY_KEYWORDS)
            .expect("holiday keyword set is valid")
    })
}

pub fn is_holiday_title(title: &str) -> bool {
    holiday_matcher().is_match(title)
}

/// One parsed VEVENT, before it is bound to a calendar id.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub uid: String,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub recurrence: Option<String>,
}

/// Unfold RFC 5545 folded lines (continuations start with space or tab).
fn unfold(ics: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in ics.lines() {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            let last = lines.last_mut().expect("checked non-empty");
            last.push_str(&raw[1..]);
        } else {
            lines.push(raw.trim_end_matches('\r').to_string());
        }
    }
    lines
}

fn unescape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n' | 'N') => out.push('\n'),
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a DTSTART/DTEND value: UTC (`...Z`), date-only, or local with an
/// optional `TZID=` parameter.
fn parse_ics_datetime(value: &str, tzid: Option<&str>) -> Option<DateTime<Utc>> {
    let tz: Tz = tzid.and_then(|name| name.parse().ok()).unwrap_or(Tz::UTC);

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(Utc.from_utc_datetime(&naive));
    }
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        let naive = date.and_hms_opt(0, 0, 0)?;
        return tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract the property name, parameters and value from one content line.
fn split_property(line: &str) -> Option<(&str, Option<&str>, &str)> {
    let (head, value) = line.split_once(':')?;
    match head.split_once(';') {
        Some((name, params)) => Some((name, Some(params), value)),
        None => Some((head, None, value)),
    }
}

fn param_value<'a>(params: Option<&'a str>, key: &str) -> Option<&'a str> {
    params?
        .split(';')
        .find_map(|pair| pair.strip_prefix(key)?.strip_prefix('='))
}

/// Parse VEVENT blocks out of an iCal document. Events without UID or
/// DTSTART are skipped.
pub fn parse_ics(ics: &str) -> Vec<ParsedEvent> {
    let mut events = Vec::new();
    let mut current: Option<(Option<String>, Option<String>, Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<String>)> = None;

    for line in unfold(ics) {
        if line == "BEGIN:VEVENT" {
            current = Some((None, None, None, None, None));
            continue;
        }
        if line == "END:VEVENT" {
            if let Some((uid, title, start, end, rrule)) = current.take() {
                match (uid, start) {
                    (Some(uid), Some(start_at)) => events.push(ParsedEvent {
                        uid,
                        title: title.unwrap_or_default(),
                        start_at,
                        end_at: end,
                        recurrence: rrule,
                    }),
                    _ => debug!("skipping VEVENT without UID or DTSTART"),
                }
            }
            continue;
        }
        let Some(ref mut event) = current else {
            continue;
        };
        let Some((name, params, value)) = split_property(&line) else {
            continue;
        };
        match name {
            "UID" => event.0 = Some(value.to_string()),
            "SUMMARY" => event.1 = Some(unescape_text(value)),
            "DTSTART" => event.2 = parse_ics_datetime(value, param_value(params, "TZID")),
            "DTEND" => event.3 = parse_ics_datetime(value, param_value(params, "TZID")),
            "RRULE" => event.4 = Some(value.to_string()),
            _ => {}
        }
    }
    events
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub parsed: usize,
    pub changed: usize,
    pub fires_armed: usize,
}

#[derive(Clone)]
pub struct CalendarSync {
    db: Arc<Database>,
    http: Client,
    cancel: CancellationToken,
}

impl CalendarSync {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            http: Client::builder()
                .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| Client::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Fetch and ingest one source, then re-arm calendar-triggered jobs.
    pub async fn sync_source(&self, source: &CalendarSource) -> Result<SyncStats> {
        let body = self
            .http
            .get(&source.url)
            .send()
            .await
            .with_context(|| format!("fetching calendar {}", source.id))?
            .error_for_status()
            .with_context(|| format!("calendar {} returned an error status", source.id))?
            .text()
            .await?;

        let parsed = parse_ics(&body);
        let mut stats = SyncStats {
            parsed: parsed.len(),
            ..Default::default()
        };
        for event in &parsed {
            let row = CalendarEvent {
                calendar_id: source.id.clone(),
                uid: event.uid.clone(),
                title: event.title.clone(),
                start_at: event.start_at,
                end_at: event.end_at,
                recurrence: event.recurrence.clone(),
            };
            if self.db.upsert_calendar_event(&row)? {
                stats.changed += 1;
            }
        }

        stats.fires_armed = self.arm_triggers(&source.id)?;
        self.db.touch_calendar_synced(&source.id)?;
        info!(
            "calendar {} synced: {} events, {} changed, {} fires armed",
            source.id, stats.parsed, stats.changed, stats.fires_armed
        );
        Ok(stats)
    }

    /// Scan upcoming events against `calendarEvent` triggers for this
    /// calendar and arm one-shot fires, deduplicated per occurrence.
    fn arm_triggers(&self, calendar_id: &str) -> Result<usize> {
        let now = Utc::now();
        let events = self.db.calendar_events(calendar_id)?;
        let mut armed = 0usize;

        for mut job in self.db.list_jobs(true)? {
            let Trigger::CalendarEvent {
                calendar_id: ref job_calendar,
                minutes_before,
                minutes_after,
                ref title_filter,
            } = job.trigger
            else {
                continue;
            };
            if job_calendar != calendar_id {
                continue;
            }
            let offset = chrono::Duration::minutes(
                minutes_after.unwrap_or_else(|| -minutes_before.unwrap_or(0)),
            );

            for event in &events {
                if let Some(filter) = title_filter
                    && !event.title.to_lowercase().contains(&filter.to_lowercase())
                {
                    continue;
                }
                if event.start_at <= now {
                    continue;
                }
                let fire_at = event.start_at + offset;
                if fire_at <= now {
                    continue;
                }
                let fire = CalendarFire {
                    job_id: job.id.clone(),
                    event_uid: event.uid.clone(),
                    occurrence_start: event.start_at,
                    event_title: event.title.clone(),
                    fire_at,
                };
                if self.db.arm_calendar_fire(&fire)? {
                    armed += 1;
                }
            }

            let next = self.db.next_calendar_fire(&job.id)?;
            if next != job.next_run_at {
                job.next_run_at = next;
                self.db.update_job(&job)?;
            }
        }
        Ok(armed)
    }

    /// Poll all sources at their configured cadence.
    pub fn start(&self) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            info!("calendar sync started");
            loop {
                tokio::select! {
                    () = sync.cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(POLL_TICK_SECS)) => {}
                }
                let sources = match sync.db.list_calendar_sources() {
                    Ok(sources) => sources,
                    Err(e) => {
                        warn!("cannot list calendar sources: {e:#}");
                        continue;
                    }
                };
                for source in sources {
                    let due = match source.last_synced_at {
                        Some(last) => {
                            last + chrono::Duration::minutes(i64::from(
                                source.poll_interval_minutes.max(1),
                            )) <= Utc::now()
                        }
                        None => true,
                    };
                    if !due {
                        continue;
                    }
                    if let Err(e) = sync.sync_source(&source).await {
                        warn!("calendar {} sync failed: {e:#}", source.id);
                    }
                }
            }
            info!("calendar sync stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
