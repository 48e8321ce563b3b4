use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::GatewayError;

/// Firing condition of a scheduled job.
///
/// Calendar-style triggers are evaluated in their own IANA timezone;
/// `calendarEvent` triggers are armed externally by calendar sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Trigger {
    #[serde(rename_all = "camelCase")]
    Daily {
        /// "HH:MM" in the trigger timezone.
        time: String,
        /// Optional weekday filter, Monday = 1 .. Sunday = 7.
        #[serde(default)]
        days: Option<Vec<u32>>,
        tz: String,
    },
    #[serde(rename_all = "camelCase")]
    Weekly {
        time: String,
        days: Vec<u32>,
        tz: String,
    },
    #[serde(rename_all = "camelCase")]
    Monthly {
        time: String,
        day_of_month: u32,
        tz: String,
    },
    #[serde(rename_all = "camelCase")]
    Interval { minutes: u32 },
    #[serde(rename_all = "camelCase")]
    Once { run_at: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    CalendarEvent {
        calendar_id: String,
        #[serde(default)]
        minutes_before: Option<i64>,
        #[serde(default)]
        minutes_after: Option<i64>,
        #[serde(default)]
        title_filter: Option<String>,
    },
}

/// Destination for a job's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Output {
    #[serde(rename_all = "camelCase")]
    Channel { channel_id: String },
    #[serde(rename_all = "camelCase")]
    Webhook { url: String },
    #[serde(rename_all = "camelCase")]
    File { path: String },
    #[serde(rename_all = "camelCase")]
    Email { to: String },
}

/// What the job asks the agent loop to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAction {
    pub prompt: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub action: JobAction,
    pub output: Output,
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, trigger: Trigger, action: JobAction, output: Output) -> Self {
        Self {
            id: format!("job-{}", Uuid::new_v4()),
            name: name.into(),
            trigger,
            action,
            output,
            enabled: true,
            delete_after_run: false,
            last_run_at: None,
            last_status: None,
            next_run_at: None,
            run_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => Self::Success,
            "error" => Self::Error,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn parse_tz(tz: &str) -> Result<Tz, GatewayError> {
    tz.parse()
        .map_err(|_| GatewayError::SchedulerConfig(format!("unknown timezone '{tz}'")))
}

fn parse_hhmm(time: &str) -> Result<NaiveTime, GatewayError> {
    NaiveTime::parse_from_str(time, "%H:%M")
        .map_err(|_| GatewayError::SchedulerConfig(format!("invalid time '{time}', expected HH:MM")))
}

/// Resolve a local wall-clock instant in `tz`, skipping into the next hour
/// when the slot falls inside a DST gap.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&date.and_time(time)) {
        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
        chrono::LocalResult::None => tz
            .from_local_datetime(&date.and_time(time + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// Compute the next instant strictly after `after` at which the trigger
/// fires. `Ok(None)` means the trigger is armed externally (calendar) or a
/// past one-shot. Invalid configurations are `SchedulerConfig` errors.
pub fn next_fire(
    trigger: &Trigger,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, GatewayError> {
    match trigger {
        Trigger::Daily { time, days, tz } => {
            let tz = parse_tz(tz)?;
            let time = parse_hhmm(time)?;
            if let Some(days) = days {
                validate_days(days)?;
            }
            let start = after.with_timezone(&tz).date_naive();
            for offset in 0..=7 {
                let date = start + Duration::days(offset);
                if let Some(days) = days
                    && !days.contains(&date.weekday().number_from_monday())
                {
                    continue;
                }
                if let Some(candidate) = resolve_local(tz, date, time)
                    && candidate > after
                {
                    return Ok(Some(candidate));
                }
            }
            Err(GatewayError::SchedulerConfig(
                "no matching weekday within one week".into(),
            ))
        }
        Trigger::Weekly { time, days, tz } => {
            if days.is_empty() {
                return Err(GatewayError::SchedulerConfig(
                    "weekly trigger requires at least one day".into(),
                ));
            }
            next_fire(
                &Trigger::Daily {
                    time: time.clone(),
                    days: Some(days.clone()),
                    tz: tz.clone(),
                },
                after,
            )
        }
        Trigger::Monthly {
            time,
            day_of_month,
            tz,
        } => {
            if *day_of_month == 0 || *day_of_month > 31 {
                return Err(GatewayError::SchedulerConfig(format!(
                    "invalid day of month {day_of_month}"
                )));
            }
            let tz = parse_tz(tz)?;
            let time = parse_hhmm(time)?;
            let local = after.with_timezone(&tz);
            let (mut year, mut month) = (local.year(), local.month());
            // Roll forward up to a year; months without the slot (e.g. 31st
            // of April) are skipped.
            for _ in 0..=12 {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, *day_of_month)
                    && let Some(candidate) = resolve_local(tz, date, time)
                    && candidate > after
                {
                    return Ok(Some(candidate));
                }
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
            }
            Err(GatewayError::SchedulerConfig(format!(
                "day {day_of_month} never occurs"
            )))
        }
        Trigger::Interval { minutes } => {
            if *minutes == 0 {
                return Err(GatewayError::SchedulerConfig(
                    "interval must be at least one minute".into(),
                ));
            }
            Ok(Some(after + Duration::minutes(i64::from(*minutes))))
        }
        Trigger::Once { run_at } => {
            // A past one-shot fires immediately, once; the service disables
            // it after the run.
            Ok(Some((*run_at).max(after)))
        }
        Trigger::CalendarEvent { .. } => Ok(None),
    }
}

fn validate_days(days: &[u32]) -> Result<(), GatewayError> {
    for day in days {
        if *day == 0 || *day > 7 {
            return Err(GatewayError::SchedulerConfig(format!(
                "invalid weekday {day}, expected 1..=7"
            )));
        }
    }
    Ok(())
}
