//! Time awareness: a context block describing the local date, time-of-day
//! bucket, weekend flag and today's calendar (holidays split out), plus a
//! small behavioral hint.

use chrono::{DateTime, Datelike, Timelike, Weekday};
use chrono_tz::Tz;

use crate::calendar::is_holiday_title;
use crate::store::calendar::CalendarEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPart {
    Morning,
    Midday,
    Afternoon,
    Evening,
    Night,
}

impl DayPart {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=9 => Self::Morning,
            10..=13 => Self::Midday,
            14..=17 => Self::Afternoon,
            18..=21 => Self::Evening,
            _ => Self::Night,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Midday => "midday",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
            Self::Night => "night",
        }
    }
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

fn behavioral_hint(weekend: bool, part: DayPart, holiday: bool) -> &'static str {
    if holiday {
        return "It is a holiday; assume a relaxed pace and avoid scheduling work topics unprompted.";
    }
    match (weekend, part) {
        (true, _) => "It is the weekend; keep the tone casual unless asked otherwise.",
        (false, DayPart::Morning) => "Start-of-day context: brief status-style answers work well.",
        (false, DayPart::Midday | DayPart::Afternoon) => {
            "Core working hours: assume work context by default."
        }
        (false, DayPart::Evening) => "After hours: keep it short unless depth is requested.",
        (false, DayPart::Night) => "Late night: be concise and avoid proposing new tasks.",
    }
}

/// Render the temporal context block for one run.
pub fn temporal_block(now: DateTime<Tz>, today_events: &[CalendarEvent]) -> String {
    let part = DayPart::from_hour(now.hour());
    let weekend = is_weekend(now.weekday());

    let (holidays, regular): (Vec<&CalendarEvent>, Vec<&CalendarEvent>) = today_events
        .iter()
        .partition(|event| is_holiday_title(&event.title));

    let mut block = String::from("## Current context\n");
    block.push_str(&format!(
        "Date: {} ({})\nTime: {} ({})\n",
        now.format("%Y-%m-%d"),
        now.weekday(),
        now.format("%H:%M"),
        part.as_str(),
    ));
    if weekend {
        block.push_str("It is the weekend.\n");
    }
    if !holidays.is_empty() {
        let names: Vec<&str> = holidays.iter().map(|e| e.title.as_str()).collect();
        block.push_str(&format!("Holidays today: {}\n", names.join(", ")));
    }
    if !regular.is_empty() {
        block.push_str("Today's events:\n");
        for event in &regular {
            block.push_str(&format!(
                "- {} at {}\n",
                event.title,
                event.start_at.with_timezone(&now.timezone()).format("%H:%M")
            ));
        }
    }
    block.push_str(behavioral_hint(weekend, part, !holidays.is_empty()));
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(title: &str, hour: u32) -> CalendarEvent {
        CalendarEvent {
            calendar_id: "cal-1".into(),
            uid: format!("uid-{title}"),
            title: title.into(),
            start_at: Utc.with_ymd_and_hms(2025, 3, 17, hour, 0, 0).unwrap(),
            end_at: None,
            recurrence: None,
        }
    }

    #[test]
    fn test_day_part_buckets() {
        assert_eq!(DayPart::from_hour(6), DayPart::Morning);
        assert_eq!(DayPart::from_hour(11), DayPart::Midday);
        assert_eq!(DayPart::from_hour(15), DayPart::Afternoon);
        assert_eq!(DayPart::from_hour(19), DayPart::Evening);
        assert_eq!(DayPart::from_hour(23), DayPart::Night);
        assert_eq!(DayPart::from_hour(2), DayPart::Night);
    }

    #[test]
    fn test_block_contains_date_and_bucket() {
        // Monday 2025-03-17, 09:30 Berlin.
        let now = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 3, 17, 9, 30, 0)
            .unwrap();
        let block = temporal_block(now, &[]);
        assert!(block.contains("2025-03-17"));
        assert!(block.contains("Mon"));
        assert!(block.contains("morning"));
        assert!(!block.contains("weekend"));
    }

    #[test]
    fn test_weekend_flag() {
        let now = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 3, 15, 12, 0, 0)
            .unwrap();
        let block = temporal_block(now, &[]);
        assert!(block.contains("It is the weekend."));
    }

    #[test]
    fn test_holiday_split() {
        let now = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 12, 25, 10, 0, 0)
            .unwrap();
        let events = vec![event("Christmas Day", 0), event("Team sync", 9)];
        let block = temporal_block(now, &events);
        assert!(block.contains("Holidays today: Christmas Day"));
        assert!(block.contains("Team sync"));
        assert!(block.contains("holiday"));
    }

    #[test]
    fn test_workday_hint() {
        let now = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2025, 3, 18, 15, 0, 0)
            .unwrap();
        let block = temporal_block(now, &[]);
        assert!(block.contains("Core working hours"));
    }
}
