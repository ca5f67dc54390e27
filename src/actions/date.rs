//! Date parameter parsing
//!
//! Tries a fixed list of absolute formats first, then a handful of
//! relative phrases ("tomorrow at 3pm", "next friday", "in 2 hours").

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};

/// Formats that carry a time of day
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M",
    "%B %d, %Y %I:%M %p",
];

/// Date-only formats, resolved to midnight
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y"];

/// Time used for a relative day given without one
const DEFAULT_HOUR: u32 = 9;

/// Time used for "tonight"
const TONIGHT_HOUR: u32 = 20;

/// Canonical text form of a parsed date
#[must_use]
pub fn format_date(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Parse `value` relative to `now`
///
/// Returns `None` when no format or phrase matches.
#[must_use]
pub fn parse_date(value: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    parse_absolute(value).or_else(|| parse_relative(&value.to_lowercase(), now))
}

fn parse_absolute(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn parse_relative(value: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if let Some(offset) = value.strip_prefix("in ") {
        return parse_offset(offset).and_then(|delta| now.checked_add_signed(delta));
    }

    let (day, time) = match value.rsplit_once(" at ") {
        Some((day, time)) => (day.trim(), Some(parse_time(time)?)),
        None => match value.strip_prefix("at ") {
            Some(time) => ("today", Some(parse_time(time)?)),
            None => (value, None),
        },
    };

    let today = now.date();
    let (date, default_hour) = match day {
        "today" => (today, DEFAULT_HOUR),
        "tonight" => (today, TONIGHT_HOUR),
        "tomorrow" => (today.succ_opt()?, DEFAULT_HOUR),
        "tomorrow night" => (today.succ_opt()?, TONIGHT_HOUR),
        other => {
            let name = other
                .strip_prefix("next ")
                .or_else(|| other.strip_prefix("this "))
                .unwrap_or(other);
            match name.parse::<Weekday>() {
                Ok(weekday) => (next_weekday(today, weekday)?, DEFAULT_HOUR),
                // A bare time of day means today
                Err(_) if time.is_none() => return parse_time(other).map(|t| today.and_time(t)),
                Err(_) => return None,
            }
        }
    };

    let time = match time {
        Some(time) => time,
        None => NaiveTime::from_hms_opt(default_hour, 0, 0)?,
    };
    Some(date.and_time(time))
}

/// "5 minutes", "an hour", "3 days", "2 weeks"
fn parse_offset(value: &str) -> Option<TimeDelta> {
    let (amount, unit) = value.trim().split_once(' ')?;
    let amount: i64 = match amount {
        "a" | "an" | "one" => 1,
        n => n.parse().ok()?,
    };

    match unit.trim().trim_end_matches('s') {
        "minute" | "min" => TimeDelta::try_minutes(amount),
        "hour" | "hr" => TimeDelta::try_hours(amount),
        "day" => TimeDelta::try_days(amount),
        "week" => TimeDelta::try_weeks(amount),
        _ => None,
    }
}

/// "3pm", "3:30 pm", "15:00", "noon", "midnight"
fn parse_time(value: &str) -> Option<NaiveTime> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches('.').replace('.', "");

    match compact.as_str() {
        "noon" => return NaiveTime::from_hms_opt(12, 0, 0),
        "midnight" => return NaiveTime::from_hms_opt(0, 0, 0),
        _ => {}
    }

    let (body, pm) = if let Some(body) = compact.strip_suffix("pm") {
        (body, Some(true))
    } else if let Some(body) = compact.strip_suffix("am") {
        (body, Some(false))
    } else {
        (compact.as_str(), None)
    };

    let (hour, minute) = match body.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (body.parse::<u32>().ok()?, 0),
    };

    let hour = match pm {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            hour % 12 + if pm { 12 } else { 0 }
        }
        None => hour,
    };

    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Next date strictly after `from` that falls on `weekday`
fn next_weekday(from: NaiveDate, weekday: Weekday) -> Option<NaiveDate> {
    let current = from.weekday().num_days_from_monday();
    let target = weekday.num_days_from_monday();
    let mut ahead = (target + 7 - current) % 7;
    if ahead == 0 {
        ahead = 7;
    }
    from.checked_add_days(chrono::Days::new(u64::from(ahead)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Thursday 2026-10-15 14:00
    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 15)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn absolute_formats() {
        assert_eq!(parse_date("2026-12-01 08:30", now()), Some(at(2026, 12, 1, 8, 30)));
        assert_eq!(parse_date("2026-12-01T08:30:00", now()), Some(at(2026, 12, 1, 8, 30)));
        assert_eq!(parse_date("2026-12-01", now()), Some(at(2026, 12, 1, 0, 0)));
        assert_eq!(parse_date("12/01/2026", now()), Some(at(2026, 12, 1, 0, 0)));
        assert_eq!(parse_date("December 01, 2026", now()), Some(at(2026, 12, 1, 0, 0)));
    }

    #[test]
    fn relative_days() {
        assert_eq!(parse_date("tomorrow", now()), Some(at(2026, 10, 16, 9, 0)));
        assert_eq!(parse_date("Tomorrow at 3pm", now()), Some(at(2026, 10, 16, 15, 0)));
        assert_eq!(parse_date("tonight", now()), Some(at(2026, 10, 15, 20, 0)));
        assert_eq!(parse_date("today at 17:45", now()), Some(at(2026, 10, 15, 17, 45)));
    }

    #[test]
    fn weekdays_are_strictly_in_the_future() {
        // now() is a Thursday
        assert_eq!(parse_date("thursday", now()), Some(at(2026, 10, 22, 9, 0)));
        assert_eq!(parse_date("friday", now()), Some(at(2026, 10, 16, 9, 0)));
        assert_eq!(parse_date("next monday at 10:30 am", now()), Some(at(2026, 10, 19, 10, 30)));
    }

    #[test]
    fn offsets() {
        assert_eq!(parse_date("in 2 hours", now()), Some(at(2026, 10, 15, 16, 0)));
        assert_eq!(parse_date("in an hour", now()), Some(at(2026, 10, 15, 15, 0)));
        assert_eq!(parse_date("in 30 minutes", now()), Some(at(2026, 10, 15, 14, 30)));
        assert_eq!(parse_date("in 3 days", now()), Some(at(2026, 10, 18, 14, 0)));
    }

    #[test]
    fn bare_times() {
        assert_eq!(parse_date("at noon", now()), Some(at(2026, 10, 15, 12, 0)));
        assert_eq!(parse_date("5pm", now()), Some(at(2026, 10, 15, 17, 0)));
    }

    #[test]
    fn unrecognized_values() {
        assert_eq!(parse_date("", now()), None);
        assert_eq!(parse_date("someday", now()), None);
        assert_eq!(parse_date("tomorrow at teatime", now()), None);
        assert_eq!(parse_date("in 3 fortnights", now()), None);
        assert_eq!(parse_date("13pm", now()), None);
    }

    #[test]
    fn canonical_format() {
        assert_eq!(format_date(at(2026, 1, 2, 3, 4)), "2026-01-02T03:04:00");
    }
}
