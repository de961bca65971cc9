//! UTC normalisation and structured time encoding.

use chrono::{DateTime, Datelike, DurationRound, TimeZone, Timelike, Utc};

/// Broken-down UTC instant, one numeric value per cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParts {
    pub second: u32,
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    /// 0 = Sunday .. 6 = Saturday
    pub weekday: u32,
    pub year: i32,
}

/// Convert any timezone-aware instant into UTC.
pub fn to_utc<Tz: TimeZone>(t: DateTime<Tz>) -> DateTime<Utc> {
    t.with_timezone(&Utc)
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Drop sub-second precision.
pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(chrono::Duration::seconds(1)).unwrap_or(t)
}

pub fn encode(t: DateTime<Utc>) -> TimeParts {
    TimeParts {
        second: t.second(),
        minute: t.minute(),
        hour: t.hour(),
        day: t.day(),
        month: t.month(),
        weekday: t.weekday().num_days_from_sunday(),
        year: t.year(),
    }
}

/// Rebuild a UTC instant from its parts. `None` for impossible dates (e.g. Feb 30).
pub fn decode(parts: &TimeParts) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        parts.year,
        parts.month,
        parts.day,
        parts.hour,
        parts.minute,
        parts.second,
    )
    .single()
}

/// Largest offset any schedule, lease or timeout may use (100 years).
pub const MAX_OFFSET_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// `t + seconds`, or `None` if the result leaves chrono's range.
pub fn add_seconds(t: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(seconds).and_then(|d| t.checked_add_signed(d))
}

/// `t - seconds`, or `None` if the result leaves chrono's range.
pub fn sub_seconds(t: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(seconds).and_then(|d| t.checked_sub_signed(d))
}
