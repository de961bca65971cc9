//! Cron expression engine.
//!
//! An expression has 5 or 6 space-separated fields
//! (`[sec] min hour day-of-month month day-of-week`). Each field is turned into
//! a sorted set of allowed values; an instant fires iff every one of its six
//! field values is in the matching set.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::time;

pub const SECONDS: (u32, u32) = (0, 59);
pub const MINUTES: (u32, u32) = (0, 59);
pub const HOURS: (u32, u32) = (0, 23);
pub const DAYS_OF_MONTH: (u32, u32) = (1, 31);
pub const MONTHS: (u32, u32) = (1, 12);
pub const DAYS_OF_WEEK: (u32, u32) = (0, 7);

// Feb 29 combined with a fixed weekday can take 28 years to recur.
const SEARCH_HORIZON_YEARS: i32 = 30;

/// Parsed firing sets, one per field. Sets may be empty, in which case the
/// model never fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronModel {
    pub seconds: Vec<u32>,
    pub minutes: Vec<u32>,
    pub hours: Vec<u32>,
    pub days_of_month: Vec<u32>,
    pub months: Vec<u32>,
    /// 0 = Sunday; 7 is folded into 0 during parsing.
    pub days_of_week: Vec<u32>,
}

impl CronModel {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let fields: Vec<&str> = match parts.len() {
            5 => std::iter::once("*").chain(parts.iter().copied()).collect(),
            6 => parts,
            n => {
                return Err(SchedError::invalid_cron(
                    expression,
                    format!("expected 5 or 6 fields, got {n}"),
                ))
            }
        };

        let field = |idx: usize, range: (u32, u32)| {
            convert_to_model(fields[idx], range.0, range.1)
                .map_err(|reason| SchedError::invalid_cron(expression, reason))
        };

        let mut days_of_week: Vec<u32> = field(5, DAYS_OF_WEEK)?
            .into_iter()
            .map(|d| if d == 7 { 0 } else { d })
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            seconds: field(0, SECONDS)?,
            minutes: field(1, MINUTES)?,
            hours: field(2, HOURS)?,
            days_of_month: field(3, DAYS_OF_MONTH)?,
            months: field(4, MONTHS)?,
            days_of_week,
        })
    }

    /// True when at least one field can never match.
    pub fn is_empty(&self) -> bool {
        self.seconds.is_empty()
            || self.minutes.is_empty()
            || self.hours.is_empty()
            || self.days_of_month.is_empty()
            || self.months.is_empty()
            || self.days_of_week.is_empty()
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let p = time::encode(t);
        contains(&self.seconds, p.second)
            && contains(&self.minutes, p.minute)
            && contains(&self.hours, p.hour)
            && contains(&self.days_of_month, p.day)
            && contains(&self.months, p.month)
            && contains(&self.days_of_week, p.weekday)
    }

    /// Earliest whole-second instant strictly after `after` that matches.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_empty() {
            return None;
        }

        let mut t = time::add_seconds(time::truncate_to_second(after), 1)?;
        let last_year = t.year() + SEARCH_HORIZON_YEARS;

        while t.year() <= last_year {
            let p = time::encode(t);

            if !contains(&self.months, p.month) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !contains(&self.days_of_month, p.day) || !contains(&self.days_of_week, p.weekday) {
                t = start_of_next_day(t)?;
                continue;
            }

            match next_in(&self.hours, p.hour) {
                Some(h) if h == p.hour => {}
                Some(h) => {
                    t = at(t, h, 0, 0)?;
                    continue;
                }
                None => {
                    t = start_of_next_day(t)?;
                    continue;
                }
            }

            match next_in(&self.minutes, p.minute) {
                Some(m) if m == p.minute => {}
                Some(m) => {
                    t = at(t, p.hour, m, 0)?;
                    continue;
                }
                None => {
                    t = at(t, p.hour, 0, 0)?.checked_add_signed(Duration::hours(1))?;
                    continue;
                }
            }

            match next_in(&self.seconds, p.second) {
                Some(s) if s == p.second => return Some(t),
                Some(s) => t = at(t, p.hour, p.minute, s)?,
                None => t = at(t, p.hour, p.minute, 0)?.checked_add_signed(Duration::minutes(1))?,
            }
        }

        None
    }
}

impl std::str::FromStr for CronModel {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Expand one cron field into its sorted, de-duplicated value set within `[lo, hi]`.
///
/// `*` becomes `lo-hi`, `a-b` runs are enumerated (reversed runs are swapped),
/// a trailing `/step` keeps only values divisible by `step`.
pub fn convert_to_model(field: &str, lo: u32, hi: u32) -> std::result::Result<Vec<u32>, String> {
    let field = field.trim();
    if field.is_empty() {
        return Err("empty field".to_string());
    }

    let (body, step) = match field.split_once('/') {
        Some((body, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid step `{step}` in `{field}`"))?;
            if step == 0 {
                return Err(format!("step must be positive in `{field}`"));
            }
            (body, Some(step))
        }
        None => (field, None),
    };

    let mut values = Vec::new();
    for item in body.split(',') {
        let item = if item == "*" {
            format!("{lo}-{hi}")
        } else {
            item.to_string()
        };

        match item.split_once('-') {
            Some((a, b)) => {
                let a = parse_value(a, field)?;
                let b = parse_value(b, field)?;
                let (start, end) = if a <= b { (a, b) } else { (b, a) };
                // only [lo, hi] survives the clip below
                let (start, end) = (start.max(lo), end.min(hi));
                if start <= end {
                    values.extend(start..=end);
                }
            }
            None => values.push(parse_value(&item, field)?),
        }
    }

    if let Some(step) = step {
        values.retain(|v| v % step == 0);
    }

    values.retain(|v| (lo..=hi).contains(v));
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(raw: &str, field: &str) -> std::result::Result<u32, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("invalid value `{raw}` in `{field}`"))
}

fn contains(set: &[u32], v: u32) -> bool {
    set.binary_search(&v).is_ok()
}

/// Smallest member of `set` that is `>= v`.
fn next_in(set: &[u32], v: u32) -> Option<u32> {
    set.iter().copied().find(|x| *x >= v)
}

fn at(t: DateTime<Utc>, hour: u32, minute: u32, second: u32) -> Option<DateTime<Utc>> {
    Some(
        t.date_naive()
            .and_hms_opt(hour, minute, second)?
            .and_utc(),
    )
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(
        NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc(),
    )
}
