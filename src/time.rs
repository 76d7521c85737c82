use crate::error::{ReaderError, ReaderResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// A UTC instant plus any adjustments made to obtain it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInstant {
    pub utc: DateTime<Utc>,
    pub warnings: Vec<String>,
}

impl ResolvedInstant {
    fn exact(utc: DateTime<Utc>) -> Self {
        Self {
            utc,
            warnings: Vec::new(),
        }
    }
}

const GAP_SEARCH_MINUTES: i64 = 180;

/// Interprets a wall-clock time in `tz`.
///
/// Ambiguous times (clocks turned back) resolve to the earlier instant;
/// nonexistent times (clocks turned forward) resolve to the next valid local
/// time. Both record a warning.
pub fn localize<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> ReaderResult<ResolvedInstant>
where
    Tz::Offset: Send + Sync,
{
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Ok(ResolvedInstant::exact(dt.with_timezone(&Utc))),
        chrono::LocalResult::Ambiguous(a, b) => {
            let earlier = if a.with_timezone(&Utc) <= b.with_timezone(&Utc) {
                a
            } else {
                b
            };
            Ok(ResolvedInstant {
                utc: earlier.with_timezone(&Utc),
                warnings: vec![format!(
                    "Ambiguous local datetime {naive} resolved to earlier instance {}",
                    earlier.to_rfc3339()
                )],
            })
        }
        chrono::LocalResult::None => {
            let next_valid = find_next_valid_local(tz, naive, GAP_SEARCH_MINUTES).ok_or_else(|| {
                ReaderError::invalid(format!("no valid local datetime found after {naive}"))
            })?;
            let shift = (next_valid.naive_local() - naive).num_minutes();
            Ok(ResolvedInstant {
                utc: next_valid.with_timezone(&Utc),
                warnings: vec![format!(
                    "Nonexistent local datetime {naive} resolved to next valid local time {} (shift +{shift}m)",
                    next_valid.to_rfc3339()
                )],
            })
        }
    }
}

fn find_next_valid_local<Tz: TimeZone>(
    tz: &Tz,
    naive: NaiveDateTime,
    max_minutes: i64,
) -> Option<DateTime<Tz>>
where
    Tz::Offset: Send + Sync,
{
    for minutes in 0..=max_minutes {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return Some(dt),
            chrono::LocalResult::Ambiguous(a, b) => {
                return Some(if a.with_timezone(&Utc) <= b.with_timezone(&Utc) {
                    a
                } else {
                    b
                })
            }
            chrono::LocalResult::None => continue,
        }
    }
    None
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

/// Parses a user supplied time.
///
/// Strings carrying an offset are taken as is; everything else is wall-clock
/// time in `tz`. Date-only input means local midnight.
pub fn parse_time_input<Tz: TimeZone>(tz: &Tz, input: &str) -> ReaderResult<ResolvedInstant>
where
    Tz::Offset: Send + Sync,
{
    let text = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(ResolvedInstant::exact(dt.with_timezone(&Utc)));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(ResolvedInstant::exact(dt.with_timezone(&Utc)));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return localize(tz, naive);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
                ReaderError::invalid(format!("invalid date {text:?}"))
            })?;
            return localize(tz, midnight);
        }
    }
    Err(ReaderError::invalid(format!(
        "unrecognised time {text:?}; use RFC 3339, YYYY-MM-DD[ HH:MM[:SS]] or DD.MM.YYYY[ HH:MM[:SS]]"
    )))
}
