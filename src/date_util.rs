use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static RE_EXPLICIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})\s*\.\.\s*(\d{4}-\d{2}-\d{2})$").unwrap()
});
static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());
static RE_ROLLING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{1,4})[dD]$").unwrap());

/// An inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidDateRange(format!(
                "end {end} is before start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a range expression relative to `today`.
    ///
    /// Supported formats:
    /// - `2025-01-01..2025-03-31`: explicit bounds
    /// - `2025-Q1`: calendar quarter
    /// - `2025-02`: calendar month
    /// - `30d`: the last N days ending today
    pub fn parse(s: &str, today: NaiveDate) -> Result<Self> {
        let s = s.trim();

        if let Some(caps) = RE_EXPLICIT.captures(s) {
            let start = parse_day(&caps[1])?;
            let end = parse_day(&caps[2])?;
            return Self::new(start, end);
        }

        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1]
                .parse()
                .map_err(|_| Error::InvalidDateRange(s.to_string()))?;
            let q: u32 = caps[2]
                .parse()
                .map_err(|_| Error::InvalidDateRange(s.to_string()))?;
            let first_month = (q - 1) * 3 + 1;
            let start = ymd(year, first_month, 1, s)?;
            let end = last_day_of_month(year, first_month + 2)
                .ok_or_else(|| Error::InvalidDateRange(s.to_string()))?;
            return Self::new(start, end);
        }

        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1]
                .parse()
                .map_err(|_| Error::InvalidDateRange(s.to_string()))?;
            let month: u32 = caps[2]
                .parse()
                .map_err(|_| Error::InvalidDateRange(s.to_string()))?;
            let start = ymd(year, month, 1, s)?;
            let end = last_day_of_month(year, month)
                .ok_or_else(|| Error::InvalidDateRange(s.to_string()))?;
            return Self::new(start, end);
        }

        if let Some(caps) = RE_ROLLING.captures(s) {
            let n: i64 = caps[1]
                .parse()
                .map_err(|_| Error::InvalidDateRange(s.to_string()))?;
            if n == 0 {
                return Err(Error::InvalidDateRange("rolling window must be at least 1 day".into()));
            }
            return Self::new(today - Duration::days(n - 1), today);
        }

        Err(Error::InvalidDateRange(format!(
            "unrecognized range '{s}' (try 2025-01-01..2025-01-31, 2025-Q1, 2025-01 or 30d)"
        )))
    }

    /// Number of days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    pub fn start_key(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_key(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start_key(), self.end_key())
    }
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::InvalidDateRange(format!("{s}: {e}")))
}

fn ymd(year: i32, month: u32, day: u32, raw: &str) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| Error::InvalidDateRange(raw.to_string()))
}

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.pred_opt()
}

/// Fractional days between two instants (negative if `end` precedes `start`).
pub fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_seconds() as f64 / 86_400.0
}

/// Extract YYYY-MM-DD from an RFC 3339 timestamp.
pub fn date_key(ts: &DateTime<Utc>) -> String {
    ts.date_naive().format("%Y-%m-%d").to_string()
}

/// Parse the timestamp flavours we see from trackers and git
/// (`2024-01-01T10:00:00.000+0000`, RFC 3339, or a bare date).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(last_day_of_month(2025, 1), Some(day(2025, 1, 31)));
        assert_eq!(last_day_of_month(2024, 2), Some(day(2024, 2, 29))); // Leap year
        assert_eq!(last_day_of_month(2025, 12), Some(day(2025, 12, 31)));
    }

    #[test]
    fn test_parse_explicit() {
        let r = DateRange::parse("2024-01-01..2024-01-31", day(2025, 1, 1)).unwrap();
        assert_eq!(r.start, day(2024, 1, 1));
        assert_eq!(r.end, day(2024, 1, 31));
        assert_eq!(r.days(), 31);
    }

    #[test]
    fn test_parse_inverted_is_error() {
        assert!(DateRange::parse("2024-02-01..2024-01-01", day(2025, 1, 1)).is_err());
    }

    #[test]
    fn test_parse_quarter_and_month() {
        let q = DateRange::parse("2024-Q1", day(2025, 1, 1)).unwrap();
        assert_eq!((q.start, q.end), (day(2024, 1, 1), day(2024, 3, 31)));

        let m = DateRange::parse("2024-02", day(2025, 1, 1)).unwrap();
        assert_eq!((m.start, m.end), (day(2024, 2, 1), day(2024, 2, 29)));
    }

    #[test]
    fn test_parse_rolling() {
        let r = DateRange::parse("30d", day(2025, 3, 31)).unwrap();
        assert_eq!(r.end, day(2025, 3, 31));
        assert_eq!(r.days(), 30);
        assert!(DateRange::parse("0d", day(2025, 3, 31)).is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(DateRange::parse("last quarter", day(2025, 1, 1)).is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let jira = parse_timestamp("2024-01-04T10:00:00.000+0000").unwrap();
        assert_eq!(date_key(&jira), "2024-01-04");
        let rfc = parse_timestamp("2024-01-04T10:00:00Z").unwrap();
        assert_eq!(jira, rfc);
        assert!(parse_timestamp("2024-01-04").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_days_between() {
        let a = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let b = parse_timestamp("2024-01-04T00:00:00Z").unwrap();
        assert_eq!(days_between(a, b), 3.0);
    }
}
