//! Predicate sets narrowing which readings take part in an aggregation.
//!
//! A [`ReadingFilter`] is rendered to SQL by [`ReadingFilter::where_clause`]
//! and [`ReadingFilter::bind`], and evaluated in memory by
//! [`ReadingFilter::matches`]. Queries are expected to alias `readings` as
//! `r` and the joined `devices` table as `d`.

use crate::errors::{Error, Result};
use crate::model::Reading;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::Deserialize;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::Postgres;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Inclusive created_at bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Parses optional ISO-8601 bounds; blank values count as absent.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        Ok(Self {
            start: parse_optional(start)?,
            end: parse_optional(end)?,
        })
    }
}

/// Query string shared by the statistics endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct TimeRangeQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl TimeRangeQuery {
    pub fn range(&self) -> Result<TimeRange> {
        TimeRange::parse(self.start_date.as_deref(), self.end_date.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadingFilter {
    pub user_id: Option<i64>,
    pub device_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ReadingFilter {
    pub fn for_device(device_id: i64, range: TimeRange) -> Self {
        Self {
            device_id: Some(device_id),
            ..Self::within(range)
        }
    }

    pub fn for_user(user_id: i64, range: TimeRange) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::within(range)
        }
    }

    pub fn for_user_device(user_id: i64, device_id: i64, range: TimeRange) -> Self {
        Self {
            user_id: Some(user_id),
            device_id: Some(device_id),
            ..Self::within(range)
        }
    }

    fn within(range: TimeRange) -> Self {
        Self {
            user_id: None,
            device_id: None,
            start: range.start,
            end: range.end,
        }
    }

    /// Renders the `WHERE` clause with `$1..$n` placeholders, or an empty
    /// string when the filter is unconstrained. Placeholder order matches
    /// [`ReadingFilter::bind`].
    pub fn where_clause(&self) -> String {
        let mut conditions = Vec::new();

        if self.user_id.is_some() {
            conditions.push(format!("d.user_id = ${}", conditions.len() + 1));
        }
        if self.device_id.is_some() {
            conditions.push(format!("r.device_id = ${}", conditions.len() + 1));
        }
        if self.start.is_some() {
            conditions.push(format!("r.created_at >= ${}", conditions.len() + 1));
        }
        if self.end.is_some() {
            conditions.push(format!("r.created_at <= ${}", conditions.len() + 1));
        }

        if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        }
    }

    pub fn bind<'q, O>(
        &self,
        mut query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> QueryAs<'q, Postgres, O, PgArguments> {
        if let Some(user_id) = self.user_id {
            query = query.bind(user_id);
        }
        if let Some(device_id) = self.device_id {
            query = query.bind(device_id);
        }
        if let Some(start) = self.start {
            query = query.bind(start);
        }
        if let Some(end) = self.end {
            query = query.bind(end);
        }
        query
    }

    /// Evaluates the predicate set against a reading owned by `owner_id`.
    pub fn matches(&self, owner_id: i64, reading: &Reading) -> bool {
        self.user_id.map_or(true, |id| id == owner_id)
            && self.device_id.map_or(true, |id| id == reading.device_id)
            && self.start.map_or(true, |start| reading.created_at >= start)
            && self.end.map_or(true, |end| reading.created_at <= end)
    }
}

fn parse_optional(text: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match text.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_timestamp(text).map(Some),
    }
}

/// Accepts RFC 3339, a naive date-time (read as UTC) or a bare date.
/// The result is truncated to whole microseconds.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    parse_full_precision(text).map(truncate_to_micros)
}

/// Timestamps are stored and compared at microsecond precision, the
/// resolution of `timestamptz` and of [`format_timestamp`].
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

fn parse_full_precision(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            Error::Validation(format!(
                "Invalid timestamp '{}', expected ISO-8601 date-time",
                text
            ))
        })
}

/// Fixed text form used when timestamps cross the job queue.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(device_id: i64, created_at: DateTime<Utc>) -> Reading {
        Reading {
            id: 1,
            device_id,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            created_at,
        }
    }

    #[test]
    fn test_unconstrained_filter_has_no_where_clause() {
        assert_eq!(ReadingFilter::default().where_clause(), "");
    }

    #[test]
    fn test_placeholders_follow_bind_order() {
        let range = TimeRange {
            start: Some(at(0)),
            end: Some(at(60)),
        };
        let filter = ReadingFilter::for_user_device(3, 9, range);

        assert_eq!(
            filter.where_clause(),
            "WHERE d.user_id = $1 AND r.device_id = $2 AND r.created_at >= $3 AND r.created_at <= $4"
        );
    }

    #[test]
    fn test_placeholders_skip_absent_predicates() {
        let range = TimeRange {
            start: None,
            end: Some(at(60)),
        };
        let filter = ReadingFilter::for_device(9, range);

        assert_eq!(
            filter.where_clause(),
            "WHERE r.device_id = $1 AND r.created_at <= $2"
        );
    }

    #[test]
    fn test_time_bounds_are_inclusive() {
        let range = TimeRange {
            start: Some(at(10)),
            end: Some(at(20)),
        };
        let filter = ReadingFilter::for_device(1, range);

        assert!(filter.matches(5, &reading(1, at(10))));
        assert!(filter.matches(5, &reading(1, at(20))));
        assert!(!filter.matches(5, &reading(1, at(9))));
        assert!(!filter.matches(5, &reading(1, at(21))));
    }

    #[test]
    fn test_user_and_device_must_both_match() {
        let filter = ReadingFilter::for_user_device(5, 1, TimeRange::default());

        assert!(filter.matches(5, &reading(1, at(0))));
        assert!(!filter.matches(6, &reading(1, at(0))));
        assert!(!filter.matches(5, &reading(2, at(0))));
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let ts = parse_timestamp("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_naive_timestamp_as_utc() {
        let ts = parse_timestamp("2024-03-01T12:00:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        let ts = parse_timestamp("2024-03-01T12:00:00.250").unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 250);

        let ts = parse_timestamp("2024-03-01").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_truncates_to_microseconds() {
        let ts = parse_timestamp("2024-03-01T12:00:00.123456789Z").unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_parse_invalid_timestamp() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_blank_bounds_are_absent() {
        let range = TimeRange::parse(Some(""), None).unwrap();
        assert_eq!(range, TimeRange::default());
    }

    #[test]
    fn test_format_timestamp_is_fixed_width_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T10:00:00.000000Z");
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).unwrap(), ts);
    }
}
