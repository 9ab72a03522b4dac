//! Evaluation context and step alignment
//!
//! A [`Query`] is created at request entry and handed down the evaluation
//! tree by reference. Nodes that need different settings for their children
//! derive a copy ([`Query::with_all_series`], step-invariant and downtime
//! sub-queries) rather than mutating the parent's context. The only state
//! shared between copies is the external latency counter.
//!
//! Fixed intervals align to the backend's bucket boundaries in the configured
//! zone:
//!
//! ```text
//! offset   = utc offset of the zone at Start, in seconds
//! Fixed(t) = floor((t + offset*1000) / Interval) * Interval - offset*1000
//! ```
//!
//! Calendar intervals align to the start of the minute, hour, local day,
//! local week (Monday), month, quarter or year.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{
    DateTime, Datelike, Days, LocalResult, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::query::error::QueryError;

/// Step of the sub-query driving `continuous_k_minute_downtime`.
pub const KMINUTE_DOWNTIME_STEP: i64 = 60_000;
/// Default cap on the number of one-minute buckets a downtime query may scan.
pub const DEFAULT_MAX_QUERY_POINTS: i64 = 10_000;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;
const WEEK_MS: i64 = 604_800_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarInterval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl CalendarInterval {
    pub fn parse(interval: &str) -> Option<Self> {
        match interval {
            "minute" | "1m" => Some(CalendarInterval::Minute),
            "hour" | "1h" => Some(CalendarInterval::Hour),
            "day" | "1d" => Some(CalendarInterval::Day),
            "week" | "1w" => Some(CalendarInterval::Week),
            "month" | "1M" => Some(CalendarInterval::Month),
            "quarter" | "1q" => Some(CalendarInterval::Quarter),
            "year" | "1y" => Some(CalendarInterval::Year),
            _ => None,
        }
    }
}

/// A filter forwarded to the metric-model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub operation: String,
    pub value: serde_json::Value,
}

/// Evaluation context of one request.
#[derive(Debug, Clone)]
pub struct Query {
    pub query_str: String,
    /// Unix milliseconds
    pub start: i64,
    pub end: i64,
    /// Step width in milliseconds; ignored for calendar queries
    pub interval: i64,
    pub interval_str: String,
    pub fixed_start: i64,
    pub fixed_end: i64,
    pub is_instant_query: bool,
    pub is_calendar: bool,
    /// Disables backend paging for the subtree.
    pub if_need_all_series: bool,
    pub not_need_filling: bool,
    pub is_metric_model: bool,
    pub filters: Vec<Filter>,
    pub timezone: Tz,
    pub external_duration_ms: Arc<AtomicI64>,
}

impl Query {
    pub fn range(query_str: impl Into<String>, start: i64, end: i64, interval: i64) -> Self {
        Self {
            query_str: query_str.into(),
            start,
            end,
            interval,
            interval_str: String::new(),
            fixed_start: start,
            fixed_end: end,
            is_instant_query: false,
            is_calendar: false,
            if_need_all_series: false,
            not_need_filling: false,
            is_metric_model: false,
            filters: Vec::new(),
            timezone: Tz::UTC,
            external_duration_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// An instant query evaluated at exactly `time`.
    pub fn instant(query_str: impl Into<String>, time: i64) -> Self {
        Self {
            is_instant_query: true,
            ..Self::range(query_str, time, time, 1)
        }
    }

    pub fn with_calendar_interval(mut self, interval_str: impl Into<String>) -> Self {
        self.is_calendar = true;
        self.interval_str = interval_str.into();
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    /// Copy of this context that asks the leaf layer for every series.
    pub fn with_all_series(&self) -> Query {
        let mut query = self.clone();
        query.if_need_all_series = true;
        query
    }

    pub fn is_instant(&self) -> bool {
        self.is_instant_query || self.start == self.end
    }

    pub fn add_external_duration(&self, ms: i64) {
        self.external_duration_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn external_duration(&self) -> i64 {
        self.external_duration_ms.load(Ordering::Relaxed)
    }

    /// UTC offset of the configured zone at `t`, in milliseconds.
    pub fn zone_offset_ms(&self, t: i64) -> i64 {
        DateTime::from_timestamp_millis(t)
            .map(|dt| {
                self.timezone
                    .offset_from_utc_datetime(&dt.naive_utc())
                    .fix()
                    .local_minus_utc() as i64
                    * 1000
            })
            .unwrap_or(0)
    }

    /// Aligns start and end to bucket boundaries, returning (FixedStart, FixedEnd).
    pub fn correct_time(&self) -> Result<(i64, i64), QueryError> {
        if self.is_calendar {
            let calendar = self.calendar_interval()?;
            return Ok((
                self.calendar_floor(calendar, self.start),
                self.calendar_floor(calendar, self.end),
            ));
        }
        if self.interval <= 0 {
            if self.is_instant_query {
                return Ok((self.start, self.end));
            }
            return Err(QueryError::bad_data(
                "zero or negative query resolution step widths are not accepted",
            ));
        }
        let offset = self.zone_offset_ms(self.start);
        Ok((
            align(self.start, self.interval, offset),
            align(self.end, self.interval, offset),
        ))
    }

    fn calendar_interval(&self) -> Result<CalendarInterval, QueryError> {
        CalendarInterval::parse(&self.interval_str).ok_or_else(|| {
            QueryError::bad_data(format!(
                "unsupported calendar interval {:?}",
                self.interval_str
            ))
        })
    }

    /// Timestamp of the step following `t`.
    pub fn next_point_time(&self, t: i64) -> i64 {
        if !self.is_calendar {
            return t + self.interval;
        }
        match CalendarInterval::parse(&self.interval_str) {
            Some(CalendarInterval::Minute) => t + MINUTE_MS,
            Some(CalendarInterval::Hour) => t + HOUR_MS,
            Some(CalendarInterval::Day) => t + DAY_MS,
            Some(CalendarInterval::Week) => t + WEEK_MS,
            Some(CalendarInterval::Month) => self.add_months(t, 1),
            Some(CalendarInterval::Quarter) => self.add_months(t, 3),
            Some(CalendarInterval::Year) => self.add_months(t, 12),
            None => t + self.interval,
        }
    }

    /// Ordered step timestamps: FixedStart alone for instant queries, otherwise
    /// FixedStart..=FixedEnd.
    pub fn step_times(&self) -> Vec<i64> {
        if self.is_instant_query {
            return vec![self.fixed_start];
        }
        let mut steps = Vec::new();
        let mut ts = self.fixed_start;
        while ts <= self.fixed_end {
            steps.push(ts);
            let next = self.next_point_time(ts);
            if next <= ts {
                break;
            }
            ts = next;
        }
        steps
    }

    fn local_date(&self, t: i64) -> Option<NaiveDate> {
        DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&self.timezone).date_naive())
    }

    fn calendar_floor(&self, calendar: CalendarInterval, t: i64) -> i64 {
        let Some(date) = self.local_date(t) else {
            return t;
        };
        let first = match calendar {
            CalendarInterval::Minute => return t.div_euclid(MINUTE_MS) * MINUTE_MS,
            CalendarInterval::Hour => return t.div_euclid(HOUR_MS) * HOUR_MS,
            CalendarInterval::Day => Some(date),
            CalendarInterval::Week => date
                .checked_sub_days(Days::new(date.weekday().num_days_from_monday() as u64)),
            CalendarInterval::Month => date.with_day(1),
            CalendarInterval::Quarter => {
                NaiveDate::from_ymd_opt(date.year(), (date.month0() / 3) * 3 + 1, 1)
            }
            CalendarInterval::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        };
        first
            .and_then(|d| self.resolve_local(d.and_time(NaiveTime::MIN)))
            .unwrap_or(t)
    }

    fn add_months(&self, t: i64, months: u32) -> i64 {
        DateTime::from_timestamp_millis(t)
            .map(|dt| dt.with_timezone(&self.timezone).naive_local())
            .and_then(|local| local.checked_add_months(Months::new(months)))
            .and_then(|local| self.resolve_local(local))
            .unwrap_or_else(|| t.saturating_add(i64::from(months) * 31 * DAY_MS))
    }

    /// Maps a wall-clock time to epoch milliseconds. Ambiguous times take the
    /// earlier instant; times inside a DST gap move one hour forward.
    fn resolve_local(&self, local: NaiveDateTime) -> Option<i64> {
        match self.timezone.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt.timestamp_millis()),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp_millis()),
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(local + chrono::Duration::hours(1)))
                .earliest()
                .map(|dt| dt.timestamp_millis()),
        }
    }
}

fn align(t: i64, interval: i64, offset_ms: i64) -> i64 {
    (t + offset_ms).div_euclid(interval) * interval - offset_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::{America, Asia, Australia, Europe};
    use ntest::timeout;
    use proptest::prelude::*;

    fn ms(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        tz.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .earliest()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_fixed_alignment_utc() {
        let q = Query::range("m", 1_000_030_000, 1_000_150_000, 60_000);
        let (fs, fe) = q.correct_time().unwrap();
        assert_eq!(fs, 1_000_020_000);
        assert_eq!(fe, 1_000_140_000);
    }

    #[test]
    fn test_fixed_alignment_uses_zone_offset() {
        // Asia/Kolkata is +05:30, so hourly buckets start at half past the UTC hour.
        let start = ms(Tz::UTC, 2024, 1, 10, 10, 45);
        let q = Query::range("m", start, start, HOUR_MS).with_timezone(Asia::Kolkata);
        let (fs, _) = q.correct_time().unwrap();
        assert_eq!(fs, ms(Tz::UTC, 2024, 1, 10, 10, 30));
    }

    #[test]
    fn test_non_positive_interval_rejected_for_range() {
        let q = Query::range("m", 0, 10, 0);
        assert!(q.correct_time().is_err());
        let q = Query::instant("m", 10);
        assert_eq!(q.correct_time().unwrap(), (10, 10));
    }

    #[test]
    fn test_unknown_calendar_interval_is_bad_data() {
        let q = Query::range("m", 0, 10, 0).with_calendar_interval("fortnight");
        let err = q.correct_time().unwrap_err();
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_calendar_day_on_spring_forward() {
        let t = ms(Europe::Berlin, 2024, 3, 31, 12, 0);
        let q = Query::range("m", t, t, 0)
            .with_calendar_interval("day")
            .with_timezone(Europe::Berlin);
        let (fs, _) = q.correct_time().unwrap();
        assert_eq!(fs, ms(Europe::Berlin, 2024, 3, 31, 0, 0));
    }

    #[test]
    fn test_calendar_day_when_midnight_is_skipped() {
        // Santiago jumps from 00:00 to 01:00 on 2024-09-08.
        let t = ms(America::Santiago, 2024, 9, 8, 15, 0);
        let q = Query::range("m", t, t, 0)
            .with_calendar_interval("1d")
            .with_timezone(America::Santiago);
        let (fs, _) = q.correct_time().unwrap();
        assert_eq!(fs, ms(America::Santiago, 2024, 9, 8, 1, 0));
    }

    #[test]
    fn test_calendar_week_starts_monday() {
        // 2024-01-10 is a Wednesday.
        let t = ms(Europe::Berlin, 2024, 1, 10, 8, 0);
        let q = Query::range("m", t, t, 0)
            .with_calendar_interval("week")
            .with_timezone(Europe::Berlin);
        assert_eq!(q.correct_time().unwrap().0, ms(Europe::Berlin, 2024, 1, 8, 0, 0));
    }

    #[test]
    fn test_calendar_quarter_and_year() {
        let t = ms(Europe::Berlin, 2024, 8, 20, 8, 0);
        let q = Query::range("m", t, t, 0)
            .with_calendar_interval("quarter")
            .with_timezone(Europe::Berlin);
        assert_eq!(q.correct_time().unwrap().0, ms(Europe::Berlin, 2024, 7, 1, 0, 0));

        let q = q.with_calendar_interval("1y");
        assert_eq!(q.correct_time().unwrap().0, ms(Europe::Berlin, 2024, 1, 1, 0, 0));
    }

    #[test]
    fn test_calendar_month_steps_cross_dst() {
        let start = ms(Europe::Berlin, 2024, 2, 1, 0, 0);
        let end = ms(Europe::Berlin, 2024, 5, 15, 0, 0);
        let mut q = Query::range("m", start, end, 0)
            .with_calendar_interval("month")
            .with_timezone(Europe::Berlin);
        let (fs, fe) = q.correct_time().unwrap();
        q.fixed_start = fs;
        q.fixed_end = fe;
        assert_eq!(
            q.step_times(),
            vec![
                ms(Europe::Berlin, 2024, 2, 1, 0, 0),
                ms(Europe::Berlin, 2024, 3, 1, 0, 0),
                ms(Europe::Berlin, 2024, 4, 1, 0, 0),
                ms(Europe::Berlin, 2024, 5, 1, 0, 0),
            ]
        );
    }

    #[test]
    fn test_calendar_minute_truncates_epoch() {
        let q = Query::range("m", 90_500, 90_500, 0)
            .with_calendar_interval("minute")
            .with_timezone(Asia::Kolkata);
        assert_eq!(q.correct_time().unwrap(), (60_000, 60_000));
        assert_eq!(q.next_point_time(60_000), 120_000);
    }

    #[test]
    #[timeout(5000)]
    fn test_step_times_range_and_instant() {
        let mut q = Query::range("m", 0, 180_000, 60_000);
        q.fixed_start = 0;
        q.fixed_end = 180_000;
        assert_eq!(q.step_times(), vec![0, 60_000, 120_000, 180_000]);

        let mut q = Query::instant("m", 5);
        q.fixed_start = 5;
        q.fixed_end = 5;
        assert_eq!(q.step_times(), vec![5]);
    }

    #[test]
    fn test_with_all_series_shares_latency_counter() {
        let q = Query::range("m", 0, 0, 1);
        let child = q.with_all_series();
        assert!(child.if_need_all_series);
        assert!(!q.if_need_all_series);
        child.add_external_duration(12);
        assert_eq!(q.external_duration(), 12);
    }

    fn zones() -> impl Strategy<Value = Tz> {
        prop_oneof![
            Just(Tz::UTC),
            Just(Europe::Berlin),
            Just(America::New_York),
            Just(America::Santiago),
            Just(Australia::Lord_Howe),
            Just(Asia::Kolkata),
        ]
    }

    fn intervals() -> impl Strategy<Value = i64> {
        prop_oneof![
            Just(MINUTE_MS),
            Just(5 * MINUTE_MS),
            Just(HOUR_MS),
            Just(DAY_MS),
            Just(15_000i64),
        ]
    }

    proptest! {
        /// Fixed alignment lands on a zone-shifted bucket boundary no later than Start.
        #[test]
        fn prop_fixed_alignment_across_dst(
            tz in zones(),
            interval in intervals(),
            // 2023-01-01 .. 2026-01-01, covering several transitions per zone
            start in 1_672_531_200_000i64..1_767_225_600_000i64,
        ) {
            let q = Query::range("m", start, start, interval).with_timezone(tz);
            let (fs, _) = q.correct_time().unwrap();
            let offset = q.zone_offset_ms(start);
            prop_assert!(fs <= start);
            prop_assert!(start - fs < interval);
            prop_assert_eq!((fs + offset).rem_euclid(interval), 0);
        }

        /// Calendar day alignment always yields a local midnight (or the first
        /// instant after a skipped midnight) on the same local date.
        #[test]
        fn prop_calendar_day_is_local_day_start(
            tz in zones(),
            start in 1_672_531_200_000i64..1_767_225_600_000i64,
        ) {
            let q = Query::range("m", start, start, 0)
                .with_calendar_interval("day")
                .with_timezone(tz);
            let (fs, _) = q.correct_time().unwrap();
            prop_assert!(fs <= start);
            let local = DateTime::from_timestamp_millis(fs).unwrap().with_timezone(&tz);
            prop_assert_eq!(local.date_naive(), q.local_date(start).unwrap());
            prop_assert!(local.hour() <= 1);
        }
    }
}
