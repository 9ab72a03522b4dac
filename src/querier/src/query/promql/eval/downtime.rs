//! `continuous_k_minute_downtime(k, preceding_policy, middle_policy, exprs...)`
//!
//! The inputs are evaluated at one-minute resolution over a window reaching
//! back far enough to see runs that started before the first step. Each input
//! is gap-filled, all inputs are AND-combined into one 0/1 availability series
//! per label set, and the minutes spent in unavailable runs of at least `k`
//! minutes are summed per step (or once over the whole window for instant
//! queries).

use std::collections::HashMap;

use super::binop::signature;
use super::functions::number_arg;
use crate::query::error::QueryError;
use crate::query::promql::ast::Call;
use crate::query::promql::labels::Labels;
use crate::query::promql::query::{KMINUTE_DOWNTIME_STEP, Query};
use crate::query::promql::value::{Matrix, Point, Series};

/// Index of the first input expression.
pub(crate) const FIRST_INPUT_ARG: usize = 3;

/// Missing-point policy that fills with zero.
const FILL_ZERO_POLICY: i64 = -1;
/// Middle policy that repeats the last known value.
const CARRY_LAST_POLICY: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DowntimeParams {
    pub k_minutes: i64,
    pub preceding_policy: i64,
    pub middle_policy: i64,
}

impl DowntimeParams {
    pub(crate) fn from_call(call: &Call) -> Result<Self, QueryError> {
        if call.args.len() <= FIRST_INPUT_ARG {
            return Err(QueryError::bad_data(format!(
                "{}() expects k, the preceding and middle missing policies and at least one expression",
                call.func
            )));
        }
        let k_minutes = number_arg(call, 0)? as i64;
        if k_minutes < 1 {
            return Err(QueryError::invalid_argument(format!(
                "invalid k in {}(): {k_minutes}, expected at least one minute",
                call.func
            )));
        }
        Ok(Self {
            k_minutes,
            preceding_policy: number_arg(call, 1)? as i64,
            middle_policy: number_arg(call, 2)? as i64,
        })
    }

    /// `None` when k minutes do not fit in an i64 of milliseconds.
    fn k_ms(&self) -> Option<i64> {
        self.k_minutes.checked_mul(KMINUTE_DOWNTIME_STEP)
    }

    fn preceding_fill(&self) -> f64 {
        fill_value(self.preceding_policy)
    }

    fn middle_fill(&self) -> f64 {
        fill_value(self.middle_policy)
    }
}

fn fill_value(policy: i64) -> f64 {
    if policy == FILL_ZERO_POLICY {
        0.0
    } else {
        policy as f64
    }
}

/// Contexts of one downtime evaluation.
#[derive(Debug, Clone)]
pub(crate) struct DowntimeWindow {
    /// One-minute range query used for the inputs.
    pub inputs: Query,
    /// The caller's query, with FixedStart re-aligned for instant queries.
    pub outer: Query,
}

pub(crate) fn plan(
    query: &Query,
    params: &DowntimeParams,
    max_query_points: i64,
) -> Result<DowntimeWindow, QueryError> {
    let mut outer = query.clone();
    let start = if query.is_instant_query {
        let lookback = query.end - query.start;
        let offset = query.zone_offset_ms(query.start);
        outer.fixed_start =
            ceil_to_step(query.fixed_start - lookback + offset, KMINUTE_DOWNTIME_STEP) - offset;
        params
            .k_ms()
            .and_then(|k_ms| (query.fixed_start - lookback).checked_sub(k_ms))
    } else {
        params
            .k_ms()
            .and_then(|k_ms| query.fixed_start.checked_sub(query.interval.max(k_ms)))
    };

    let buckets = start
        .and_then(|start| query.end.checked_sub(start))
        .map(|span| span / KMINUTE_DOWNTIME_STEP);
    let start = match (start, buckets) {
        (Some(start), Some(buckets)) if buckets <= max_query_points => start,
        _ => {
            let needed = buckets
                .map_or_else(|| "an unbounded number of".to_string(), |b| b.to_string());
            tracing::warn!(needed = %needed, max_query_points, "downtime window exceeds the bucket limit");
            return Err(QueryError::execution(format!(
                "calculating the k-minute downtime over this time range needs {needed} one-minute buckets \
                 per series, more than the limit of {max_query_points}; persist the downtime per day and \
                 sum it with sum_over_time(<persisted_metric_name>[range]) instead"
            )));
        }
    };

    let mut inputs = query.with_all_series();
    inputs.start = start;
    inputs.interval = KMINUTE_DOWNTIME_STEP;
    inputs.interval_str.clear();
    inputs.is_calendar = false;
    inputs.is_instant_query = false;
    inputs.not_need_filling = true;

    let (fixed_start, fixed_end) = inputs.correct_time()?;
    inputs.fixed_start = fixed_start;
    inputs.fixed_end = fixed_end;

    Ok(DowntimeWindow { inputs, outer })
}

fn ceil_to_step(t: i64, step: i64) -> i64 {
    let floor = t.div_euclid(step) * step;
    if floor == t { floor } else { floor + step }
}

/// Fills every series to one point per minute from FixedStart up to (not
/// including) End.
pub(crate) fn fill_missing_points(query: &Query, matrix: Matrix, params: &DowntimeParams) -> Matrix {
    let preceding = params.preceding_fill();
    let middle = params.middle_fill();
    matrix
        .into_iter()
        .map(|series| {
            let known: HashMap<i64, f64> = series.points.iter().map(|p| (p.t, p.v)).collect();
            let first = series.points.first().map_or(query.fixed_end, |p| p.t);
            let mut points = Vec::new();
            let mut ts = query.fixed_start;
            while ts < first {
                points.push(Point::new(ts, preceding));
                ts = query.next_point_time(ts);
            }
            let mut last = preceding;
            while ts < query.end {
                let v = match known.get(&ts) {
                    Some(&v) => {
                        last = v;
                        v
                    }
                    None if params.middle_policy == CARRY_LAST_POLICY => last,
                    None => middle,
                };
                points.push(Point::new(ts, v));
                ts = query.next_point_time(ts);
            }
            Series::new(series.metric, points)
        })
        .collect()
}

/// AND-combines the filled inputs into one 0/1 series per label set. A label
/// set absent from some input is unavailable unless the preceding policy
/// treats missing data as available.
pub(crate) fn combine_usability(inputs: Vec<Matrix>, params: &DowntimeParams) -> Matrix {
    let input_count = inputs.len();
    let mut index: HashMap<Labels, usize> = HashMap::new();
    let mut merged: Vec<(Series, usize)> = Vec::new();

    for matrix in inputs {
        for series in matrix {
            let sig = signature(&series.metric, false, &[]);
            match index.get(&sig) {
                Some(&pos) => {
                    let (combined, seen) = &mut merged[pos];
                    *seen += 1;
                    for (acc, p) in combined.points.iter_mut().zip(&series.points) {
                        acc.t = p.t;
                        acc.v = availability(acc.v != 0.0 && p.v != 0.0);
                    }
                }
                None => {
                    index.insert(sig, merged.len());
                    let points = series
                        .points
                        .iter()
                        .map(|p| Point::new(p.t, availability(p.v != 0.0)))
                        .collect();
                    merged.push((Series::new(series.metric, points), 1));
                }
            }
        }
    }

    let missing_is_available = params.preceding_fill() == 1.0;
    merged
        .into_iter()
        .map(|(mut series, seen)| {
            if seen != input_count {
                for p in series.points.iter_mut() {
                    p.v = availability(p.v == 1.0 && missing_is_available);
                }
            }
            series
        })
        .collect()
}

fn availability(available: bool) -> f64 {
    if available { 1.0 } else { 0.0 }
}

/// Minutes spent in unavailable runs of at least `k_minutes`.
pub(crate) fn unavailable_minutes(matrix: Matrix, outer: &Query, k_minutes: i64) -> Matrix {
    if outer.is_instant_query {
        matrix
            .into_iter()
            .map(|series| {
                let total = instant_unavailable(&series.points, outer.fixed_start, k_minutes);
                Series::new(series.metric, vec![Point::new(outer.end, total as f64)])
            })
            .collect()
    } else {
        matrix
            .into_iter()
            .map(|series| {
                let points = range_unavailable(&series.points, outer, k_minutes);
                Series::new(series.metric, points)
            })
            .collect()
    }
}

/// One value per step, counting only the runs inside the step's window.
fn range_unavailable(points: &[Point], query: &Query, k_minutes: i64) -> Vec<Point> {
    let steps = query.step_times();
    let covers_k = k_minutes
        .checked_mul(KMINUTE_DOWNTIME_STEP)
        .is_some_and(|k_ms| query.interval >= k_ms);
    if !covers_k {
        return steps.into_iter().map(|ts| Point::new(ts, 0.0)).collect();
    }
    let minutes_per_step = query.interval / KMINUTE_DOWNTIME_STEP;
    let lower = query.fixed_start - (minutes_per_step - 1) * KMINUTE_DOWNTIME_STEP;

    let mut cursor = 0;
    steps
        .into_iter()
        .map(|ts| {
            let mut total = 0;
            let mut run = 0;
            while let Some(p) = points.get(cursor) {
                if p.t > ts {
                    break;
                }
                cursor += 1;
                if p.t < lower {
                    continue;
                }
                if p.v == 0.0 {
                    run += 1;
                    if p.t == ts && run >= k_minutes {
                        total += run;
                    }
                } else {
                    if run >= k_minutes {
                        total += run;
                    }
                    run = 0;
                }
            }
            Point::new(ts, total as f64)
        })
        .collect()
}

/// Total over the whole window. A qualifying run that is already in progress
/// at `fixed_start` belongs to the previous window, so its earlier minutes are
/// not counted again.
fn instant_unavailable(points: &[Point], fixed_start: i64, k_minutes: i64) -> i64 {
    let mut total = 0;
    let mut run = 0;
    let mut carried = 0;
    let last = points.len().saturating_sub(1);
    for (i, p) in points.iter().enumerate() {
        if run > 0 && p.t == fixed_start && run >= k_minutes {
            carried = run;
        }
        if p.v == 0.0 {
            run += 1;
            if i == last && run >= k_minutes {
                total += run - std::mem::take(&mut carried);
            }
        } else {
            if run >= k_minutes {
                total += run - std::mem::take(&mut carried);
            }
            run = 0;
        }
    }
    total
}
