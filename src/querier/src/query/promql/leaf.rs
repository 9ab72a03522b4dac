//! Leaf-node data access
//!
//! The evaluator never touches storage directly. Selectors and range-vector
//! functions are handed to a [`LeafNodes`] implementation which turns them
//! into bucketed series aligned to the query's step timestamps. The search
//! backend implementation lives outside this crate; [`InMemoryLeafNodes`]
//! serves fixtures and tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use serde::Deserialize;

use super::ast::{MatrixSelector, VectorSelector};
use super::labels::{Labels, Matcher};
use super::query::Query;
use super::value::{Matrix, PageMatrix, Point, Series, Value};
use crate::query::error::QueryError;

/// Range-vector functions evaluated by the leaf layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFunction {
    Rate,
    Increase,
    Irate,
    Delta,
    Changes,
    AvgOverTime,
    SumOverTime,
    MaxOverTime,
    MinOverTime,
    CountOverTime,
}

impl RangeFunction {
    pub fn name(&self) -> &'static str {
        match self {
            RangeFunction::Rate => "rate",
            RangeFunction::Increase => "increase",
            RangeFunction::Irate => "irate",
            RangeFunction::Delta => "delta",
            RangeFunction::Changes => "changes",
            RangeFunction::AvgOverTime => "avg_over_time",
            RangeFunction::SumOverTime => "sum_over_time",
            RangeFunction::MaxOverTime => "max_over_time",
            RangeFunction::MinOverTime => "min_over_time",
            RangeFunction::CountOverTime => "count_over_time",
        }
    }
}

/// Storage boundary of the evaluator.
///
/// Every returned series carries one point per step timestamp of the query
/// at most, ascending, with timestamps equal to the step they belong to.
#[async_trait]
pub trait LeafNodes: Send + Sync {
    async fn eval_vector_selector(
        &self,
        selector: &VectorSelector,
        query: &Query,
    ) -> Result<Value, QueryError>;

    /// `rate` and `increase`
    async fn rate_aggs(
        &self,
        selector: &MatrixSelector,
        query: &Query,
        func: RangeFunction,
    ) -> Result<Value, QueryError>;

    async fn delta_aggs(
        &self,
        selector: &MatrixSelector,
        query: &Query,
    ) -> Result<Value, QueryError>;

    async fn changes_aggs(
        &self,
        selector: &MatrixSelector,
        query: &Query,
    ) -> Result<Value, QueryError>;

    async fn irate_eval(
        &self,
        selector: &MatrixSelector,
        query: &Query,
    ) -> Result<Value, QueryError>;

    /// `*_over_time`
    async fn agg_over_time(
        &self,
        selector: &MatrixSelector,
        query: &Query,
        func: RangeFunction,
    ) -> Result<Value, QueryError>;

    /// Label names of the matching series when `field_name` is empty,
    /// otherwise the distinct values of that label.
    async fn eval_vector_selector_fields(
        &self,
        selector: &VectorSelector,
        query: &Query,
        field_name: &str,
    ) -> Result<BTreeSet<String>, QueryError>;

    /// Label sets of the series matching any of the matcher sets.
    async fn series(
        &self,
        matcher_sets: &[Vec<Matcher>],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Labels>, QueryError>;
}

/// A raw series as stored in a fixture file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSeries {
    pub metric: BTreeMap<String, String>,
    /// `[timestamp_ms, value]` pairs
    pub points: Vec<(i64, f64)>,
}

/// Leaf layer over raw samples held in memory.
///
/// Selectors take the last raw sample of each step bucket
/// `[ts - offset, next(ts) - offset)`; instant queries take the last sample
/// within the lookback window ending at the query end.
#[derive(Debug, Clone)]
pub struct InMemoryLeafNodes {
    series: Vec<Series>,
    lookback_delta: i64,
    page_size: Option<usize>,
}

impl InMemoryLeafNodes {
    pub fn new(lookback_delta_ms: i64) -> Self {
        Self {
            series: Vec::new(),
            lookback_delta: lookback_delta_ms,
            page_size: None,
        }
    }

    /// Returns at most `page_size` series unless the query needs all of them.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn add_series(&mut self, metric: Labels, mut points: Vec<Point>) {
        points.sort_by_key(|p| p.t);
        self.series.push(Series::new(metric, points));
    }

    pub fn with_series(mut self, metric: Labels, points: Vec<Point>) -> Self {
        self.add_series(metric, points);
        self
    }

    pub fn from_raw(lookback_delta_ms: i64, raw: Vec<RawSeries>) -> Self {
        let mut leaf = Self::new(lookback_delta_ms);
        for series in raw {
            let points = series
                .points
                .into_iter()
                .map(|(t, v)| Point::new(t, v))
                .collect();
            leaf.add_series(Labels::from_pairs(series.metric), points);
        }
        leaf
    }

    fn matching<'a>(&'a self, matchers: &'a [Matcher]) -> impl Iterator<Item = &'a Series> + 'a {
        self.series
            .iter()
            .filter(move |s| matchers.iter().all(|m| m.matches_labels(&s.metric)))
    }

    fn page(&self, matrix: Matrix, query: &Query) -> Value {
        match self.page_size {
            Some(size) if !query.if_need_all_series && matrix.len() > size => {
                let total_series = matrix.len();
                let mut matrix = matrix;
                matrix.truncate(size);
                Value::Page(PageMatrix {
                    matrix,
                    total_series,
                })
            }
            _ => Value::Matrix(matrix),
        }
    }

    /// Applies `reduce` to the raw points of every window ending at a step.
    fn eval_windows<F>(&self, selector: &MatrixSelector, query: &Query, reduce: F) -> Value
    where
        F: Fn(&[Point], i64) -> Option<f64>,
    {
        let vs = &selector.selector;
        let mut matrix = Matrix::new();
        for series in self.matching(&vs.matchers) {
            let points: Vec<Point> = window_ends(vs, query)
                .into_iter()
                .filter_map(|(step, end)| {
                    let window = range_points(&series.points, end - selector.range, end);
                    reduce(window, selector.range).map(|v| Point::new(step, v))
                })
                .collect();
            if !points.is_empty() {
                matrix.push(Series::new(series.metric.without_metric_name(), points));
            }
        }
        self.page(matrix, query)
    }
}

/// (step timestamp, inclusive window end) pairs of a query.
fn window_ends(vs: &VectorSelector, query: &Query) -> Vec<(i64, i64)> {
    if let Some(at) = vs.timestamp {
        return query
            .step_times()
            .into_iter()
            .map(|ts| (ts, at - vs.offset))
            .collect();
    }
    if query.is_instant_query {
        return vec![(query.fixed_start, query.end - vs.offset)];
    }
    query
        .step_times()
        .into_iter()
        .map(|ts| (ts, ts - vs.offset))
        .collect()
}

/// Points with `from < t <= to`.
fn range_points(points: &[Point], from: i64, to: i64) -> &[Point] {
    let lo = points.partition_point(|p| p.t <= from);
    let hi = points.partition_point(|p| p.t <= to);
    if lo >= hi { &[] } else { &points[lo..hi] }
}

/// Points with `from <= t < to`.
fn bucket_points(points: &[Point], from: i64, to: i64) -> &[Point] {
    let lo = points.partition_point(|p| p.t < from);
    let hi = points.partition_point(|p| p.t < to);
    if lo >= hi { &[] } else { &points[lo..hi] }
}

fn counter_increase(points: &[Point]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let increase = points.windows(2).fold(0.0, |acc, w| {
        if w[1].v < w[0].v {
            acc + w[1].v
        } else {
            acc + (w[1].v - w[0].v)
        }
    });
    Some(increase)
}

#[async_trait]
impl LeafNodes for InMemoryLeafNodes {
    async fn eval_vector_selector(
        &self,
        selector: &VectorSelector,
        query: &Query,
    ) -> Result<Value, QueryError> {
        let mut matrix = Matrix::new();
        for series in self.matching(&selector.matchers) {
            let points: Vec<Point> = if selector.timestamp.is_some() || query.is_instant_query {
                window_ends(selector, query)
                    .into_iter()
                    .filter_map(|(step, end)| {
                        range_points(&series.points, end - self.lookback_delta, end)
                            .last()
                            .map(|p| Point::new(step, p.v))
                    })
                    .collect()
            } else {
                query
                    .step_times()
                    .into_iter()
                    .filter_map(|ts| {
                        let from = ts - selector.offset;
                        let to = query.next_point_time(ts) - selector.offset;
                        bucket_points(&series.points, from, to)
                            .last()
                            .map(|p| Point::new(ts, p.v))
                    })
                    .collect()
            };
            if !points.is_empty() {
                matrix.push(Series::new(series.metric.clone(), points));
            }
        }
        Ok(self.page(matrix, query))
    }

    async fn rate_aggs(
        &self,
        selector: &MatrixSelector,
        query: &Query,
        func: RangeFunction,
    ) -> Result<Value, QueryError> {
        let per_second = func == RangeFunction::Rate;
        Ok(self.eval_windows(selector, query, |points, range| {
            counter_increase(points).map(|inc| {
                if per_second {
                    inc / (range as f64 / 1000.0)
                } else {
                    inc
                }
            })
        }))
    }

    async fn delta_aggs(
        &self,
        selector: &MatrixSelector,
        query: &Query,
    ) -> Result<Value, QueryError> {
        Ok(self.eval_windows(selector, query, |points, _| match points {
            [first, .., last] => Some(last.v - first.v),
            _ => None,
        }))
    }

    async fn changes_aggs(
        &self,
        selector: &MatrixSelector,
        query: &Query,
    ) -> Result<Value, QueryError> {
        Ok(self.eval_windows(selector, query, |points, _| {
            if points.is_empty() {
                return None;
            }
            let changes = points.windows(2).filter(|w| w[0].v != w[1].v).count();
            Some(changes as f64)
        }))
    }

    async fn irate_eval(
        &self,
        selector: &MatrixSelector,
        query: &Query,
    ) -> Result<Value, QueryError> {
        Ok(self.eval_windows(selector, query, |points, _| match points {
            [.., prev, last] => {
                let dt = (last.t - prev.t) as f64 / 1000.0;
                if dt <= 0.0 {
                    return None;
                }
                let delta = if last.v < prev.v {
                    last.v
                } else {
                    last.v - prev.v
                };
                Some(delta / dt)
            }
            _ => None,
        }))
    }

    async fn agg_over_time(
        &self,
        selector: &MatrixSelector,
        query: &Query,
        func: RangeFunction,
    ) -> Result<Value, QueryError> {
        Ok(self.eval_windows(selector, query, |points, _| {
            if points.is_empty() {
                return None;
            }
            let values = points.iter().map(|p| p.v);
            let v = match func {
                RangeFunction::SumOverTime => values.sum(),
                RangeFunction::AvgOverTime => values.sum::<f64>() / points.len() as f64,
                RangeFunction::MaxOverTime => values.fold(f64::NAN, |acc, v| {
                    if acc.is_nan() || v > acc { v } else { acc }
                }),
                RangeFunction::MinOverTime => values.fold(f64::NAN, |acc, v| {
                    if acc.is_nan() || v < acc { v } else { acc }
                }),
                _ => points.len() as f64,
            };
            Some(v)
        }))
    }

    async fn eval_vector_selector_fields(
        &self,
        selector: &VectorSelector,
        _query: &Query,
        field_name: &str,
    ) -> Result<BTreeSet<String>, QueryError> {
        let mut fields = BTreeSet::new();
        for series in self.matching(&selector.matchers) {
            if field_name.is_empty() {
                fields.extend(series.metric.names().map(str::to_string));
            } else if let Some(value) = series.metric.get(field_name) {
                fields.insert(value.to_string());
            }
        }
        Ok(fields)
    }

    async fn series(
        &self,
        matcher_sets: &[Vec<Matcher>],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<Labels>, QueryError> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for series in &self.series {
            let in_range = series.points.iter().any(|p| {
                start.is_none_or(|s| p.t >= s) && end.is_none_or(|e| p.t <= e)
            });
            if !in_range && (start.is_some() || end.is_some()) {
                continue;
            }
            let matched = matcher_sets
                .iter()
                .any(|set| set.iter().all(|m| m.matches_labels(&series.metric)));
            if matched && seen.insert(series.metric.clone()) {
                result.push(series.metric.clone());
            }
        }
        Ok(result)
    }
}
