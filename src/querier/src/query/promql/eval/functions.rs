//! Function registry and per-step function implementations
//!
//! Functions are looked up by name in a [`FunctionRegistry`] built once per
//! service. Range-vector functions and the timeline functions
//! (`cumulative_sum`, `continuous_k_minute_downtime`, `metric_model`) are
//! dispatched by the evaluator itself; everything else is turned into a
//! [`PreparedCall`] that validates its literal arguments up front and is then
//! invoked once per step.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;

use super::aggregate::{cmp_asc, cmp_desc};
use super::binop::{DUPLICATE_MATCH_GROUP, IMPLICIT_MANY_TO_ONE, signature};
use super::range::EvalNodeHelper;
use crate::query::error::QueryError;
use crate::query::promql::ast::{Call, Expr};
use crate::query::promql::data_dict::{DataDict, DataDictionaries};
use crate::query::promql::labels::{BUCKET_LABEL, Labels, is_valid_label_name};
use crate::query::promql::leaf::RangeFunction;
use crate::query::promql::query::Query;
use crate::query::promql::value::{Matrix, Point, Sample, Series, Vector};

const MAX_PERCENT_RANK_PRECISION: i64 = 16;
const SHADOWED_LABEL_PREFIX: &str = "__m.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunction {
    Abs,
    Ceil,
    Exp,
    Floor,
    Sqrt,
    Ln,
    Log2,
    Log10,
}

impl MathFunction {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            MathFunction::Abs => v.abs(),
            MathFunction::Ceil => v.ceil(),
            MathFunction::Exp => v.exp(),
            MathFunction::Floor => v.floor(),
            MathFunction::Sqrt => v.sqrt(),
            MathFunction::Ln => v.ln(),
            MathFunction::Log2 => v.log2(),
            MathFunction::Log10 => v.log10(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Math(MathFunction),
    Time,
    Sort { descending: bool },
    LabelReplace,
    LabelJoin,
    HistogramQuantile,
    PercentRank,
    Rank,
    DictLabels,
    DictValues,
    Greatest,
    Least,
    Clamp,
    ClampMax,
    ClampMin,
    /// Evaluated by the leaf layer over a range-vector argument.
    Range(RangeFunction),
    CumulativeSum,
    KMinuteDowntime,
    MetricModel,
}

impl FunctionKind {
    /// Whether the arguments must be loaded without backend paging.
    pub fn needs_all_series(&self) -> bool {
        matches!(self, FunctionKind::HistogramQuantile | FunctionKind::KMinuteDowntime)
    }
}

/// Name to implementation lookup shared by every query of a service.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionKind>,
}

impl FunctionRegistry {
    /// A registry without any function.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, kind: FunctionKind) {
        self.functions.insert(name.into(), kind);
    }

    pub fn get(&self, name: &str) -> Option<FunctionKind> {
        self.functions.get(name).copied()
    }

    /// Looks up `name`, failing with the error reported for unknown functions.
    pub fn resolve(&self, name: &str) -> Result<FunctionKind, QueryError> {
        self.get(name).ok_or_else(|| {
            tracing::warn!(function = name, "unsupported function");
            QueryError::bad_data(format!("'{name}' is not currently supported"))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        use FunctionKind::*;

        let mut registry = Self::empty();
        for (name, func) in [
            ("abs", MathFunction::Abs),
            ("ceil", MathFunction::Ceil),
            ("exp", MathFunction::Exp),
            ("floor", MathFunction::Floor),
            ("sqrt", MathFunction::Sqrt),
            ("ln", MathFunction::Ln),
            ("log2", MathFunction::Log2),
            ("log10", MathFunction::Log10),
        ] {
            registry.register(name, Math(func));
        }
        for func in [
            RangeFunction::Rate,
            RangeFunction::Increase,
            RangeFunction::Irate,
            RangeFunction::Delta,
            RangeFunction::Changes,
            RangeFunction::AvgOverTime,
            RangeFunction::SumOverTime,
            RangeFunction::MaxOverTime,
            RangeFunction::MinOverTime,
            RangeFunction::CountOverTime,
        ] {
            registry.register(func.name(), Range(func));
        }
        registry.register("time", Time);
        registry.register("sort", Sort { descending: false });
        registry.register("sort_desc", Sort { descending: true });
        registry.register("label_replace", LabelReplace);
        registry.register("label_join", LabelJoin);
        registry.register("histogram_quantile", HistogramQuantile);
        registry.register("percent_rank", PercentRank);
        registry.register("rank", Rank);
        registry.register("dict_labels", DictLabels);
        registry.register("dict_values", DictValues);
        registry.register("greatest", Greatest);
        registry.register("least", Least);
        registry.register("clamp", Clamp);
        registry.register("clamp_max", ClampMax);
        registry.register("clamp_min", ClampMin);
        registry.register("cumulative_sum", CumulativeSum);
        registry.register("continuous_k_minute_downtime", KMinuteDowntime);
        registry.register("metric_model", MetricModel);
        registry
    }
}

/// Looks through parens and step-invariant wrappers.
fn literal(expr: &Expr) -> &Expr {
    let inner = expr.unwrap_paren();
    match inner {
        Expr::StepInvariant(wrapped) => wrapped.unwrap_paren(),
        other => other,
    }
}

fn missing_argument(call: &Call, index: usize) -> QueryError {
    QueryError::bad_data(format!(
        "missing argument {} of {}()",
        index + 1,
        call.func
    ))
}

pub(crate) fn string_arg(call: &Call, index: usize) -> Result<&str, QueryError> {
    match call.args.get(index).map(literal) {
        Some(Expr::StringLiteral(s)) => Ok(s),
        Some(other) => Err(QueryError::bad_data(format!(
            "expected string literal as argument {} of {}(), got {}",
            index + 1,
            call.func,
            other.value_type()
        ))),
        None => Err(missing_argument(call, index)),
    }
}

pub(crate) fn number_arg(call: &Call, index: usize) -> Result<f64, QueryError> {
    let arg = call.args.get(index).map(literal);
    match arg {
        Some(Expr::NumberLiteral(v)) => Ok(*v),
        Some(Expr::Unary(inner)) => match literal(inner) {
            Expr::NumberLiteral(v) => Ok(-v),
            other => Err(not_a_number(call, index, other)),
        },
        Some(other) => Err(not_a_number(call, index, other)),
        None => Err(missing_argument(call, index)),
    }
}

fn not_a_number(call: &Call, index: usize, arg: &Expr) -> QueryError {
    QueryError::bad_data(format!(
        "expected number literal as argument {} of {}(), got {}",
        index + 1,
        call.func,
        arg.value_type()
    ))
}

fn vector_arg(vals: &[Vector], index: usize) -> &[Sample] {
    vals.get(index).map(Vec::as_slice).unwrap_or(&[])
}

/// Value of a scalar argument at the current step.
fn scalar_arg(vals: &[Vector], index: usize) -> f64 {
    vector_arg(vals, index)
        .first()
        .map_or(f64::NAN, |s| s.point.v)
}

/// NaN orders below every number.
fn cmp_nan_low(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn truncate_float(num: f64, decimal_places: i32) -> f64 {
    let multiplier = 10f64.powi(decimal_places);
    (num * multiplier).trunc() / multiplier
}

#[derive(Debug)]
pub(crate) struct DictLabelsPlan {
    dict: Arc<DataDict>,
    /// dictionary key column -> vector label
    match_params: BTreeMap<String, String>,
    /// (vector label, dictionary value column), sorted by vector label
    expand: Vec<(String, String)>,
}

/// A function call whose literal arguments have been validated.
#[derive(Debug)]
pub(crate) enum PreparedCall {
    Math(MathFunction),
    Time,
    Sort {
        descending: bool,
    },
    LabelReplace {
        dst: String,
        replacement: String,
        src: String,
        regex: Regex,
        cache: HashMap<Labels, Labels>,
    },
    LabelJoin {
        dst: String,
        separator: String,
        sources: Vec<String>,
        cache: HashMap<Labels, Labels>,
    },
    HistogramQuantile,
    PercentRank {
        precision: i32,
    },
    Rank {
        descending: bool,
    },
    DictLabels(DictLabelsPlan),
    DictValues(Vector),
    Greatest,
    Least,
    Clamp,
    ClampMax,
    ClampMin,
}

impl PreparedCall {
    pub(crate) fn prepare(
        kind: FunctionKind,
        call: &Call,
        dicts: &dyn DataDictionaries,
    ) -> Result<Self, QueryError> {
        let prepared = match kind {
            FunctionKind::Math(func) => PreparedCall::Math(func),
            FunctionKind::Time => PreparedCall::Time,
            FunctionKind::Sort { descending } => PreparedCall::Sort { descending },
            FunctionKind::LabelReplace => {
                let dst = string_arg(call, 1)?;
                let replacement = string_arg(call, 2)?;
                let src = string_arg(call, 3)?;
                let pattern = string_arg(call, 4)?;
                let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|_| {
                    QueryError::invalid_argument(format!(
                        "invalid regular expression in label_replace(): {pattern}"
                    ))
                })?;
                if !is_valid_label_name(dst) {
                    return Err(QueryError::invalid_argument(format!(
                        "invalid destination label name in label_replace(): {dst}"
                    )));
                }
                PreparedCall::LabelReplace {
                    dst: dst.to_string(),
                    replacement: replacement.to_string(),
                    src: src.to_string(),
                    regex,
                    cache: HashMap::new(),
                }
            }
            FunctionKind::LabelJoin => {
                let dst = string_arg(call, 1)?;
                let separator = string_arg(call, 2)?;
                let mut sources = Vec::with_capacity(call.args.len().saturating_sub(3));
                for i in 3..call.args.len() {
                    let src = string_arg(call, i)?;
                    if !is_valid_label_name(src) {
                        return Err(QueryError::invalid_argument(format!(
                            "invalid source label name in label_join(): {src}"
                        )));
                    }
                    sources.push(src.to_string());
                }
                if !is_valid_label_name(dst) {
                    return Err(QueryError::invalid_argument(format!(
                        "invalid destination label name in label_join(): {dst}"
                    )));
                }
                PreparedCall::LabelJoin {
                    dst: dst.to_string(),
                    separator: separator.to_string(),
                    sources,
                    cache: HashMap::new(),
                }
            }
            FunctionKind::HistogramQuantile => PreparedCall::HistogramQuantile,
            FunctionKind::PercentRank => {
                let precision = number_arg(call, 1)? as i64;
                if precision < 1 {
                    return Err(QueryError::invalid_argument(format!(
                        "invalid precision in percent_rank(): {precision}"
                    )));
                }
                PreparedCall::PercentRank {
                    precision: precision.min(MAX_PERCENT_RANK_PRECISION) as i32,
                }
            }
            FunctionKind::Rank => PreparedCall::Rank {
                descending: number_arg(call, 1)? == 0.0,
            },
            FunctionKind::DictLabels => PreparedCall::DictLabels(prepare_dict_labels(call, dicts)?),
            FunctionKind::DictValues => PreparedCall::DictValues(prepare_dict_values(call, dicts)?),
            FunctionKind::Greatest => PreparedCall::Greatest,
            FunctionKind::Least => PreparedCall::Least,
            FunctionKind::Clamp => PreparedCall::Clamp,
            FunctionKind::ClampMax => PreparedCall::ClampMax,
            FunctionKind::ClampMin => PreparedCall::ClampMin,
            FunctionKind::Range(_)
            | FunctionKind::CumulativeSum
            | FunctionKind::KMinuteDowntime
            | FunctionKind::MetricModel => {
                return Err(QueryError::execution(format!(
                    "{}() cannot be evaluated step by step",
                    call.func
                )));
            }
        };
        Ok(prepared)
    }

    /// Evaluates one step. `vals[i]` holds the samples of argument `i`; string
    /// arguments contribute empty vectors.
    pub(crate) fn call(
        &mut self,
        vals: &[Vector],
        enh: &mut EvalNodeHelper,
    ) -> Result<Vector, QueryError> {
        let mut out = enh.take_out();
        match self {
            PreparedCall::Math(func) => {
                out.extend(vector_arg(vals, 0).iter().map(|el| Sample {
                    metric: el.metric.clone(),
                    point: el.point.with_value(func.apply(el.point.v)),
                }));
            }
            PreparedCall::Time => out.push(Sample::scalar(enh.ts as f64 / 1000.0)),
            PreparedCall::Sort { descending } => {
                out.extend(vector_arg(vals, 0).iter().cloned());
                let cmp = if *descending { cmp_desc } else { cmp_asc };
                out.sort_by(|a, b| cmp(a.point.v, b.point.v));
            }
            PreparedCall::LabelReplace {
                dst,
                replacement,
                src,
                regex,
                cache,
            } => {
                for el in vector_arg(vals, 0) {
                    let metric = cache
                        .entry(el.metric.clone())
                        .or_insert_with(|| label_replace(&el.metric, dst, replacement, src, regex))
                        .clone();
                    out.push(Sample {
                        metric,
                        point: el.point,
                    });
                }
            }
            PreparedCall::LabelJoin {
                dst,
                separator,
                sources,
                cache,
            } => {
                for el in vector_arg(vals, 0) {
                    let metric = cache
                        .entry(el.metric.clone())
                        .or_insert_with(|| {
                            let joined = sources
                                .iter()
                                .map(|s| el.metric.get(s).unwrap_or(""))
                                .collect::<Vec<_>>()
                                .join(separator.as_str());
                            let mut metric = el.metric.clone();
                            metric.set(dst, &joined);
                            metric
                        })
                        .clone();
                    out.push(Sample {
                        metric,
                        point: el.point,
                    });
                }
            }
            PreparedCall::HistogramQuantile => {
                histogram_quantile(scalar_arg(vals, 0), vector_arg(vals, 1), &mut out);
            }
            PreparedCall::PercentRank { precision } => {
                percent_rank(vector_arg(vals, 0), *precision, &mut out);
            }
            PreparedCall::Rank { descending } => rank(vector_arg(vals, 0), *descending, &mut out),
            PreparedCall::DictLabels(plan) => dict_labels(plan, vector_arg(vals, 0), &mut out),
            PreparedCall::DictValues(samples) => out.extend(samples.iter().cloned()),
            PreparedCall::Greatest => greatest_or_least(vals, true, &mut out)?,
            PreparedCall::Least => greatest_or_least(vals, false, &mut out)?,
            PreparedCall::Clamp => {
                let (min, max) = (scalar_arg(vals, 1), scalar_arg(vals, 2));
                if min.is_nan() || max.is_nan() {
                    out.extend(nan_values(vector_arg(vals, 0)));
                } else if min <= max {
                    out.extend(map_values(vector_arg(vals, 0), |v| v.max(min).min(max)));
                }
            }
            PreparedCall::ClampMax => {
                let max = scalar_arg(vals, 1);
                if max.is_nan() {
                    out.extend(nan_values(vector_arg(vals, 0)));
                } else {
                    out.extend(map_values(vector_arg(vals, 0), |v| v.min(max)));
                }
            }
            PreparedCall::ClampMin => {
                let min = scalar_arg(vals, 1);
                if min.is_nan() {
                    out.extend(nan_values(vector_arg(vals, 0)));
                } else {
                    out.extend(map_values(vector_arg(vals, 0), |v| v.max(min)));
                }
            }
        }
        Ok(out)
    }
}

fn nan_values(vector: &[Sample]) -> impl Iterator<Item = Sample> + '_ {
    vector.iter().map(|el| Sample {
        metric: el.metric.clone(),
        point: el.point.with_value(f64::NAN),
    })
}

/// Applies `f` to every non-NaN value.
fn map_values<'a, F>(vector: &'a [Sample], f: F) -> impl Iterator<Item = Sample> + 'a
where
    F: Fn(f64) -> f64 + 'a,
{
    vector.iter().map(move |el| {
        let v = if el.point.v.is_nan() {
            el.point.v
        } else {
            f(el.point.v)
        };
        Sample {
            metric: el.metric.clone(),
            point: el.point.with_value(v),
        }
    })
}

fn label_replace(metric: &Labels, dst: &str, replacement: &str, src: &str, regex: &Regex) -> Labels {
    let source = metric.get(src).unwrap_or("");
    let Some(captures) = regex.captures(source) else {
        return metric.clone();
    };
    let mut expanded = String::new();
    captures.expand(replacement, &mut expanded);
    let mut out = metric.clone();
    out.set(dst, &expanded);
    out
}

fn histogram_quantile(q: f64, input: &[Sample], out: &mut Vector) {
    let mut index: HashMap<Labels, usize> = HashMap::new();
    let mut groups: Vec<(Labels, Vec<(f64, f64)>)> = Vec::new();
    for el in input {
        let Some(upper) = el
            .metric
            .get(BUCKET_LABEL)
            .and_then(|le| le.parse::<f64>().ok())
        else {
            continue;
        };
        let key = el.metric.without(&[BUCKET_LABEL]).without_metric_name();
        let pos = *index.entry(key.clone()).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[pos].1.push((upper, el.point.v));
    }
    for (metric, buckets) in groups {
        out.push(Sample::new(metric, 0, bucket_quantile(q, buckets)));
    }
}

/// Quantile `q` of a cumulative histogram given as (upper bound, count) pairs.
fn bucket_quantile(q: f64, mut buckets: Vec<(f64, f64)>) -> f64 {
    if q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
    if buckets.last().is_none_or(|b| b.0 != f64::INFINITY) {
        return f64::NAN;
    }

    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(buckets.len());
    for (upper, count) in buckets {
        match merged.last_mut() {
            Some(last) if last.0 == upper => last.1 += count,
            _ => merged.push((upper, count)),
        }
    }
    let mut running_max = f64::NEG_INFINITY;
    for bucket in merged.iter_mut() {
        if bucket.1 < running_max {
            bucket.1 = running_max;
        } else {
            running_max = bucket.1;
        }
    }

    let n = merged.len();
    if n < 2 {
        return f64::NAN;
    }
    let observations = merged[n - 1].1;
    if observations == 0.0 {
        return f64::NAN;
    }
    let mut rank = q * observations;
    let b = merged.partition_point(|bucket| bucket.1 < rank);
    if b >= n - 1 {
        return merged[n - 2].0;
    }
    if b == 0 && merged[0].0 <= 0.0 {
        return merged[0].0;
    }
    let mut start = 0.0;
    let end = merged[b].0;
    let mut count = merged[b].1;
    if b > 0 {
        start = merged[b - 1].0;
        count -= merged[b - 1].1;
        rank -= merged[b - 1].1;
    }
    start + (end - start) * (rank / count)
}

fn percent_rank(vector: &[Sample], precision: i32, out: &mut Vector) {
    let n = vector.len();
    let mut sorted: Vec<f64> = vector.iter().map(|s| s.point.v).collect();
    sorted.sort_by(|a, b| cmp_nan_low(*a, *b));
    for el in vector {
        let v = el.point.v;
        let ranked = if !v.is_finite() {
            v
        } else if n == 1 {
            truncate_float(100.0, precision)
        } else {
            let below = sorted.partition_point(|x| cmp_nan_low(*x, v) == Ordering::Less);
            truncate_float(below as f64 / (n - 1) as f64 * 100.0, precision - 2)
        };
        out.push(Sample {
            metric: el.metric.clone(),
            point: el.point.with_value(ranked),
        });
    }
}

fn rank(vector: &[Sample], descending: bool, out: &mut Vector) {
    let order = |a: f64, b: f64| {
        if descending {
            cmp_nan_low(b, a)
        } else {
            cmp_nan_low(a, b)
        }
    };
    let mut sorted: Vec<f64> = vector.iter().map(|s| s.point.v).collect();
    sorted.sort_by(|a, b| order(*a, *b));
    for el in vector {
        let v = el.point.v;
        let ranked = if v.is_finite() {
            (sorted.partition_point(|x| order(*x, v) == Ordering::Less) + 1) as f64
        } else {
            v
        };
        out.push(Sample {
            metric: el.metric.clone(),
            point: el.point.with_value(ranked),
        });
    }
}

fn dict_label_pairs(call: &Call, first: usize) -> Result<Vec<(&str, &str)>, QueryError> {
    if (call.args.len().saturating_sub(first)) % 2 != 0 {
        return Err(QueryError::bad_data(format!(
            "{}() expects dictionary label and vector label pairs",
            call.func
        )));
    }
    (first..call.args.len())
        .step_by(2)
        .map(|i| Ok((string_arg(call, i)?, string_arg(call, i + 1)?)))
        .collect()
}

fn lookup_dict(
    dicts: &dyn DataDictionaries,
    call: &Call,
    index: usize,
) -> Result<Arc<DataDict>, QueryError> {
    let name = string_arg(call, index)?;
    dicts
        .dict_by_name(name)
        .ok_or_else(|| QueryError::invalid_argument(format!("failed find dict: {name}")))
}

fn prepare_dict_labels(
    call: &Call,
    dicts: &dyn DataDictionaries,
) -> Result<DictLabelsPlan, QueryError> {
    let dict = lookup_dict(dicts, call, 1)?;
    let mut match_params = BTreeMap::new();
    let mut expand = Vec::new();
    for (dict_label, vector_label) in dict_label_pairs(call, 2)? {
        if dict.keys.iter().any(|k| k == dict_label) {
            match_params.insert(dict_label.to_string(), vector_label.to_string());
        } else if dict.values.iter().any(|v| v == dict_label) {
            if !is_valid_label_name(vector_label) {
                return Err(QueryError::invalid_argument(format!(
                    "vector_label: {vector_label} is invalid"
                )));
            }
            expand.push((vector_label.to_string(), dict_label.to_string()));
        } else {
            return Err(QueryError::invalid_argument(format!(
                "invalid parameter in dict_labels(), dict label {dict_label} does not exist"
            )));
        }
    }
    if match_params.len() != dict.keys.len() {
        return Err(QueryError::invalid_argument(
            "dict_labels() requires all the keys of the dictionary",
        ));
    }
    expand.sort();
    Ok(DictLabelsPlan {
        dict,
        match_params,
        expand,
    })
}

fn dict_labels(plan: &DictLabelsPlan, vector: &[Sample], out: &mut Vector) {
    if plan.dict.records.is_empty() {
        out.extend(vector.iter().cloned());
        return;
    }
    for el in vector {
        let key_values: Option<Vec<&str>> = plan
            .dict
            .keys
            .iter()
            .map(|key| {
                plan.match_params
                    .get(key)
                    .and_then(|vector_label| el.metric.get(vector_label))
            })
            .collect();
        let records = match key_values {
            Some(key_values) => plan.dict.records_by_key(&key_values),
            None => Vec::new(),
        };
        if records.is_empty() {
            out.push(el.clone());
            continue;
        }
        for record in records {
            let mut metric = el.metric.clone();
            for (vector_label, dict_label) in &plan.expand {
                let value = record.get(dict_label).map(String::as_str).unwrap_or("");
                if el.metric.contains(vector_label) {
                    metric.set(&format!("{SHADOWED_LABEL_PREFIX}{vector_label}"), value);
                } else {
                    metric.set(vector_label, value);
                }
            }
            out.push(Sample {
                metric,
                point: el.point,
            });
        }
    }
}

/// Builds the samples of `dict_values(dict, measure_field, ...)`. They do not
/// depend on the step, so they are computed once.
fn prepare_dict_values(call: &Call, dicts: &dyn DataDictionaries) -> Result<Vector, QueryError> {
    let dict = lookup_dict(dicts, call, 0)?;
    if !dict.unique_key {
        return Err(QueryError::invalid_argument(format!(
            "dictionary {} must have a unique key",
            dict.name
        )));
    }
    let measure_field = string_arg(call, 1)?;
    if !dict.values.iter().any(|v| v == measure_field) {
        return Err(QueryError::invalid_argument(format!(
            "invalid parameter measure_field: {measure_field} in dict_values()"
        )));
    }

    // dictionary column -> vector label
    let mut join: HashMap<&str, &str> = HashMap::new();
    let mut joined_keys = HashSet::new();
    for (dict_label, vector_label) in dict_label_pairs(call, 2)? {
        if !is_valid_label_name(vector_label) {
            return Err(QueryError::invalid_argument(format!(
                "vector_label: {vector_label} is invalid"
            )));
        }
        if dict.keys.iter().any(|k| k == dict_label) {
            joined_keys.insert(dict_label);
        } else if !dict.values.iter().any(|v| v == dict_label) {
            return Err(QueryError::invalid_argument(format!(
                "invalid parameter in dict_values(), dict key {dict_label} does not exist"
            )));
        }
        join.insert(dict_label, vector_label);
    }
    for key in &dict.keys {
        if joined_keys.contains(key.as_str()) {
            continue;
        }
        if !is_valid_label_name(key) {
            return Err(QueryError::invalid_argument(format!(
                "dictionary key {key} is not a valid label name and must be mapped in dict_values()"
            )));
        }
        join.insert(key, key);
    }

    let mut columns: Vec<&str> = dict
        .keys
        .iter()
        .chain(dict.values.iter())
        .map(String::as_str)
        .collect();
    columns.sort_unstable();

    let mut samples = Vector::with_capacity(dict.records.len());
    for record in &dict.records {
        let raw = record.get(measure_field).map(String::as_str).unwrap_or("");
        if raw.is_empty() {
            return Err(QueryError::invalid_argument(
                "cannot convert an empty string into a metric value",
            ));
        }
        let value: f64 = raw.parse().map_err(|e| {
            QueryError::invalid_argument(format!("conversion metric failed: {e}"))
        })?;
        let metric: Labels = columns
            .iter()
            .filter_map(|column| {
                join.get(column).map(|vector_label| {
                    (
                        vector_label.to_string(),
                        record.get(*column).cloned().unwrap_or_default(),
                    )
                })
            })
            .collect();
        samples.push(Sample::new(metric, 0, value));
    }
    Ok(samples)
}

/// Element-wise max/min across vectors matched on their full label set.
fn greatest_or_least(vals: &[Vector], greatest: bool, out: &mut Vector) -> Result<(), QueryError> {
    let Some((first, rest)) = vals.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        out.extend(first.iter().cloned());
        return Ok(());
    }

    let mut seen = HashSet::with_capacity(first.len());
    let mut firsts = Vec::with_capacity(first.len());
    for sample in first {
        let sig = signature(&sample.metric, false, &[]);
        if !seen.insert(sig.clone()) {
            return Err(QueryError::execution(DUPLICATE_MATCH_GROUP));
        }
        firsts.push((sig, sample));
    }
    let mut others: Vec<HashMap<Labels, f64>> = Vec::with_capacity(rest.len());
    for vector in rest {
        let mut by_sig = HashMap::with_capacity(vector.len());
        for sample in vector {
            let sig = signature(&sample.metric, false, &[]);
            if by_sig.insert(sig, sample.point.v).is_some() {
                return Err(QueryError::execution(IMPLICIT_MANY_TO_ONE));
            }
        }
        others.push(by_sig);
    }

    'series: for (sig, sample) in firsts {
        let mut value = sample.point.v;
        for other in &others {
            let Some(&v) = other.get(&sig) else {
                continue 'series;
            };
            value = if value.is_nan() || v.is_nan() {
                f64::NAN
            } else if greatest {
                value.max(v)
            } else {
                value.min(v)
            };
        }
        out.push(Sample {
            metric: sig,
            point: sample.point.with_value(value),
        });
    }
    Ok(())
}

/// Running total of every series along FixedStart..=FixedEnd. Missing buckets
/// repeat the previous total; a point earlier than the walk cursor pulls the
/// cursor back to its own timestamp.
pub(crate) fn cumulative_sum(matrix: Matrix, query: &Query) -> Matrix {
    matrix
        .into_iter()
        .filter(|series| !series.points.is_empty())
        .map(|series| {
            let mut points = Vec::with_capacity(series.points.len());
            let mut total = 0.0;
            let mut idx = 0;
            let mut ts = query.fixed_start;
            while ts <= query.fixed_end {
                let at = match series.points.get(idx) {
                    Some(p) if ts >= p.t => {
                        total += p.v;
                        idx += 1;
                        p.t
                    }
                    _ => ts,
                };
                points.push(Point::new(at, total));
                let next = query.next_point_time(at);
                if next <= at {
                    break;
                }
                ts = next;
            }
            Series::new(series.metric, points)
        })
        .collect()
}
