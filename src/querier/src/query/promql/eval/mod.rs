//! Expression evaluation
//!
//! [`Evaluator`] walks the AST recursively. Every vector-producing node
//! evaluates its children to matrices once and then steps through them with
//! [`range::step_matrices`]; leaf selectors and range-vector functions are
//! answered by the [`LeafNodes`] layer, already bucketed per step.
//!
//! Nodes that combine series across label sets (aggregations, binary
//! operators, parens, `histogram_quantile`, `continuous_k_minute_downtime`)
//! evaluate their children with a [`Query::with_all_series`] copy so the leaf
//! layer never pages their input.

pub(crate) mod aggregate;
pub(crate) mod binop;
pub(crate) mod downtime;
pub(crate) mod functions;
pub(crate) mod introspect;
pub(crate) mod range;

pub use self::functions::{FunctionKind, FunctionRegistry, MathFunction};

use futures::future::BoxFuture;

use self::aggregate::{aggregation, grouping_key};
use self::binop::{scalar_binop, vector_and, vector_binop, vector_or, vector_scalar_binop, vector_unless};
use self::downtime::{DowntimeParams, FIRST_INPUT_ARG};
use self::functions::{PreparedCall, cumulative_sum, string_arg};
use self::range::{EvalSeriesHelper, SeriesPrep, step_matrices};
use super::ast::{AggregateExpr, BinaryExpr, BinaryOp, Call, Expr, ValueType};
use super::data_dict::DataDictionaries;
use super::labels::Labels;
use super::leaf::{LeafNodes, RangeFunction};
use super::metric_model::{MetricModelQuery, MetricModelService, uniform_to_matrix};
use super::query::Query;
use super::value::{
    DUPLICATE_LABELSET, Matrix, Point, Sample, Series, Value, Vector,
    matrix_has_duplicate_labelset,
};
use crate::query::error::QueryError;

const UNEXPECTED_SAMPLE_COUNT: &str = "unexpected number of samples";

/// Value of a scalar operand at the current step.
fn step_scalar(vals: &[Vector], index: usize) -> f64 {
    vals.get(index)
        .and_then(|v| v.first())
        .map_or(f64::NAN, |s| s.point.v)
}

fn unhandled(expr: &Expr) -> QueryError {
    QueryError::execution(format!("unhandled expression of type {}", expr.value_type()))
}

/// Evaluates expressions of one request against its collaborators.
pub(crate) struct Evaluator<'a> {
    pub leaf: &'a dyn LeafNodes,
    pub metric_models: &'a dyn MetricModelService,
    pub dictionaries: &'a dyn DataDictionaries,
    pub functions: &'a FunctionRegistry,
    /// Cap on the one-minute buckets a downtime window may span.
    pub max_query_points: i64,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn eval<'b>(
        &'b self,
        expr: &'b Expr,
        query: &'b Query,
    ) -> BoxFuture<'b, Result<Value, QueryError>> {
        Box::pin(async move {
            match expr {
                Expr::Aggregate(agg) => self.eval_aggregate(agg, query).await,
                Expr::Call(call) => self.eval_call(call, query).await,
                Expr::Paren(inner) => {
                    let query = query.with_all_series();
                    self.eval(inner, &query).await
                }
                Expr::Unary(inner) => {
                    let value = self.eval(inner, query).await?;
                    value.try_map(|mut matrix| {
                        for series in matrix.iter_mut() {
                            for point in series.points.iter_mut() {
                                point.v = -point.v;
                            }
                        }
                        if matrix_has_duplicate_labelset(&matrix) {
                            return Err(QueryError::execution(DUPLICATE_LABELSET));
                        }
                        Ok(matrix)
                    })
                }
                Expr::Binary(bin) => self.eval_binary(bin, query).await,
                Expr::NumberLiteral(v) => {
                    let v = *v;
                    let matrix = step_matrices(query, &[], None, |_, _, enh| {
                        let mut out = enh.take_out();
                        out.push(Sample::scalar(v));
                        Ok(out)
                    })?;
                    Ok(Value::Matrix(matrix))
                }
                Expr::VectorSelector(vs) => self.leaf.eval_vector_selector(vs, query).await,
                Expr::StepInvariant(inner) => self.eval_step_invariant(inner, query).await,
                Expr::StringLiteral(_) | Expr::MatrixSelector(_) => {
                    tracing::warn!(expr = %expr.value_type(), "unhandled expression");
                    Err(unhandled(expr))
                }
            }
        })
    }

    /// Evaluates every argument once. Missing and string arguments yield an
    /// empty matrix so the per-step vectors stay aligned with argument
    /// positions.
    async fn eval_args(
        &self,
        args: &[Option<&Expr>],
        query: &Query,
    ) -> Result<Vec<Matrix>, QueryError> {
        let mut matrices = Vec::with_capacity(args.len());
        for arg in args {
            let matrix = match arg {
                Some(expr) if expr.value_type() != ValueType::String => {
                    self.eval(expr, query).await?.into_matrix()
                }
                _ => Matrix::new(),
            };
            matrices.push(matrix);
        }
        Ok(matrices)
    }

    async fn eval_aggregate(&self, agg: &AggregateExpr, query: &Query) -> Result<Value, QueryError> {
        let query = query.with_all_series();
        let mut grouping = agg.grouping.clone();
        grouping.sort();
        let without = agg.without;
        let key_of = move |metric: &Labels| EvalSeriesHelper {
            grouping_key: grouping_key(metric, &grouping, without),
        };

        let param = agg.param.as_deref();
        let matrices = self.eval_args(&[param, Some(&*agg.expr)], &query).await?;
        let op = agg.op;
        let has_param = param.is_some();
        let prep: SeriesPrep<'_> = &key_of;
        let matrix = step_matrices(&query, &matrices, Some(prep), |vals, helpers, enh| {
            let param = has_param.then(|| step_scalar(vals, 0));
            aggregation(op, param, &vals[1], &helpers[1], enh)
        })?;
        Ok(Value::Matrix(matrix))
    }

    async fn eval_call(&self, call: &Call, query: &Query) -> Result<Value, QueryError> {
        let kind = self.functions.resolve(&call.func)?;
        if matches!(kind, FunctionKind::Sort { .. }) && !query.is_instant_query {
            return Err(QueryError::bad_data(format!(
                "'{}' can not be used in the query_range requests",
                call.func
            )));
        }

        if let Some(ms) = call.matrix_arg() {
            let FunctionKind::Range(func) = kind else {
                return Err(QueryError::execution(format!(
                    "{}() does not accept a range vector argument",
                    call.func
                )));
            };
            tracing::debug!(function = func.name(), "delegating range function to leaf nodes");
            return match func {
                RangeFunction::Rate | RangeFunction::Increase => {
                    self.leaf.rate_aggs(ms, query, func).await
                }
                RangeFunction::Irate => self.leaf.irate_eval(ms, query).await,
                RangeFunction::Delta => self.leaf.delta_aggs(ms, query).await,
                RangeFunction::Changes => self.leaf.changes_aggs(ms, query).await,
                RangeFunction::AvgOverTime
                | RangeFunction::SumOverTime
                | RangeFunction::MaxOverTime
                | RangeFunction::MinOverTime
                | RangeFunction::CountOverTime => self.leaf.agg_over_time(ms, query, func).await,
            };
        }

        match kind {
            FunctionKind::Range(_) => Err(QueryError::bad_data(format!(
                "expected range vector as argument of {}()",
                call.func
            ))),
            FunctionKind::CumulativeSum => {
                let arg = call.args.first().ok_or_else(|| {
                    QueryError::bad_data(format!("missing argument 1 of {}()", call.func))
                })?;
                let value = self.eval(arg, query).await?;
                value.try_map(|matrix| Ok(cumulative_sum(matrix, query)))
            }
            FunctionKind::KMinuteDowntime => {
                self.eval_downtime(call, &query.with_all_series()).await
            }
            FunctionKind::MetricModel => self.eval_metric_model(call, query).await,
            kind if kind.needs_all_series() => {
                self.eval_function(kind, call, &query.with_all_series()).await
            }
            kind => self.eval_function(kind, call, query).await,
        }
    }

    async fn eval_function(
        &self,
        kind: FunctionKind,
        call: &Call,
        query: &Query,
    ) -> Result<Value, QueryError> {
        let mut prepared = PreparedCall::prepare(kind, call, self.dictionaries)?;
        let args: Vec<Option<&Expr>> = call.args.iter().map(Some).collect();
        let matrices = self.eval_args(&args, query).await?;
        let matrix = step_matrices(query, &matrices, None, |vals, _, enh| {
            prepared.call(vals, enh)
        })?;
        Ok(Value::Matrix(matrix))
    }

    async fn eval_downtime(&self, call: &Call, query: &Query) -> Result<Value, QueryError> {
        let params = DowntimeParams::from_call(call)?;
        let window = downtime::plan(query, &params, self.max_query_points)?;
        tracing::debug!(
            k_minutes = params.k_minutes,
            start = window.inputs.fixed_start,
            end = window.inputs.fixed_end,
            "evaluating downtime inputs"
        );

        let mut inputs = Vec::with_capacity(call.args.len() - FIRST_INPUT_ARG);
        for arg in &call.args[FIRST_INPUT_ARG..] {
            if arg.value_type() == ValueType::String {
                continue;
            }
            let matrix = self.eval(arg, &window.inputs).await?.into_matrix();
            inputs.push(downtime::fill_missing_points(&window.inputs, matrix, &params));
        }
        let combined = downtime::combine_usability(inputs, &params);
        Ok(Value::Matrix(downtime::unavailable_minutes(
            combined,
            &window.outer,
            params.k_minutes,
        )))
    }

    async fn eval_metric_model(&self, call: &Call, query: &Query) -> Result<Value, QueryError> {
        let model_id = string_arg(call, 0)?;
        let request = MetricModelQuery::from_query(model_id, query);
        let response = self.metric_models.exec(&request).await.map_err(|err| {
            tracing::warn!(model_id, error = %err, "metric model evaluation failed");
            err
        })?;
        query.add_external_duration(response.external_duration_ms);
        Ok(Value::Matrix(uniform_to_matrix(response)))
    }

    async fn eval_binary(&self, bin: &BinaryExpr, query: &Query) -> Result<Value, QueryError> {
        let query = query.with_all_series();
        let lhs_scalar = bin.lhs.value_type() == ValueType::Scalar;
        let rhs_scalar = bin.rhs.value_type() == ValueType::Scalar;
        let matrices = self
            .eval_args(&[Some(&*bin.lhs), Some(&*bin.rhs)], &query)
            .await?;

        let (op, return_bool, matching) = (bin.op, bin.return_bool, &bin.matching);
        let matrix = match (lhs_scalar, rhs_scalar) {
            (true, true) => step_matrices(&query, &matrices, None, |vals, _, enh| {
                let v = scalar_binop(op, step_scalar(vals, 0), step_scalar(vals, 1))?;
                let mut out = enh.take_out();
                out.push(Sample::scalar(v));
                Ok(out)
            }),
            (true, false) => step_matrices(&query, &matrices, None, |vals, _, enh| {
                vector_scalar_binop(op, &vals[1], step_scalar(vals, 0), true, return_bool, enh)
            }),
            (false, true) => step_matrices(&query, &matrices, None, |vals, _, enh| {
                vector_scalar_binop(op, &vals[0], step_scalar(vals, 1), false, return_bool, enh)
            }),
            (false, false) => step_matrices(&query, &matrices, None, |vals, _, enh| match op {
                BinaryOp::And => Ok(vector_and(&vals[0], &vals[1], matching, enh)),
                BinaryOp::Or => Ok(vector_or(&vals[0], &vals[1], matching, enh)),
                BinaryOp::Unless => Ok(vector_unless(&vals[0], &vals[1], matching, enh)),
                _ => vector_binop(op, &vals[0], &vals[1], matching, return_bool, enh),
            }),
        }?;
        Ok(Value::Matrix(matrix))
    }

    /// Evaluates `inner` at FixedStart only and repeats the result at every
    /// later step.
    async fn eval_step_invariant(&self, inner: &Expr, query: &Query) -> Result<Value, QueryError> {
        if matches!(inner, Expr::NumberLiteral(_) | Expr::StringLiteral(_)) {
            return self.eval(inner, query).await;
        }

        let mut once = query.clone();
        once.fixed_end = once.fixed_start;
        let value = self.eval(inner, &once).await?;

        let later_steps: Vec<i64> = query.step_times().into_iter().skip(1).collect();
        value.try_map(|matrix| {
            matrix
                .into_iter()
                .map(|series| {
                    let [first] = series.points.as_slice() else {
                        return Err(QueryError::execution(UNEXPECTED_SAMPLE_COUNT));
                    };
                    let first = *first;
                    let mut points = Vec::with_capacity(later_steps.len() + 1);
                    points.push(first);
                    points.extend(later_steps.iter().map(|&t| Point::new(t, first.v)));
                    Ok(Series::new(series.metric, points))
                })
                .collect()
        })
    }
}
