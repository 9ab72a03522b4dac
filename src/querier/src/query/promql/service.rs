//! Public entry points of the engine
//!
//! [`PromqlService`] owns the collaborators (parser, leaf layer, metric-model
//! service, data dictionaries) and the function registry, and exposes query
//! execution, the series endpoint and the introspection walks. Each entry
//! point runs its walk behind a fault boundary that turns a panic into a
//! bad-data error.

use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono_tz::Tz;
use common::config::PromqlConfig;
use futures::FutureExt;
use http::StatusCode;

use super::ast::{Expr, ValueType, preprocess};
use super::data_dict::{DataDictionaries, InMemoryDataDictionaries};
use super::eval::introspect::Introspector;
use super::eval::{Evaluator, FunctionRegistry};
use super::leaf::LeafNodes;
use super::metric_model::{MetricModelService, UnconfiguredMetricModels};
use super::parser::{PromqlParser, QueryParser};
use super::query::{DEFAULT_MAX_QUERY_POINTS, Query};
use super::response::{QueryData, QueryResponse, SamplePair, SeriesResponse};
use super::value::{Point, Sample, Series};
use crate::query::error::QueryError;

/// Engine-wide settings, normally read from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    /// Zone used for bucket alignment of every query.
    pub timezone: Tz,
    pub max_query_points: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            max_query_points: DEFAULT_MAX_QUERY_POINTS,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &PromqlConfig) -> Result<Self, chrono_tz::ParseError> {
        Ok(Self {
            timezone: config.tz()?,
            max_query_points: config.max_query_points,
        })
    }
}

/// Outcome of [`PromqlService::exec`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResponse {
    pub status: StatusCode,
    pub response: QueryResponse,
    /// Serialised response; `None` for metric-model requests.
    pub body: Option<Vec<u8>>,
}

/// Parameters of the series endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesRequest {
    /// `match[]` selectors
    pub matchers: Vec<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

pub struct PromqlService {
    parser: Arc<dyn QueryParser>,
    leaf: Arc<dyn LeafNodes>,
    metric_models: Arc<dyn MetricModelService>,
    dictionaries: Arc<dyn DataDictionaries>,
    functions: Arc<FunctionRegistry>,
    settings: EngineSettings,
}

impl PromqlService {
    pub fn new(leaf: Arc<dyn LeafNodes>) -> Self {
        Self {
            parser: Arc::new(PromqlParser),
            leaf,
            metric_models: Arc::new(UnconfiguredMetricModels),
            dictionaries: Arc::new(InMemoryDataDictionaries::new()),
            functions: Arc::new(FunctionRegistry::default()),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn QueryParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_metric_models(mut self, metric_models: Arc<dyn MetricModelService>) -> Self {
        self.metric_models = metric_models;
        self
    }

    pub fn with_dictionaries(mut self, dictionaries: Arc<dyn DataDictionaries>) -> Self {
        self.dictionaries = dictionaries;
        self
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Parses and evaluates `query.query_str`.
    pub async fn exec(&self, query: Query) -> Result<ExecResponse, QueryError> {
        let expr = self.parse(&query.query_str)?;
        self.exec_expr(expr, query).await
    }

    /// Evaluates an already-parsed expression.
    pub async fn exec_expr(&self, expr: Expr, mut query: Query) -> Result<ExecResponse, QueryError> {
        check_result_type(&expr, StatusCode::UNPROCESSABLE_ENTITY)?;

        query.timezone = self.settings.timezone;
        let expr = preprocess(expr, query.start, query.end);
        let (fixed_start, fixed_end) = query.correct_time()?;
        query.fixed_start = fixed_start;
        query.fixed_end = fixed_end;

        tracing::info!(
            query = %query.query_str,
            start = query.start,
            end = query.end,
            fixed_start,
            fixed_end,
            interval = query.interval,
            instant = query.is_instant_query,
            metric_model = query.is_metric_model,
            "evaluating query"
        );

        let evaluator = self.evaluator();
        let value = guarded(evaluator.eval(&expr, &query)).await?;
        let series_total = value.total_series();
        let matrix = value.into_matrix();

        let data = if query.is_instant() {
            match expr.value_type() {
                ValueType::Vector => QueryData::vector(
                    matrix
                        .into_iter()
                        .filter_map(|Series { metric, points }| {
                            points.last().map(|p| Sample::new(metric, query.end, p.v))
                        })
                        .collect(),
                ),
                ValueType::Scalar => {
                    let point = matrix
                        .first()
                        .and_then(|s| s.points.first())
                        .ok_or_else(|| QueryError::execution("scalar expression returned no sample"))?;
                    QueryData::Scalar(SamplePair(Point::new(query.start, point.v)))
                }
                other => {
                    return Err(QueryError::execution(format!(
                        "unexpected expression type \"{other}\""
                    )));
                }
            }
        } else {
            QueryData::matrix(matrix)
        };

        let response = QueryResponse {
            series_total,
            external_duration_ms: query.external_duration(),
            ..QueryResponse::success(data)
        };
        let body = if query.is_metric_model {
            None
        } else {
            Some(response.to_bytes()?)
        };
        Ok(ExecResponse {
            status: StatusCode::OK,
            response,
            body,
        })
    }

    /// Label sets of the series matching any `match[]` selector.
    pub async fn series(&self, request: &SeriesRequest) -> Result<(StatusCode, Vec<u8>), QueryError> {
        if request.matchers.is_empty() {
            return Err(QueryError::bad_data("no match[] parameter provided"));
        }
        let mut matcher_sets = Vec::with_capacity(request.matchers.len());
        for selector in &request.matchers {
            let matchers = self.parser.parse_metric_selector(selector)?;
            if matchers.iter().all(|m| m.matches("")) {
                return Err(QueryError::bad_data(
                    "match[] must contain at least one non-empty matcher",
                ));
            }
            matcher_sets.push(matchers);
        }

        let labels = self
            .leaf
            .series(&matcher_sets, request.start, request.end)
            .await?;
        tracing::debug!(selectors = matcher_sets.len(), series = labels.len(), "series lookup");
        Ok((StatusCode::OK, SeriesResponse::success(labels).to_bytes()?))
    }

    /// Raw field names read by the query.
    pub async fn get_fields(&self, query: Query) -> Result<BTreeSet<String>, QueryError> {
        self.get_field_values(query, "").await
    }

    /// Values `field_name` takes across the series the query reads.
    pub async fn get_field_values(
        &self,
        query: Query,
        field_name: &str,
    ) -> Result<BTreeSet<String>, QueryError> {
        let expr = self.parse(&query.query_str)?;
        check_result_type(&expr, StatusCode::BAD_REQUEST)?;
        let introspector = Introspector::new(self.leaf.as_ref(), &self.functions);
        guarded(introspector.fields(&expr, &query, field_name)).await
    }

    /// Label names carried by the query's result series.
    pub async fn get_labels(&self, query: Query) -> Result<BTreeSet<String>, QueryError> {
        let expr = self.parse(&query.query_str)?;
        check_result_type(&expr, StatusCode::BAD_REQUEST)?;
        let introspector = Introspector::new(self.leaf.as_ref(), &self.functions);
        guarded(introspector.labels(&expr, &query)).await
    }

    fn parse(&self, query_str: &str) -> Result<Expr, QueryError> {
        self.parser.parse_expr(query_str).map_err(|err| {
            tracing::warn!(query = query_str, error = %err, "failed to parse query");
            QueryError::bad_data(err.message())
        })
    }

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator {
            leaf: self.leaf.as_ref(),
            metric_models: self.metric_models.as_ref(),
            dictionaries: self.dictionaries.as_ref(),
            functions: &self.functions,
            max_query_points: self.settings.max_query_points,
        }
    }
}

fn check_result_type(expr: &Expr, status: StatusCode) -> Result<(), QueryError> {
    match expr.value_type() {
        ValueType::Scalar | ValueType::Vector | ValueType::Matrix => Ok(()),
        other => Err(QueryError::Execution {
            status,
            message: format!(
                "invalid expression type \"{other}\" for range query, must be Scalar, range or instant Vector"
            ),
        }),
    }
}

/// Runs `fut`, converting a panic into a 422 bad-data error.
async fn guarded<T, F>(fut: F) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(error = %message, "recovered panic during evaluation");
            Err(QueryError::invalid_argument(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "query evaluation panicked".to_string()
    }
}
