//! Metric-model indirection
//!
//! `metric_model("<id>")` asks an external service to evaluate a stored model
//! over the query window and converts its uniform response into a matrix.

use std::collections::BTreeMap;

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::labels::Labels;
use super::query::{Filter, Query};
use super::value::{Matrix, Point, Series};
use crate::query::error::QueryError;

/// Request sent to the metric-model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricModelQuery {
    pub metric_model_id: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub step_str: String,
    pub is_instant_query: bool,
    pub is_calendar: bool,
    pub filters: Vec<Filter>,
}

impl MetricModelQuery {
    pub fn from_query(metric_model_id: &str, query: &Query) -> Self {
        Self {
            metric_model_id: metric_model_id.to_string(),
            start: query.start,
            end: query.end,
            step: query.interval,
            step_str: query.interval_str.clone(),
            is_instant_query: query.is_instant_query,
            is_calendar: query.is_calendar,
            filters: query.filters.clone(),
        }
    }
}

/// One series of a metric-model response. `times` and `values` are parallel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformSeries {
    pub labels: BTreeMap<String, String>,
    pub times: Vec<i64>,
    /// `null` marks a missing value.
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformResponse {
    pub datas: Vec<UniformSeries>,
    /// Time the service spent evaluating the model.
    #[serde(default)]
    pub external_duration_ms: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricModelService: Send + Sync {
    async fn exec(&self, query: &MetricModelQuery) -> Result<UniformResponse, QueryError>;
}

/// Used when no metric-model service is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredMetricModels;

#[async_trait]
impl MetricModelService for UnconfiguredMetricModels {
    async fn exec(&self, query: &MetricModelQuery) -> Result<UniformResponse, QueryError> {
        Err(QueryError::infrastructure(
            StatusCode::SERVICE_UNAVAILABLE,
            format!(
                "metric model service is not configured, cannot evaluate model {:?}",
                query.metric_model_id
            ),
        ))
    }
}

/// Converts a uniform response into a matrix, dropping non-numeric values and
/// series left without points.
pub(crate) fn uniform_to_matrix(response: UniformResponse) -> Matrix {
    response
        .datas
        .into_iter()
        .filter_map(|series| {
            let points: Vec<Point> = series
                .times
                .iter()
                .zip(series.values.iter())
                .filter_map(|(t, v)| numeric(v).map(|v| Point::new(*t, v)))
                .collect();
            if points.is_empty() {
                None
            } else {
                Some(Series::new(Labels::from_pairs(series.labels), points))
            }
        })
        .collect()
}

/// Numbers, and strings holding a number, are values; anything else is a gap.
fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        other => other.as_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uniform_to_matrix_drops_missing_values() {
        let response = UniformResponse {
            datas: vec![
                UniformSeries {
                    labels: BTreeMap::from([
                        ("zone".to_string(), "b".to_string()),
                        ("host".to_string(), "a".to_string()),
                    ]),
                    times: vec![1000, 2000, 3000, 4000],
                    values: vec![json!(1.5), json!(null), json!("n/a"), json!("2.25")],
                },
                UniformSeries {
                    labels: BTreeMap::new(),
                    times: vec![1000],
                    values: vec![json!(null)],
                },
            ],
            external_duration_ms: 5,
        };
        let matrix = uniform_to_matrix(response);
        assert_eq!(matrix.len(), 1);
        assert_eq!(
            matrix[0].metric.names().collect::<Vec<_>>(),
            vec!["host", "zone"]
        );
        assert_eq!(
            matrix[0].points,
            vec![Point::new(1000, 1.5), Point::new(4000, 2.25)]
        );
    }

    #[test]
    fn test_model_query_carries_time_parameters() {
        let query = Query::range("metric_model(\"m1\")", 0, 600_000, 60_000)
            .with_calendar_interval("hour");
        let model_query = MetricModelQuery::from_query("m1", &query);
        assert_eq!(model_query.metric_model_id, "m1");
        assert_eq!(model_query.step, 60_000);
        assert_eq!(model_query.step_str, "hour");
        assert!(model_query.is_calendar);
        assert!(!model_query.is_instant_query);
    }

    #[tokio::test]
    async fn test_unconfigured_service_fails() {
        let query = MetricModelQuery::from_query("m1", &Query::instant("", 0));
        let err = UnconfiguredMetricModels.exec(&query).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
