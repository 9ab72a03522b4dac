//! Prometheus-style response envelope
//!
//! Samples are rendered as `[<unix seconds>, "<value>"]` and results are
//! tagged with their `resultType`, matching the Prometheus HTTP API.

use serde::ser::{SerializeTuple, Serializer};
use serde::Serialize;

use super::labels::Labels;
use super::value::{Matrix, Point, Sample, Series};
use crate::query::error::QueryError;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Renders a sample value the way Prometheus does.
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{v}")
    }
}

/// A point serialised as `[seconds, "value"]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePair(pub Point);

impl Serialize for SamplePair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&(self.0.t as f64 / 1000.0))?;
        tuple.serialize_element(&format_value(self.0.v))?;
        tuple.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatrixSeries {
    pub metric: Labels,
    pub values: Vec<SamplePair>,
}

impl From<Series> for MatrixSeries {
    fn from(series: Series) -> Self {
        Self {
            metric: series.metric,
            values: series.points.into_iter().map(SamplePair).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorSample {
    pub metric: Labels,
    pub value: SamplePair,
}

impl From<Sample> for VectorSample {
    fn from(sample: Sample) -> Self {
        Self {
            metric: sample.metric,
            value: SamplePair(sample.point),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    Matrix(Vec<MatrixSeries>),
    Vector(Vec<VectorSample>),
    Scalar(SamplePair),
}

impl QueryData {
    pub fn matrix(matrix: Matrix) -> Self {
        QueryData::Matrix(matrix.into_iter().map(MatrixSeries::from).collect())
    }

    pub fn vector(vector: Vec<Sample>) -> Self {
        QueryData::Vector(vector.into_iter().map(VectorSample::from).collect())
    }

    pub fn result_type(&self) -> &'static str {
        match self {
            QueryData::Matrix(_) => "matrix",
            QueryData::Vector(_) => "vector",
            QueryData::Scalar(_) => "scalar",
        }
    }
}

/// Result of one query. Only `status` and `data` go on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub status: &'static str,
    pub data: QueryData,
    /// Series count before backend paging, when the result was paged.
    #[serde(skip)]
    pub series_total: Option<usize>,
    /// Time spent in the metric-model service.
    #[serde(skip)]
    pub external_duration_ms: i64,
}

impl QueryResponse {
    pub fn success(data: QueryData) -> Self {
        Self {
            status: STATUS_SUCCESS,
            data,
            series_total: None,
            external_duration_ms: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, QueryError> {
        serde_json::to_vec(self).map_err(|err| {
            QueryError::execution(format!("failed to marshal query response: {err}"))
        })
    }
}

/// Body of the series endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesResponse {
    pub status: &'static str,
    pub data: Vec<Labels>,
}

impl SeriesResponse {
    pub fn success(data: Vec<Labels>) -> Self {
        Self {
            status: STATUS_SUCCESS,
            data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, QueryError> {
        serde_json::to_vec(self).map_err(|err| {
            QueryError::execution(format!("failed to marshal series response: {err}"))
        })
    }
}

/// Error body: `{"status":"error","errorType":"bad_data","error":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    #[serde(rename = "errorType")]
    pub error_type: &'static str,
    pub error: String,
}

impl From<&QueryError> for ErrorResponse {
    fn from(err: &QueryError) -> Self {
        Self {
            status: STATUS_ERROR,
            error_type: err.kind().as_str(),
            error: err.message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_special_values() {
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_value(21.0), "21");
        assert_eq!(format_value(0.25), "0.25");
    }

    #[test]
    fn test_matrix_envelope() {
        let matrix = vec![Series::new(
            Labels::from_pairs([("__name__", "up"), ("job", "api")]),
            vec![Point::new(1_000, 1.0), Point::new(61_500, f64::NAN)],
        )];
        let response = QueryResponse {
            series_total: Some(7),
            ..QueryResponse::success(QueryData::matrix(matrix))
        };
        let body: serde_json::Value = serde_json::from_slice(&response.to_bytes().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({
                "status": "success",
                "data": {
                    "resultType": "matrix",
                    "result": [{
                        "metric": {"__name__": "up", "job": "api"},
                        "values": [[1.0, "1"], [61.5, "NaN"]]
                    }]
                }
            })
        );
    }

    #[test]
    fn test_vector_and_scalar_envelope() {
        let vector = QueryResponse::success(QueryData::vector(vec![Sample::new(
            Labels::default(),
            2_000,
            21.0,
        )]));
        let body = serde_json::to_value(&vector).unwrap();
        assert_eq!(body["data"]["resultType"], "vector");
        assert_eq!(body["data"]["result"][0]["value"], json!([2.0, "21"]));

        let scalar = QueryResponse::success(QueryData::Scalar(SamplePair(Point::new(0, -1.5))));
        let body = serde_json::to_value(&scalar).unwrap();
        assert_eq!(body["data"], json!({"resultType": "scalar", "result": [0.0, "-1.5"]}));
    }

    #[test]
    fn test_error_envelope() {
        let err = QueryError::bad_data("'foo' is not currently supported");
        let body = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(
            body,
            json!({
                "status": "error",
                "errorType": "bad_data",
                "error": "'foo' is not currently supported"
            })
        );
    }
}
