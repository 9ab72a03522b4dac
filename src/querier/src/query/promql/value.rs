//! Value algebra shared by the evaluator and its collaborators

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::labels::Labels;
use crate::query::error::QueryError;

pub(crate) const DUPLICATE_LABELSET: &str = "vector cannot contain metrics with the same labelset";

/// A value at a timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub t: i64,
    pub v: f64,
}

impl Point {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }

    pub fn with_value(self, v: f64) -> Self {
        Self { t: self.t, v }
    }
}

/// One observation of a series at the current evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Labels,
    pub point: Point,
}

impl Sample {
    pub fn new(metric: Labels, t: i64, v: f64) -> Self {
        Self {
            metric,
            point: Point { t, v },
        }
    }

    /// An unlabeled sample carrying a scalar value.
    pub fn scalar(v: f64) -> Self {
        Self::new(Labels::default(), 0, v)
    }
}

/// Samples sharing one logical timestamp.
pub type Vector = Vec<Sample>;

/// A labeled sequence of points, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series {
    pub metric: Labels,
    pub points: Vec<Point>,
}

impl Series {
    pub fn new(metric: Labels, points: Vec<Point>) -> Self {
        Self { metric, points }
    }
}

pub type Matrix = Vec<Series>;

/// A page of series returned by the backend together with the real series count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageMatrix {
    pub matrix: Matrix,
    pub total_series: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Scalar {
    pub t: i64,
    pub v: f64,
}

/// Result of evaluating one expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Matrix(Matrix),
    Page(PageMatrix),
}

impl Value {
    pub fn matrix(&self) -> &Matrix {
        match self {
            Value::Matrix(m) => m,
            Value::Page(p) => &p.matrix,
        }
    }

    pub fn into_matrix(self) -> Matrix {
        match self {
            Value::Matrix(m) => m,
            Value::Page(p) => p.matrix,
        }
    }

    /// The backend's series count when only a page was returned.
    pub fn total_series(&self) -> Option<usize> {
        match self {
            Value::Matrix(_) => None,
            Value::Page(p) => Some(p.total_series),
        }
    }

    /// Rewrites the contained matrix, keeping the page wrapper when present.
    pub fn try_map<F>(self, f: F) -> Result<Value, QueryError>
    where
        F: FnOnce(Matrix) -> Result<Matrix, QueryError>,
    {
        match self {
            Value::Matrix(m) => Ok(Value::Matrix(f(m)?)),
            Value::Page(p) => Ok(Value::Page(PageMatrix {
                matrix: f(p.matrix)?,
                total_series: p.total_series,
            })),
        }
    }
}

impl From<Matrix> for Value {
    fn from(m: Matrix) -> Self {
        Value::Matrix(m)
    }
}

impl From<PageMatrix> for Value {
    fn from(p: PageMatrix) -> Self {
        Value::Page(p)
    }
}

pub(crate) fn vector_has_duplicate_labelset(vector: &[Sample]) -> bool {
    if vector.len() < 2 {
        return false;
    }
    let mut seen = HashSet::with_capacity(vector.len());
    vector.iter().any(|s| !seen.insert(&s.metric))
}

pub(crate) fn matrix_has_duplicate_labelset(matrix: &[Series]) -> bool {
    if matrix.len() < 2 {
        return false;
    }
    let mut seen = HashSet::with_capacity(matrix.len());
    matrix.iter().any(|s| !seen.insert(&s.metric))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_labelset_detection() {
        let a = Labels::from_pairs([("a", "1")]);
        let b = Labels::from_pairs([("a", "2")]);
        let v = vec![
            Sample::new(a.clone(), 0, 1.0),
            Sample::new(b, 0, 2.0),
            Sample::new(a.clone(), 0, 3.0),
        ];
        assert!(vector_has_duplicate_labelset(&v));
        assert!(!vector_has_duplicate_labelset(&v[..2]));

        let m = vec![Series::new(a.clone(), vec![]), Series::new(a, vec![])];
        assert!(matrix_has_duplicate_labelset(&m));
    }

    #[test]
    fn test_try_map_keeps_page() {
        let page = Value::Page(PageMatrix {
            matrix: vec![Series::new(Labels::default(), vec![Point::new(1, 2.0)])],
            total_series: 7,
        });
        let mapped = page
            .try_map(|mut m| {
                for s in m.iter_mut() {
                    for p in s.points.iter_mut() {
                        p.v = -p.v;
                    }
                }
                Ok(m)
            })
            .unwrap();
        assert_eq!(mapped.total_series(), Some(7));
        assert_eq!(mapped.matrix()[0].points[0].v, -2.0);
    }
}
