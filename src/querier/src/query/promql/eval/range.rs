//! Per-step driver shared by every vector-producing node

use std::collections::HashMap;

use crate::query::error::QueryError;
use crate::query::promql::labels::Labels;
use crate::query::promql::query::Query;
use crate::query::promql::value::{
    DUPLICATE_LABELSET, Matrix, Point, Sample, Series, Vector, vector_has_duplicate_labelset,
};

/// Per-series state computed once before stepping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalSeriesHelper {
    /// Output labels of the aggregation group the series belongs to.
    pub grouping_key: Labels,
}

/// Per-node scratch state reused across steps.
#[derive(Debug, Default)]
pub struct EvalNodeHelper {
    /// Timestamp of the step being evaluated.
    pub ts: i64,
    out: Vector,
}

impl EvalNodeHelper {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ts: 0,
            out: Vector::with_capacity(capacity),
        }
    }

    /// Takes the (empty) output buffer of this node.
    pub fn take_out(&mut self) -> Vector {
        std::mem::take(&mut self.out)
    }

    fn recycle(&mut self, mut buffer: Vector) {
        buffer.clear();
        self.out = buffer;
    }
}

pub type SeriesPrep<'a> = &'a (dyn Fn(&Labels) -> EvalSeriesHelper + Sync);

/// Steps through already-evaluated argument matrices and assembles the
/// callback's per-step vectors into a matrix.
///
/// Each series is consumed with a forward cursor: at every step only its next
/// unconsumed point is considered and it is taken when its timestamp equals
/// the step (always for instant queries).
pub(crate) fn step_matrices<F>(
    query: &Query,
    matrices: &[Matrix],
    prep: Option<SeriesPrep<'_>>,
    mut func: F,
) -> Result<Matrix, QueryError>
where
    F: FnMut(&[Vector], &[Vec<EvalSeriesHelper>], &mut EvalNodeHelper) -> Result<Vector, QueryError>,
{
    let series_helpers: Vec<Vec<EvalSeriesHelper>> = match prep {
        Some(prep) => matrices
            .iter()
            .map(|m| m.iter().map(|s| prep(&s.metric)).collect())
            .collect(),
        None => Vec::new(),
    };
    let biggest = matrices.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let steps = query.step_times();

    let mut cursors: Vec<Vec<usize>> = matrices.iter().map(|m| vec![0; m.len()]).collect();
    let mut vectors: Vec<Vector> = matrices
        .iter()
        .map(|m| Vector::with_capacity(m.len()))
        .collect();
    let mut step_helpers: Vec<Vec<EvalSeriesHelper>> = vec![Vec::new(); series_helpers.len()];
    let mut enh = EvalNodeHelper::with_capacity(biggest);

    let mut index: HashMap<Labels, usize> = HashMap::with_capacity(biggest);
    let mut output = Matrix::with_capacity(biggest);

    for &ts in &steps {
        for (i, matrix) in matrices.iter().enumerate() {
            vectors[i].clear();
            if let Some(helpers) = step_helpers.get_mut(i) {
                helpers.clear();
            }
            for (si, series) in matrix.iter().enumerate() {
                let cursor = &mut cursors[i][si];
                let Some(point) = series.points.get(*cursor) else {
                    continue;
                };
                if query.is_instant_query || point.t == ts {
                    vectors[i].push(Sample {
                        metric: series.metric.clone(),
                        point: *point,
                    });
                    if let Some(helpers) = step_helpers.get_mut(i) {
                        helpers.push(series_helpers[i][si].clone());
                    }
                    *cursor += 1;
                }
            }
        }

        enh.ts = ts;
        let mut result = func(&vectors, &step_helpers, &mut enh)?;
        if vector_has_duplicate_labelset(&result) {
            return Err(QueryError::execution(DUPLICATE_LABELSET));
        }

        if query.fixed_start == query.fixed_end {
            return Ok(result
                .into_iter()
                .map(|s| Series::new(s.metric, vec![Point::new(ts, s.point.v)]))
                .collect());
        }

        for sample in result.drain(..) {
            let point = Point::new(ts, sample.point.v);
            match index.get(&sample.metric) {
                Some(&pos) => output[pos].points.push(point),
                None => {
                    index.insert(sample.metric.clone(), output.len());
                    let mut points = Vec::with_capacity(steps.len());
                    points.push(point);
                    output.push(Series::new(sample.metric, points));
                }
            }
        }
        enh.recycle(result);
    }

    Ok(output)
}
