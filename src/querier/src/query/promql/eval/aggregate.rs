//! Aggregation operators

use std::cmp::Ordering;
use std::collections::HashMap;

use super::range::{EvalNodeHelper, EvalSeriesHelper};
use crate::query::error::QueryError;
use crate::query::promql::ast::AggregateOp;
use crate::query::promql::labels::Labels;
use crate::query::promql::value::{Sample, Vector};

/// Output labels of the group `metric` falls into.
pub(crate) fn grouping_key(metric: &Labels, grouping: &[String], without: bool) -> Labels {
    if without {
        metric.without(grouping).without_metric_name()
    } else if grouping.is_empty() {
        Labels::default()
    } else {
        metric.keep(grouping)
    }
}

struct Group<'a> {
    labels: Labels,
    value: f64,
    mean: f64,
    count: usize,
    members: Vec<&'a Sample>,
}

/// Descending by value, NaN last.
pub(super) fn cmp_desc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Ascending by value, NaN last.
pub(super) fn cmp_asc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn convertible_to_i64(v: f64) -> bool {
    v >= i64::MIN as f64 && v <= i64::MAX as f64
}

/// Aggregates one step's vector. `helpers` carries the grouping key of each
/// sample in `vec`.
pub(crate) fn aggregation(
    op: AggregateOp,
    param: Option<f64>,
    vec: &[Sample],
    helpers: &[EvalSeriesHelper],
    enh: &mut EvalNodeHelper,
) -> Result<Vector, QueryError> {
    let mut k = 0usize;
    if matches!(op, AggregateOp::Topk | AggregateOp::Bottomk) {
        let f = param.ok_or_else(|| {
            QueryError::bad_data(format!("parameter is required for {}", op.as_str()))
        })?;
        if !convertible_to_i64(f) {
            return Err(QueryError::execution(format!(
                "Scalar value {f} overflows int64"
            )));
        }
        let requested = f as i64;
        if requested < 1 {
            return Ok(enh.take_out());
        }
        k = usize::try_from(requested).unwrap_or(usize::MAX);
    }

    let mut index: HashMap<&Labels, usize> = HashMap::new();
    let mut groups: Vec<Group<'_>> = Vec::new();

    for (sample, helper) in vec.iter().zip(helpers) {
        let v = sample.point.v;
        let pos = match index.get(&helper.grouping_key) {
            Some(&pos) => pos,
            None => {
                index.insert(&helper.grouping_key, groups.len());
                groups.push(Group {
                    labels: helper.grouping_key.clone(),
                    value: v,
                    mean: v,
                    count: 1,
                    members: vec![sample],
                });
                continue;
            }
        };
        let group = &mut groups[pos];
        group.count += 1;
        match op {
            AggregateOp::Sum => group.value += v,
            AggregateOp::Avg => {
                if group.mean.is_infinite() {
                    if v.is_infinite() && v.signum() != group.mean.signum() {
                        // +Inf and -Inf average to NaN
                        group.mean = f64::NAN;
                    }
                } else if v.is_infinite() {
                    group.mean = v;
                } else {
                    group.mean += v / group.count as f64 - group.mean / group.count as f64;
                }
            }
            AggregateOp::Max => {
                if group.value < v || group.value.is_nan() {
                    group.value = v;
                }
            }
            AggregateOp::Min => {
                if group.value > v || group.value.is_nan() {
                    group.value = v;
                }
            }
            AggregateOp::Count => {}
            AggregateOp::Topk | AggregateOp::Bottomk => group.members.push(sample),
        }
    }

    let mut out = enh.take_out();
    for mut group in groups {
        match op {
            AggregateOp::Sum | AggregateOp::Max | AggregateOp::Min => {
                out.push(Sample::new(group.labels, 0, group.value));
            }
            AggregateOp::Avg => out.push(Sample::new(group.labels, 0, group.mean)),
            AggregateOp::Count => out.push(Sample::new(group.labels, 0, group.count as f64)),
            AggregateOp::Topk | AggregateOp::Bottomk => {
                let cmp = if op == AggregateOp::Topk {
                    cmp_desc
                } else {
                    cmp_asc
                };
                group
                    .members
                    .sort_by(|a, b| cmp(a.point.v, b.point.v));
                group.members.truncate(k);
                out.extend(group.members.into_iter().cloned());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(pairs: &[(&str, &str)], v: f64) -> Sample {
        Sample::new(Labels::from_pairs(pairs.iter().copied()), 0, v)
    }

    fn run(
        op: AggregateOp,
        param: Option<f64>,
        vec: &[Sample],
        grouping: &[&str],
        without: bool,
    ) -> Result<Vector, QueryError> {
        let grouping: Vec<String> = grouping.iter().map(|g| g.to_string()).collect();
        let helpers: Vec<EvalSeriesHelper> = vec
            .iter()
            .map(|s| EvalSeriesHelper {
                grouping_key: grouping_key(&s.metric, &grouping, without),
            })
            .collect();
        aggregation(op, param, vec, &helpers, &mut EvalNodeHelper::default())
    }

    fn input() -> Vec<Sample> {
        vec![
            sample(&[("__name__", "m"), ("job", "a"), ("i", "1")], 1.0),
            sample(&[("__name__", "m"), ("job", "b"), ("i", "2")], 5.0),
            sample(&[("__name__", "m"), ("job", "a"), ("i", "3")], 3.0),
        ]
    }

    #[test]
    fn test_sum_by_and_without() {
        let out = run(AggregateOp::Sum, None, &input(), &["job"], false).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].metric, Labels::from_pairs([("job", "a")]));
        assert_eq!(out[0].point.v, 4.0);
        assert_eq!(out[1].point.v, 5.0);

        let out = run(AggregateOp::Sum, None, &input(), &["i"], true).unwrap();
        assert_eq!(out, run(AggregateOp::Sum, None, &input(), &["job"], false).unwrap());

        let out = run(AggregateOp::Sum, None, &input(), &[], false).unwrap();
        assert_eq!(out, vec![Sample::new(Labels::default(), 0, 9.0)]);
    }

    #[test]
    fn test_avg_count_min_max() {
        let v = input();
        assert_eq!(run(AggregateOp::Avg, None, &v, &[], false).unwrap()[0].point.v, 3.0);
        assert_eq!(run(AggregateOp::Count, None, &v, &[], false).unwrap()[0].point.v, 3.0);
        assert_eq!(run(AggregateOp::Min, None, &v, &[], false).unwrap()[0].point.v, 1.0);
        assert_eq!(run(AggregateOp::Max, None, &v, &[], false).unwrap()[0].point.v, 5.0);
    }

    #[test]
    fn test_avg_with_infinities() {
        let v = vec![
            sample(&[("i", "1")], f64::INFINITY),
            sample(&[("i", "2")], 1.0),
        ];
        assert_eq!(
            run(AggregateOp::Avg, None, &v, &[], false).unwrap()[0].point.v,
            f64::INFINITY
        );
        let v = vec![
            sample(&[("i", "1")], f64::INFINITY),
            sample(&[("i", "2")], f64::NEG_INFINITY),
        ];
        assert!(run(AggregateOp::Avg, None, &v, &[], false).unwrap()[0].point.v.is_nan());
    }

    #[test]
    fn test_max_replaces_nan() {
        let v = vec![sample(&[("i", "1")], f64::NAN), sample(&[("i", "2")], 2.0)];
        assert_eq!(run(AggregateOp::Max, None, &v, &[], false).unwrap()[0].point.v, 2.0);
        assert_eq!(run(AggregateOp::Min, None, &v, &[], false).unwrap()[0].point.v, 2.0);
    }

    #[test]
    fn test_topk_bottomk() {
        let v = input();
        let out = run(AggregateOp::Topk, Some(2.0), &v, &[], false).unwrap();
        assert_eq!(out.iter().map(|s| s.point.v).collect::<Vec<_>>(), vec![5.0, 3.0]);
        assert_eq!(out[0].metric, v[1].metric);

        let out = run(AggregateOp::Bottomk, Some(1.0), &v, &["job"], false).unwrap();
        assert_eq!(out.iter().map(|s| s.point.v).collect::<Vec<_>>(), vec![1.0, 5.0]);

        assert!(run(AggregateOp::Topk, Some(0.0), &v, &[], false).unwrap().is_empty());
    }

    #[test]
    fn test_topk_nan_sorts_last_and_ties_keep_order() {
        let v = vec![
            sample(&[("i", "1")], f64::NAN),
            sample(&[("i", "2")], 1.0),
            sample(&[("i", "3")], 1.0),
        ];
        let out = run(AggregateOp::Topk, Some(2.0), &v, &[], false).unwrap();
        assert_eq!(out[0].metric.get("i"), Some("2"));
        assert_eq!(out[1].metric.get("i"), Some("3"));
        let out = run(AggregateOp::Bottomk, Some(3.0), &v, &[], false).unwrap();
        assert_eq!(out[2].metric.get("i"), Some("1"));
    }

    #[test]
    fn test_topk_overflow() {
        let err = run(AggregateOp::Topk, Some(1e20), &input(), &[], false).unwrap_err();
        assert_eq!(err.message(), "Scalar value 100000000000000000000 overflows int64");
        assert!(run(AggregateOp::Topk, Some(f64::NAN), &input(), &[], false).is_err());
    }

    proptest! {
        /// Grouping by a label and grouping without its complement partition the
        /// input identically.
        #[test]
        fn prop_by_and_without_complement_agree(
            values in proptest::collection::vec((0u8..4, 0u8..3, -100.0f64..100.0), 1..20),
        ) {
            let mut seen = std::collections::HashSet::new();
            let v: Vec<Sample> = values
                .iter()
                .enumerate()
                .filter(|(_, (a, b, _))| seen.insert((*a, *b)))
                .map(|(i, (a, b, val))| sample(
                    &[("__name__", "m"), ("a", &a.to_string()), ("b", &b.to_string()), ("id", &i.to_string())],
                    *val,
                ))
                .collect();
            let by = run(AggregateOp::Count, None, &v, &["a"], false).unwrap();
            let without = run(AggregateOp::Count, None, &v, &["b", "id"], true).unwrap();
            prop_assert_eq!(&by, &without);
            let total: f64 = by.iter().map(|s| s.point.v).sum();
            prop_assert_eq!(total as usize, v.len());
        }

        /// topk(k) and bottomk(n-k) together select every series exactly once.
        #[test]
        fn prop_topk_bottomk_partition(
            values in proptest::collection::hash_set(-1000i32..1000, 1..15),
            split in 0usize..15,
        ) {
            let v: Vec<Sample> = values
                .iter()
                .enumerate()
                .map(|(i, val)| sample(&[("id", &i.to_string())], f64::from(*val)))
                .collect();
            let k = split.min(v.len());
            let top = run(AggregateOp::Topk, Some(k as f64), &v, &[], false).unwrap();
            let bottom = run(AggregateOp::Bottomk, Some((v.len() - k) as f64), &v, &[], false).unwrap();
            let mut ids: Vec<_> = top.iter().chain(&bottom).map(|s| s.metric.clone()).collect();
            ids.sort();
            let mut expected: Vec<_> = v.iter().map(|s| s.metric.clone()).collect();
            expected.sort();
            prop_assert_eq!(ids, expected);
        }
    }
}
