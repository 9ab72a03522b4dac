//! Binary operators and vector matching

use std::collections::{HashMap, HashSet};

use super::range::EvalNodeHelper;
use crate::query::error::QueryError;
use crate::query::promql::ast::{BinaryOp, MatchCardinality, VectorMatching};
use crate::query::promql::labels::{Labels, TSID_LABEL};
use crate::query::promql::value::{
    DUPLICATE_LABELSET, Sample, Vector, vector_has_duplicate_labelset,
};

const MANY_TO_MANY: &str = "many-to-many only allowed for set operators";
pub(crate) const DUPLICATE_MATCH_GROUP: &str =
    "found duplicate series for the match group, many-to-many only allowed for set operators";
pub(crate) const IMPLICIT_MANY_TO_ONE: &str =
    "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)";
const GROUPING_NOT_UNIQUE: &str =
    "multiple matches for labels: grouping labels must ensure unique matches";
const LEFT_JOIN_NEEDS_GROUP_LEFT: &str = "one-to-many need group_left in the formula";
const LEFT_JOIN_DUPLICATE: &str =
    "out_join match result vector cannot contain metrics with the same labelset";
const OUT_JOIN_DUPLICATE: &str = "out_join match result cannot contain metrics with the same labelset";

fn bool_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

pub(crate) fn scalar_binop(op: BinaryOp, lhs: f64, rhs: f64) -> Result<f64, QueryError> {
    let v = match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Div => lhs / rhs,
        BinaryOp::Pow => lhs.powf(rhs),
        BinaryOp::Mod => lhs % rhs,
        BinaryOp::Eql => bool_value(lhs == rhs),
        BinaryOp::Neq => bool_value(lhs != rhs),
        BinaryOp::Gtr => bool_value(lhs > rhs),
        BinaryOp::Lss => bool_value(lhs < rhs),
        BinaryOp::Gte => bool_value(lhs >= rhs),
        BinaryOp::Lte => bool_value(lhs <= rhs),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Unless => {
            return Err(QueryError::execution(format!(
                "operator \"{op}\" not allowed for Scalar operations"
            )));
        }
    };
    Ok(v)
}

/// Returns the result value and whether a comparison keeps the element.
fn vector_elem_binop(op: BinaryOp, lhs: f64, rhs: f64) -> Result<(f64, bool), QueryError> {
    let result = match op {
        BinaryOp::Add => (lhs + rhs, true),
        BinaryOp::Sub => (lhs - rhs, true),
        BinaryOp::Mul => (lhs * rhs, true),
        BinaryOp::Div => (lhs / rhs, true),
        BinaryOp::Pow => (lhs.powf(rhs), true),
        BinaryOp::Mod => (lhs % rhs, true),
        BinaryOp::Eql => (lhs, lhs == rhs),
        BinaryOp::Neq => (lhs, lhs != rhs),
        BinaryOp::Gtr => (lhs, lhs > rhs),
        BinaryOp::Lss => (lhs, lhs < rhs),
        BinaryOp::Gte => (lhs, lhs >= rhs),
        BinaryOp::Lte => (lhs, lhs <= rhs),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Unless => {
            return Err(QueryError::execution(format!(
                "operator \"{op}\" not allowed for operations between Vectors"
            )));
        }
    };
    Ok(result)
}

pub(crate) fn vector_scalar_binop(
    op: BinaryOp,
    lhs: &[Sample],
    scalar: f64,
    swap: bool,
    return_bool: bool,
    enh: &mut EvalNodeHelper,
) -> Result<Vector, QueryError> {
    let mut out = enh.take_out();
    for sample in lhs {
        let (lv, rv) = if swap {
            (scalar, sample.point.v)
        } else {
            (sample.point.v, scalar)
        };
        let (mut value, keep) = vector_elem_binop(op, lv, rv)?;
        // A swapped comparison keeps the vector element's value.
        if op.is_comparison() && swap {
            value = rv;
        }
        if return_bool {
            value = bool_value(keep);
        } else if !keep {
            continue;
        }
        out.push(Sample {
            metric: sample.metric.clone(),
            point: sample.point.with_value(value),
        });
    }
    Ok(out)
}

/// Match signature: `on` keeps exactly the listed labels, `ignoring` drops
/// them together with the metric name.
pub(crate) fn signature(metric: &Labels, on: bool, names: &[String]) -> Labels {
    if on {
        metric.keep(names)
    } else {
        metric.without(names).without_metric_name()
    }
}

fn matching_signature(metric: &Labels, matching: &VectorMatching) -> Labels {
    signature(metric, matching.on, &matching.matching_labels)
}

pub(crate) fn vector_and(
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    enh: &mut EvalNodeHelper,
) -> Vector {
    let mut out = enh.take_out();
    if lhs.is_empty() || rhs.is_empty() {
        return out;
    }
    let right_sigs: HashSet<Labels> = rhs
        .iter()
        .map(|s| matching_signature(&s.metric, matching))
        .collect();
    out.extend(
        lhs.iter()
            .filter(|s| right_sigs.contains(&matching_signature(&s.metric, matching)))
            .cloned(),
    );
    out
}

pub(crate) fn vector_or(
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    enh: &mut EvalNodeHelper,
) -> Vector {
    let mut out = enh.take_out();
    let left_sigs: HashSet<Labels> = lhs
        .iter()
        .map(|s| matching_signature(&s.metric, matching))
        .collect();
    out.extend(lhs.iter().cloned());
    out.extend(
        rhs.iter()
            .filter(|s| !left_sigs.contains(&matching_signature(&s.metric, matching)))
            .cloned(),
    );
    out
}

pub(crate) fn vector_unless(
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    enh: &mut EvalNodeHelper,
) -> Vector {
    let mut out = enh.take_out();
    if lhs.is_empty() || rhs.is_empty() {
        out.extend(lhs.iter().cloned());
        return out;
    }
    let right_sigs: HashSet<Labels> = rhs
        .iter()
        .map(|s| matching_signature(&s.metric, matching))
        .collect();
    out.extend(
        lhs.iter()
            .filter(|s| !right_sigs.contains(&matching_signature(&s.metric, matching)))
            .cloned(),
    );
    out
}

/// Arithmetic and comparison between two vectors.
pub(crate) fn vector_binop(
    op: BinaryOp,
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    return_bool: bool,
    enh: &mut EvalNodeHelper,
) -> Result<Vector, QueryError> {
    match matching.card {
        MatchCardinality::ManyToMany => return Err(QueryError::execution(MANY_TO_MANY)),
        MatchCardinality::LeftJoin => return left_join(op, lhs, rhs, matching, enh),
        MatchCardinality::OutJoin => return out_join(op, lhs, rhs, matching, enh),
        MatchCardinality::OneToOne | MatchCardinality::ManyToOne | MatchCardinality::OneToMany => {}
    }

    let one_to_many = matching.card == MatchCardinality::OneToMany;
    // The "many" side is always iterated; the "one" side is indexed.
    let (many, one) = if one_to_many { (rhs, lhs) } else { (lhs, rhs) };

    let mut one_sigs: HashMap<Labels, &Sample> = HashMap::with_capacity(one.len());
    for sample in one {
        if one_sigs
            .insert(matching_signature(&sample.metric, matching), sample)
            .is_some()
        {
            return Err(QueryError::execution(DUPLICATE_MATCH_GROUP));
        }
    }

    let mut matched_one_to_one: HashSet<Labels> = HashSet::new();
    let mut matched_grouped: HashMap<Labels, HashSet<Labels>> = HashMap::new();
    let mut out = enh.take_out();

    for ms in many {
        let sig = matching_signature(&ms.metric, matching);
        if matching.card == MatchCardinality::OneToOne && !matched_one_to_one.insert(sig.clone()) {
            return Err(QueryError::execution(IMPLICIT_MANY_TO_ONE));
        }
        let Some(os) = one_sigs.get(&sig) else {
            continue;
        };

        let (lv, rv) = if one_to_many {
            (os.point.v, ms.point.v)
        } else {
            (ms.point.v, os.point.v)
        };
        let (mut value, keep) = vector_elem_binop(op, lv, rv)?;
        if return_bool {
            value = bool_value(keep);
        } else if !keep {
            continue;
        }

        let metric = result_metric(&ms.metric, &os.metric, matching);
        if matching.card != MatchCardinality::OneToOne
            && !matched_grouped
                .entry(sig)
                .or_default()
                .insert(metric.clone())
        {
            return Err(QueryError::execution(GROUPING_NOT_UNIQUE));
        }

        out.push(Sample {
            metric,
            point: ms.point.with_value(value),
        });
    }
    Ok(out)
}

/// Output labels of a matched pair: `many` is the side being iterated.
fn result_metric(many: &Labels, one: &Labels, matching: &VectorMatching) -> Labels {
    match matching.card {
        MatchCardinality::ManyToOne | MatchCardinality::OneToMany => {
            let mut metric = many.clone();
            for name in &matching.include {
                match one.get(name) {
                    Some(value) => metric.set(name, value),
                    None => metric.remove(name),
                }
            }
            metric
        }
        _ if matching.on => many.keep(&matching.matching_labels),
        _ => many.without(&matching.matching_labels),
    }
}

/// Join labels actually compared between `left` and `right`.
fn join_labels<'a>(left: &Labels, right: &Labels, labels: &'a [String]) -> Vec<&'a str> {
    if left.contains(TSID_LABEL) && right.contains(TSID_LABEL) {
        return vec![TSID_LABEL];
    }
    labels
        .iter()
        .map(String::as_str)
        .filter(|name| left.contains(name))
        .collect()
}

fn join_match(left: &Labels, right: &Labels, labels: &[String]) -> bool {
    if labels.is_empty() {
        return false;
    }
    if left.is_empty() && right.is_empty() {
        return true;
    }
    let names = join_labels(left, right, labels);
    if names.is_empty() {
        return false;
    }
    names.iter().all(|name| {
        matches!((left.get(name), right.get(name)), (Some(l), Some(r)) if l == r)
    })
}

/// Left outer join: every left row survives, matched rows take the include
/// labels of their right match.
fn left_join(
    op: BinaryOp,
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    enh: &mut EvalNodeHelper,
) -> Result<Vector, QueryError> {
    let mut out = enh.take_out();
    if rhs.is_empty() {
        out.extend(lhs.iter().cloned());
        return Ok(out);
    }

    for ls in lhs {
        let matched: Vec<&Sample> = rhs
            .iter()
            .filter(|rs| join_match(&ls.metric, &rs.metric, &matching.matching_labels))
            .collect();
        if matched.is_empty() {
            out.push(ls.clone());
            continue;
        }
        if matched.len() > 1 {
            if !matching.group_left {
                return Err(QueryError::execution(LEFT_JOIN_NEEDS_GROUP_LEFT));
            }
            if matching.include.is_empty() {
                return Err(QueryError::execution(DUPLICATE_LABELSET));
            }
            let mut combos = HashSet::with_capacity(matched.len());
            for rs in &matched {
                let combo: Vec<Option<&str>> = matching
                    .include
                    .iter()
                    .map(|name| rs.metric.get(name))
                    .collect();
                if !combos.insert(combo) {
                    return Err(QueryError::execution(LEFT_JOIN_DUPLICATE));
                }
            }
        }
        for rs in matched {
            let (value, _) = vector_elem_binop(op, ls.point.v, rs.point.v)?;
            let mut metric = ls.metric.clone();
            for name in &matching.include {
                if let Some(v) = rs.metric.get(name) {
                    metric.set(name, v);
                }
            }
            out.push(Sample {
                metric,
                point: ls.point.with_value(value),
            });
        }
    }
    Ok(out)
}

fn join_row_labels(
    source: &Labels,
    join: &[String],
    include: &[String],
    into: &mut Labels,
) {
    for name in join.iter().chain(include) {
        if let Some(v) = source.get(name) {
            into.set(name, v);
        }
    }
}

/// Full outer join keyed on the join labels.
fn out_join(
    op: BinaryOp,
    lhs: &[Sample],
    rhs: &[Sample],
    matching: &VectorMatching,
    enh: &mut EvalNodeHelper,
) -> Result<Vector, QueryError> {
    let tsid_only = [TSID_LABEL.to_string()];
    let mut right_matched = vec![false; rhs.len()];
    let mut out = enh.take_out();

    for ls in lhs {
        let join: &[String] = if ls.metric.len() == 1 && ls.metric.contains(TSID_LABEL) {
            &tsid_only
        } else {
            &matching.matching_labels
        };
        let mut base = Labels::default();
        join_row_labels(&ls.metric, join, &matching.include_left, &mut base);

        let matched: Vec<usize> = rhs
            .iter()
            .enumerate()
            .filter(|(_, rs)| join_match(&ls.metric, &rs.metric, join))
            .map(|(i, _)| i)
            .collect();
        if matched.len() > 1
            && matching.include_left.is_empty()
            && matching.include_right.is_empty()
        {
            return Err(QueryError::execution(OUT_JOIN_DUPLICATE));
        }

        if matched.is_empty() {
            let (value, _) = vector_elem_binop(op, ls.point.v, 0.0)?;
            out.push(Sample {
                metric: base,
                point: ls.point.with_value(value),
            });
            continue;
        }
        for i in matched {
            right_matched[i] = true;
            let rs = &rhs[i];
            let mut metric = base.clone();
            join_row_labels(&rs.metric, &[], &matching.include_right, &mut metric);
            let (value, _) = vector_elem_binop(op, ls.point.v, rs.point.v)?;
            out.push(Sample {
                metric,
                point: ls.point.with_value(value),
            });
        }
    }

    for (rs, _) in rhs.iter().zip(&right_matched).filter(|(_, m)| !**m) {
        let mut metric = Labels::default();
        join_row_labels(
            &rs.metric,
            &matching.matching_labels,
            &matching.include_right,
            &mut metric,
        );
        let (value, _) = vector_elem_binop(op, 0.0, rs.point.v)?;
        out.push(Sample {
            metric,
            point: rs.point.with_value(value),
        });
    }

    if vector_has_duplicate_labelset(&out) {
        return Err(QueryError::execution(DUPLICATE_LABELSET));
    }
    Ok(out)
}
