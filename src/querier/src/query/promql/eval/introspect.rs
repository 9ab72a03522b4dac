//! Field and label introspection
//!
//! Walks an expression without evaluating it to answer two questions: which
//! raw fields the query reads (or which values one field takes), and which
//! labels its result series carry.

use std::collections::BTreeSet;

use futures::future::BoxFuture;

use super::functions::{FunctionKind, FunctionRegistry, string_arg};
use crate::query::error::QueryError;
use crate::query::promql::ast::{AggregateOp, BinaryExpr, Call, Expr, MatchCardinality, ValueType};
use crate::query::promql::labels::ALL_LABELS;
use crate::query::promql::leaf::LeafNodes;
use crate::query::promql::query::Query;

type FieldSet = BTreeSet<String>;

fn unhandled(expr: &Expr) -> QueryError {
    QueryError::execution(format!("unhandled expression of type {}", expr.value_type()))
}

fn all_labels() -> FieldSet {
    BTreeSet::from([ALL_LABELS.to_string()])
}

/// Vector label names given at positions 3, 5, ... of dictionary functions.
fn dictionary_vector_labels(call: &Call) -> Result<Vec<&str>, QueryError> {
    (3..call.args.len())
        .step_by(2)
        .map(|i| string_arg(call, i))
        .collect()
}

pub(crate) struct Introspector<'a> {
    leaf: &'a dyn LeafNodes,
    functions: &'a FunctionRegistry,
}

impl<'a> Introspector<'a> {
    pub(crate) fn new(leaf: &'a dyn LeafNodes, functions: &'a FunctionRegistry) -> Self {
        Self { leaf, functions }
    }

    /// Field names read by `expr` when `field_name` is empty, otherwise the
    /// values `field_name` takes.
    pub(crate) fn fields<'b>(
        &'b self,
        expr: &'b Expr,
        query: &'b Query,
        field_name: &'b str,
    ) -> BoxFuture<'b, Result<FieldSet, QueryError>> {
        Box::pin(async move {
            match expr {
                Expr::Aggregate(agg) => self.fields(&agg.expr, query, field_name).await,
                Expr::Call(call) => {
                    self.functions.resolve(&call.func)?;
                    if let Some(ms) = call.matrix_arg() {
                        return self
                            .leaf
                            .eval_vector_selector_fields(&ms.selector, query, field_name)
                            .await;
                    }
                    let mut fields = FieldSet::new();
                    for arg in non_string_args(call) {
                        fields.extend(self.fields(arg, query, field_name).await?);
                    }
                    Ok(fields)
                }
                Expr::Paren(inner) | Expr::Unary(inner) => {
                    self.fields(inner, query, field_name).await
                }
                Expr::Binary(bin) => {
                    let mut fields = self
                        .fields(&bin.lhs, query, field_name)
                        .await
                        .unwrap_or_default();
                    fields.extend(
                        self.fields(&bin.rhs, query, field_name)
                            .await
                            .unwrap_or_default(),
                    );
                    Ok(fields)
                }
                Expr::NumberLiteral(_) | Expr::StepInvariant(_) => Ok(FieldSet::new()),
                Expr::VectorSelector(vs) => {
                    self.leaf
                        .eval_vector_selector_fields(vs, query, field_name)
                        .await
                }
                Expr::StringLiteral(_) | Expr::MatrixSelector(_) => Err(unhandled(expr)),
            }
        })
    }

    /// Label names carried by the series `expr` produces. The `__all`
    /// sentinel stands for "does not restrict the labels".
    pub(crate) fn labels<'b>(
        &'b self,
        expr: &'b Expr,
        query: &'b Query,
    ) -> BoxFuture<'b, Result<FieldSet, QueryError>> {
        Box::pin(async move {
            match expr {
                Expr::Aggregate(agg) => {
                    let labels = self.labels(&agg.expr, query).await?;
                    if matches!(agg.op, AggregateOp::Topk | AggregateOp::Bottomk) {
                        return Ok(labels);
                    }
                    Ok(labels
                        .into_iter()
                        .filter(|l| agg.grouping.contains(l) != agg.without)
                        .collect())
                }
                Expr::Call(call) => self.call_labels(call, query).await,
                Expr::Paren(inner) | Expr::Unary(inner) => self.labels(inner, query).await,
                Expr::Binary(bin) => {
                    let lhs = self.labels(&bin.lhs, query).await.unwrap_or_default();
                    let rhs = self.labels(&bin.rhs, query).await.unwrap_or_default();
                    Ok(binary_labels(bin, lhs, rhs))
                }
                Expr::NumberLiteral(_) | Expr::StepInvariant(_) => Ok(all_labels()),
                Expr::VectorSelector(vs) => {
                    self.leaf.eval_vector_selector_fields(vs, query, "").await
                }
                Expr::MatrixSelector(ms) => {
                    self.leaf
                        .eval_vector_selector_fields(&ms.selector, query, "")
                        .await
                }
                Expr::StringLiteral(_) => Err(unhandled(expr)),
            }
        })
    }

    async fn call_labels(&self, call: &Call, query: &Query) -> Result<FieldSet, QueryError> {
        match self.functions.resolve(&call.func)? {
            FunctionKind::DictLabels => {
                let mut labels = self.first_arg_labels(call, query).await?;
                labels.extend(dictionary_vector_labels(call)?.into_iter().map(String::from));
                Ok(labels)
            }
            FunctionKind::DictValues => Ok(dictionary_vector_labels(call)?
                .into_iter()
                .map(String::from)
                .collect()),
            FunctionKind::LabelJoin | FunctionKind::LabelReplace => {
                let mut labels = self.first_arg_labels(call, query).await?;
                labels.insert(string_arg(call, 1)?.to_string());
                Ok(labels)
            }
            _ => {
                let mut labels = FieldSet::new();
                for arg in non_string_args(call) {
                    labels.extend(self.labels(arg, query).await?);
                }
                Ok(labels)
            }
        }
    }

    async fn first_arg_labels(&self, call: &Call, query: &Query) -> Result<FieldSet, QueryError> {
        let arg = call.args.first().ok_or_else(|| {
            QueryError::bad_data(format!("missing argument 1 of {}()", call.func))
        })?;
        self.labels(arg, query).await
    }
}

fn non_string_args(call: &Call) -> impl Iterator<Item = &Expr> {
    call.args
        .iter()
        .filter(|arg| arg.value_type() != ValueType::String)
}

fn binary_labels(bin: &BinaryExpr, lhs: FieldSet, rhs: FieldSet) -> FieldSet {
    let matching = &bin.matching;
    match matching.card {
        MatchCardinality::LeftJoin => {
            let mut labels = lhs;
            if matching.matching_labels.iter().any(|l| rhs.contains(l)) {
                labels.extend(matching.include.iter().filter(|l| rhs.contains(*l)).cloned());
            }
            return labels;
        }
        MatchCardinality::OutJoin => {
            return matching
                .matching_labels
                .iter()
                .filter(|l| lhs.contains(*l) || rhs.contains(*l))
                .chain(matching.include_left.iter().filter(|l| lhs.contains(*l)))
                .chain(matching.include_right.iter().filter(|l| rhs.contains(*l)))
                .cloned()
                .collect();
        }
        _ => {}
    }

    if matching.on {
        if matching
            .matching_labels
            .iter()
            .all(|l| lhs.contains(l) && rhs.contains(l))
        {
            return matching.matching_labels.iter().cloned().collect();
        }
        return FieldSet::new();
    }

    if !matching.matching_labels.is_empty() {
        let kept = |l: &&String| !matching.matching_labels.contains(*l);
        let lhs_kept: FieldSet = lhs.iter().filter(kept).cloned().collect();
        let rhs_kept: FieldSet = rhs.iter().filter(kept).cloned().collect();
        if lhs_kept != rhs_kept {
            return FieldSet::new();
        }
        return lhs_kept;
    }

    match (lhs.contains(ALL_LABELS), rhs.contains(ALL_LABELS)) {
        (true, true) => FieldSet::new(),
        (true, false) => rhs,
        (false, true) => lhs,
        (false, false) if lhs == rhs => lhs,
        (false, false) => FieldSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::promql::ast::{BinaryOp, VectorMatching, VectorSelector};
    use crate::query::promql::labels::Labels;
    use crate::query::promql::leaf::InMemoryLeafNodes;
    use crate::query::promql::value::Point;

    fn leaf() -> InMemoryLeafNodes {
        InMemoryLeafNodes::new(300_000)
            .with_series(
                Labels::from_pairs([("__name__", "cpu"), ("host", "a"), ("dc", "x")]),
                vec![Point::new(0, 1.0)],
            )
            .with_series(
                Labels::from_pairs([("__name__", "cpu"), ("host", "b"), ("dc", "y")]),
                vec![Point::new(0, 2.0)],
            )
            .with_series(
                Labels::from_pairs([("__name__", "mem"), ("host", "a"), ("rack", "r1")]),
                vec![Point::new(0, 3.0)],
            )
    }

    fn set(names: &[&str]) -> FieldSet {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn cpu() -> Expr {
        Expr::selector(VectorSelector::metric("cpu"))
    }

    fn mem() -> Expr {
        Expr::selector(VectorSelector::metric("mem"))
    }

    fn str_arg(s: &str) -> Expr {
        Expr::StringLiteral(s.to_string())
    }

    async fn labels_of(expr: &Expr) -> Result<FieldSet, QueryError> {
        let leaf = leaf();
        let functions = FunctionRegistry::default();
        let introspector = Introspector::new(&leaf, &functions);
        introspector.labels(expr, &Query::instant("q", 0)).await
    }

    async fn fields_of(expr: &Expr, field: &str) -> Result<FieldSet, QueryError> {
        let leaf = leaf();
        let functions = FunctionRegistry::default();
        let introspector = Introspector::new(&leaf, &functions);
        introspector.fields(expr, &Query::instant("q", 0), field).await
    }

    #[tokio::test]
    async fn test_fields_of_binary_and_range_call() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::call("rate", vec![Expr::matrix(VectorSelector::metric("cpu"), 60_000)]),
            mem(),
        );
        assert_eq!(
            fields_of(&expr, "").await.unwrap(),
            set(&["__name__", "dc", "host", "rack"])
        );
        assert_eq!(fields_of(&expr, "host").await.unwrap(), set(&["a", "b"]));
        assert!(fields_of(&Expr::NumberLiteral(1.0), "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fields_reject_unknown_function() {
        let err = fields_of(&Expr::call("nope", vec![cpu()]), "").await.unwrap_err();
        assert_eq!(err.message(), "'nope' is not currently supported");
    }

    #[tokio::test]
    async fn test_aggregate_labels() {
        let by = Expr::aggregate(AggregateOp::Sum, cpu(), &["host", "missing"], false);
        assert_eq!(labels_of(&by).await.unwrap(), set(&["host"]));

        let without = Expr::aggregate(AggregateOp::Sum, cpu(), &["host"], true);
        assert_eq!(labels_of(&without).await.unwrap(), set(&["__name__", "dc"]));

        let topk = Expr::aggregate_with_param(AggregateOp::Topk, Expr::NumberLiteral(1.0), cpu());
        assert_eq!(
            labels_of(&topk).await.unwrap(),
            set(&["__name__", "dc", "host"])
        );
    }

    #[tokio::test]
    async fn test_function_labels() {
        let replace = Expr::call(
            "label_replace",
            vec![cpu(), str_arg("zone"), str_arg("$1"), str_arg("dc"), str_arg("(.*)")],
        );
        assert_eq!(
            labels_of(&replace).await.unwrap(),
            set(&["__name__", "dc", "host", "zone"])
        );

        let dict_labels = Expr::call(
            "dict_labels",
            vec![cpu(), str_arg("hosts"), str_arg("ip"), str_arg("host"), str_arg("db"), str_arg("database")],
        );
        assert_eq!(
            labels_of(&dict_labels).await.unwrap(),
            set(&["__name__", "database", "dc", "host"])
        );

        let dict_values = Expr::call(
            "dict_values",
            vec![str_arg("hosts"), str_arg("capacity"), str_arg("db"), str_arg("database")],
        );
        assert_eq!(labels_of(&dict_values).await.unwrap(), set(&["database"]));
    }

    #[tokio::test]
    async fn test_binary_labels() {
        let on = Expr::binary_with(
            BinaryOp::Div,
            cpu(),
            mem(),
            VectorMatching::on(&["host"]),
            false,
        );
        assert_eq!(labels_of(&on).await.unwrap(), set(&["host"]));

        let on_missing = Expr::binary_with(
            BinaryOp::Div,
            cpu(),
            mem(),
            VectorMatching::on(&["dc"]),
            false,
        );
        assert!(labels_of(&on_missing).await.unwrap().is_empty());

        let ignoring = Expr::binary_with(
            BinaryOp::Div,
            cpu(),
            mem(),
            VectorMatching::ignoring(&["dc", "rack"]),
            false,
        );
        assert_eq!(labels_of(&ignoring).await.unwrap(), set(&["__name__", "host"]));

        let mismatched = Expr::binary(BinaryOp::Add, cpu(), mem());
        assert!(labels_of(&mismatched).await.unwrap().is_empty());

        let scaled = Expr::binary(BinaryOp::Mul, cpu(), Expr::NumberLiteral(2.0));
        assert_eq!(
            labels_of(&scaled).await.unwrap(),
            set(&["__name__", "dc", "host"])
        );

        let scalars = Expr::binary(
            BinaryOp::Mul,
            Expr::NumberLiteral(1.0),
            Expr::NumberLiteral(2.0),
        );
        assert!(labels_of(&scalars).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_labels() {
        let left_join = Expr::binary_with(
            BinaryOp::Add,
            cpu(),
            mem(),
            VectorMatching::on(&["host"])
                .with_card(MatchCardinality::LeftJoin)
                .with_include(&["rack", "missing"]),
            false,
        );
        assert_eq!(
            labels_of(&left_join).await.unwrap(),
            set(&["__name__", "dc", "host", "rack"])
        );

        let mut matching = VectorMatching::on(&["host", "zone"]).with_card(MatchCardinality::OutJoin);
        matching.include_left = vec!["dc".to_string()];
        matching.include_right = vec!["dc".to_string(), "rack".to_string()];
        let out_join = Expr::binary_with(BinaryOp::Add, cpu(), mem(), matching, false);
        assert_eq!(
            labels_of(&out_join).await.unwrap(),
            set(&["dc", "host", "rack"])
        );
    }

    #[tokio::test]
    async fn test_join_cardinality_takes_precedence_over_on() {
        let plain_on = Expr::binary_with(
            BinaryOp::Add,
            cpu(),
            mem(),
            VectorMatching::on(&["host"]),
            false,
        );
        assert_eq!(labels_of(&plain_on).await.unwrap(), set(&["host"]));

        let left_join = Expr::binary_with(
            BinaryOp::Add,
            cpu(),
            mem(),
            VectorMatching::on(&["host"]).with_card(MatchCardinality::LeftJoin),
            false,
        );
        assert_eq!(
            labels_of(&left_join).await.unwrap(),
            set(&["__name__", "dc", "host"])
        );

        let mut matching = VectorMatching::on(&["host"]).with_card(MatchCardinality::OutJoin);
        matching.include_right = vec!["rack".to_string()];
        let out_join = Expr::binary_with(BinaryOp::Add, cpu(), mem(), matching, false);
        assert_eq!(labels_of(&out_join).await.unwrap(), set(&["host", "rack"]));
    }

    #[tokio::test]
    async fn test_literals_do_not_restrict_labels() {
        assert_eq!(
            labels_of(&Expr::NumberLiteral(1.0)).await.unwrap(),
            set(&[ALL_LABELS])
        );
        assert!(labels_of(&str_arg("x")).await.is_err());
    }
}
