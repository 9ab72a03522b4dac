//! End-to-end query scenarios through `PromqlService`.

use std::collections::BTreeSet;
use std::sync::Arc;

use http::StatusCode;
use ntest::timeout;
use querier::query::promql::ast::{Expr, VectorSelector};
use querier::query::promql::labels::Labels;
use querier::query::promql::leaf::{InMemoryLeafNodes, RawSeries};
use querier::query::promql::query::Query;
use querier::query::promql::value::Point;
use querier::{ErrorKind, PromqlService};
use serde_json::{Value, json};

const MIN: i64 = 60_000;

fn service(leaf: InMemoryLeafNodes) -> PromqlService {
    common::logging::init_test_logging();
    PromqlService::new(Arc::new(leaf))
}

fn leaf_with(series: &[(&[(&str, &str)], &[(i64, f64)])]) -> InMemoryLeafNodes {
    let mut leaf = InMemoryLeafNodes::new(5 * MIN);
    for (labels, points) in series {
        leaf.add_series(
            Labels::from_pairs(labels.iter().copied()),
            points.iter().map(|&(t, v)| Point::new(t, v)).collect(),
        );
    }
    leaf
}

fn fixture_service() -> PromqlService {
    let raw: Vec<RawSeries> =
        serde_json::from_str(include_str!("fixtures/cpu.json")).expect("fixture parses");
    service(InMemoryLeafNodes::from_raw(5 * MIN, raw))
}

async fn run(service: &PromqlService, query: Query) -> Value {
    let response = service.exec(query).await.expect("query succeeds");
    assert_eq!(response.status, StatusCode::OK);
    serde_json::from_slice(response.body.as_deref().expect("body")).expect("valid json")
}

fn result(body: &Value) -> &Vec<Value> {
    body["data"]["result"].as_array().expect("result array")
}

/// Values of every series of a matrix body keyed by their label set.
fn series_values(body: &Value) -> Vec<(Value, Vec<String>)> {
    let mut out: Vec<(Value, Vec<String>)> = result(body)
        .iter()
        .map(|s| {
            let values = s["values"]
                .as_array()
                .expect("values")
                .iter()
                .map(|pair| pair[1].as_str().expect("value string").to_string())
                .collect();
            (s["metric"].clone(), values)
        })
        .collect();
    out.sort_by_key(|(metric, _)| metric.to_string());
    out
}

#[tokio::test]
async fn instant_sum_of_two_series() {
    let leaf = leaf_with(&[
        (&[("__name__", "m"), ("l", "a"), ("id", "1")], &[(MIN, 20.0)]),
        (&[("__name__", "m"), ("l", "a"), ("id", "2")], &[(MIN, 1.0)]),
        (&[("__name__", "m"), ("l", "b"), ("id", "3")], &[(MIN, 100.0)]),
    ]);
    let body = run(&service(leaf), Query::instant(r#"sum(m{l="a"})"#, MIN)).await;
    assert_eq!(
        body,
        json!({
            "status": "success",
            "data": {"resultType": "vector", "result": [{"metric": {}, "value": [60.0, "21"]}]}
        })
    );
}

#[tokio::test]
async fn negation_of_range_selector() {
    let leaf = leaf_with(&[(
        &[("__name__", "m"), ("l", "a")],
        &[(MIN, 20.0), (2 * MIN, 10.0)],
    )]);
    let body = run(&service(leaf), Query::range(r#"-m{l="a"}"#, MIN, 2 * MIN, MIN)).await;
    assert_eq!(result(&body)[0]["values"], json!([[60.0, "-20"], [120.0, "-10"]]));
}

#[tokio::test]
async fn double_negation_restores_values() {
    let service = fixture_service();
    let plain = run(&service, Query::range("cpu", 0, 2 * MIN, MIN)).await;
    let twice = run(&service, Query::range("-(-cpu)", 0, 2 * MIN, MIN)).await;
    let plain: Vec<Vec<String>> = series_values(&plain).into_iter().map(|(_, v)| v).collect();
    let twice: Vec<Vec<String>> = series_values(&twice).into_iter().map(|(_, v)| v).collect();
    assert_eq!(plain, twice);
}

#[tokio::test]
async fn implicit_matching_only_pairs_identical_label_sets() {
    let leaf = leaf_with(&[
        (&[("__name__", "a"), ("x", "1"), ("y", "p")], &[(0, 5.0)]),
        (&[("__name__", "b"), ("x", "1"), ("y", "p")], &[(0, 2.0)]),
        (&[("__name__", "a"), ("x", "2"), ("y", "q")], &[(0, 5.0)]),
        (&[("__name__", "b"), ("x", "2"), ("y", "r")], &[(0, 2.0)]),
    ]);
    let body = run(&service(leaf), Query::instant("a - b", 0)).await;
    assert_eq!(
        result(&body),
        &vec![json!({"metric": {"__name__": "a", "x": "1", "y": "p"}, "value": [0.0, "3"]})]
    );
}

#[tokio::test]
async fn on_matching_with_duplicate_lhs_needs_group_left() {
    let leaf = leaf_with(&[
        (&[("__name__", "a"), ("index", "X"), ("pod", "1")], &[(0, 5.0)]),
        (&[("__name__", "a"), ("index", "X"), ("pod", "2")], &[(0, 6.0)]),
        (&[("__name__", "b"), ("index", "X")], &[(0, 2.0)]),
    ]);
    let err = service(leaf)
        .exec(Query::instant("a - on(index) b", 0))
        .await
        .unwrap_err();
    assert_eq!(
        err.message(),
        "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)"
    );
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn sum_by_and_without_complement_agree() {
    let service = fixture_service();
    let by = run(&service, Query::range("sum by (dc) (cpu)", 0, 2 * MIN, MIN)).await;
    let without = run(
        &service,
        Query::range("sum without (host) (cpu)", 0, 2 * MIN, MIN),
    )
    .await;
    assert_eq!(series_values(&by), series_values(&without));
    assert_eq!(
        series_values(&by),
        vec![
            (json!({"dc": "east"}), vec!["11".into(), "22".into(), "33".into()]),
            (json!({"dc": "west"}), vec!["5".into(), "0".into(), "7".into()]),
        ]
    );

    let count = run(&service, Query::instant("sum(count by (dc) (cpu))", MIN)).await;
    assert_eq!(result(&count)[0]["value"][1], "3");
}

#[tokio::test]
async fn topk_and_bottomk_partition_the_vector() {
    let service = fixture_service();
    let top = run(&service, Query::instant("topk(1, cpu)", 2 * MIN)).await;
    let bottom = run(&service, Query::instant("bottomk(2, cpu)", 2 * MIN)).await;

    let hosts = |body: &Value| -> BTreeSet<String> {
        result(body)
            .iter()
            .map(|s| s["metric"]["host"].as_str().expect("host").to_string())
            .collect()
    };
    let top = hosts(&top);
    let bottom = hosts(&bottom);
    assert_eq!(top, BTreeSet::from(["b".to_string()]));
    assert!(top.is_disjoint(&bottom));
    let all: BTreeSet<String> = top.union(&bottom).cloned().collect();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn topk_parameter_overflow() {
    let err = fixture_service()
        .exec(Query::instant("topk(9223372036854774785000, cpu)", MIN))
        .await
        .unwrap_err();
    assert!(err.message().contains("overflows int64"), "{}", err.message());
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

/// `cumulative_sum` is not part of the standard grammar, so the expression is
/// built directly.
async fn cumulative_sum_of(service: &PromqlService, metric: &str) -> Value {
    let expr = Expr::call("cumulative_sum", vec![Expr::selector(VectorSelector::metric(metric))]);
    let response = service
        .exec_expr(expr, Query::range(format!("cumulative_sum({metric})"), 0, 2 * MIN, MIN))
        .await
        .expect("query succeeds");
    serde_json::from_slice(response.body.as_deref().expect("body")).expect("valid json")
}

#[tokio::test]
#[timeout(5000)]
async fn cumulative_sum_is_monotonic_for_non_negative_input() {
    let service = service(leaf_with(&[
        (&[("__name__", "z")], &[(0, 0.0), (MIN, 0.0), (2 * MIN, 0.0)]),
        (&[("__name__", "n")], &[(0, 1.0), (MIN, 0.0), (2 * MIN, 4.0)]),
    ]));

    let zero = cumulative_sum_of(&service, "z").await;
    assert_eq!(result(&zero)[0]["values"], json!([[0.0, "0"], [60.0, "0"], [120.0, "0"]]));

    let sums = cumulative_sum_of(&service, "n").await;
    assert_eq!(result(&sums)[0]["values"], json!([[0.0, "1"], [60.0, "1"], [120.0, "5"]]));
}

#[tokio::test]
async fn labels_of_bare_selector() {
    let labels = fixture_service()
        .get_labels(Query::instant("cpu", MIN))
        .await
        .unwrap();
    assert_eq!(
        labels,
        BTreeSet::from(["__name__".to_string(), "dc".to_string(), "host".to_string()])
    );
}

#[tokio::test]
async fn sort_is_rejected_for_range_queries() {
    let err = fixture_service()
        .exec(Query::range("sort(cpu)", 0, MIN, MIN))
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(err.message(), "'sort' can not be used in the query_range requests");

    let body = run(&fixture_service(), Query::instant("sort_desc(cpu)", 2 * MIN)).await;
    let hosts: Vec<&str> = result(&body)
        .iter()
        .map(|s| s["metric"]["host"].as_str().expect("host"))
        .collect();
    assert_eq!(hosts, vec!["b", "c", "a"]);
}
