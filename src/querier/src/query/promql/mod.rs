//! PromQL evaluation over a search-index backend
//!
//! This module answers instant and range PromQL queries against series that
//! live in a paginated search index rather than a native TSDB. Parsing and
//! raw data access are collaborators behind traits; the evaluator in
//! between reproduces PromQL semantics step by step.
//!
//! # Architecture
//!
//! ```text
//! query string → QueryParser → Expr → preprocess → Evaluator → Value → QueryResponse
//!                                                      │
//!                      LeafNodes / MetricModelService / DataDictionaries
//! ```
//!
//! Every vector-producing node evaluates its children once into matrices and
//! then walks the aligned step timestamps (see [`query::Query::step_times`]),
//! producing one output vector per step.
//!
//! # Modules
//!
//! - [`ast`] - typed expression tree and step-invariant preprocessing
//! - [`parser`] - adapter over the promql-parser crate
//! - [`query`] - evaluation context and time-bucket alignment
//! - [`labels`] - label sets and matchers
//! - [`value`] - points, series, matrices and pages
//! - [`leaf`] - storage boundary plus an in-memory implementation
//! - [`metric_model`] / [`data_dict`] - external collaborators of domain functions
//! - [`eval`] - the evaluator, function registry and introspection walks
//! - [`service`] - public entry points
//! - [`response`] - Prometheus-style JSON envelope
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use querier::query::promql::{leaf::InMemoryLeafNodes, query::Query, service::PromqlService};
//!
//! let service = PromqlService::new(Arc::new(InMemoryLeafNodes::new(300_000)));
//! let response = service.exec(Query::range("sum by (host) (cpu)", 0, 600_000, 60_000)).await?;
//! ```
//!
//! # Supported Features
//!
//! ## Selectors
//! - Instant and range vector selectors with `=`, `!=`, `=~`, `!~`
//! - `offset` and `@` modifiers, including `@ start()` / `@ end()`
//!
//! ## Operators
//! - Arithmetic, comparison (with `bool`) and set operators
//! - `on` / `ignoring` with `group_left` / `group_right`
//! - `left_join` / `out_join` matching extensions
//!
//! ## Aggregations
//! - `sum`, `avg`, `min`, `max`, `count`, `topk`, `bottomk` with `by` / `without`
//!
//! ## Functions
//! - Range functions delegated to the leaf layer: `rate`, `increase`,
//!   `irate`, `delta`, `changes`, `*_over_time`
//! - Per-step functions: math, `time`, `sort`, label rewriting,
//!   `histogram_quantile`, ranking, clamping, dictionary lookups
//! - Domain functions: `cumulative_sum`, `continuous_k_minute_downtime`,
//!   `metric_model`

pub mod ast;
pub mod data_dict;
pub mod eval;
pub mod labels;
pub mod leaf;
pub mod metric_model;
pub mod parser;
pub mod query;
pub mod response;
pub mod service;
pub mod value;

pub use service::{EngineSettings, ExecResponse, PromqlService, SeriesRequest};
