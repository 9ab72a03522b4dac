pub mod error;
pub mod promql;
