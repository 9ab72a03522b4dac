//! PromQL query engine over a search-index backend.

pub mod query;

pub use query::error::{ErrorKind, QueryError};
pub use query::promql::{EngineSettings, ExecResponse, PromqlService, SeriesRequest};
