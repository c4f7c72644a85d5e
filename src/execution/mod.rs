//! Execution Module - lakehouse transport, result model and the query executor

pub mod executor;
pub mod lakehouse;
pub mod result;

pub use executor::QueryExecutor;
pub use lakehouse::{HttpLakehouse, Lakehouse, LakehousePayload, Pagination, TransportError};
pub use result::{QueryResult, ResultStatus};
