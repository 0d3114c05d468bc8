//! docsql engine
//!
//! Executes aggregation pipelines through a host-provided SQL backend and
//! resolves `$function` calls through a host-provided sandbox.

pub mod config;
mod error;
pub mod executor;
pub mod functions;
pub mod logging;
pub mod sandbox;
pub mod sql;

pub use config::{ConfigError, EngineConfig, LoggingConfig, SandboxConfig};
pub use error::ExecuteError;
pub use executor::{AggregationExecutor, FindOptions};
pub use sandbox::{
    BatchRequest, BatchResponse, WorkerCode, WorkerEntrypoint, WorkerLoader, WorkerRequest,
    WorkerResponse, WorkerStub,
};
pub use sql::{Row, RowCursor, SqlExecutor, SqlResult};

pub use docsql_dialect::{Dialect, SqlParam};
pub use docsql_translate::TranslatorOptions;
