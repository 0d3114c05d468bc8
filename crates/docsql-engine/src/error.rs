use docsql_ir::MarkerError;
use docsql_translate::TranslateError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error("$function requires worker_loaders binding")]
    MissingSandboxBinding,

    #[error("$function batch execution failed: {0}")]
    BatchExecutionFailed(String),

    #[error("malformed function marker: {0}")]
    MalformedFunctionMarker(String),

    #[error("SQL execution failed: {0}")]
    Sql(String),

    #[error("row {index} does not hold a JSON document: {source}")]
    RowDecode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<MarkerError> for ExecuteError {
    fn from(err: MarkerError) -> Self {
        ExecuteError::MalformedFunctionMarker(err.to_string())
    }
}
