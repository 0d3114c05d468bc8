use docsql_dialect::{Dialect, RegistryError};
use docsql_ir::ParseError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TranslateError {
    #[error("operator {operator} is not supported by the {dialect} dialect")]
    UnsupportedOperator { dialect: Dialect, operator: String },

    #[error("stage {stage} is not supported by the {dialect} dialect")]
    UnsupportedStage { dialect: Dialect, stage: String },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl TranslateError {
    /// Unknown stage and operator names are reported against the active dialect
    pub(crate) fn from_parse(dialect: Dialect, err: ParseError) -> Self {
        match err {
            ParseError::UnknownStage(stage) => TranslateError::UnsupportedStage { dialect, stage },
            ParseError::UnknownOperator(operator) => {
                TranslateError::UnsupportedOperator { dialect, operator }
            }
            other => TranslateError::Parse(other),
        }
    }
}

impl From<RegistryError> for TranslateError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Unsupported { dialect, operator } => {
                TranslateError::UnsupportedOperator { dialect, operator }
            }
        }
    }
}
