//! SQL execution collaborator
//!
//! The engine does not own connections. The host passes in something that
//! runs one parameterized statement and hands back rows whose `data` column
//! holds the serialized document.

use async_trait::async_trait;
use docsql_dialect::SqlParam;

use crate::ExecuteError;

/// One result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Serialized JSON document
    pub data: String,
    pub id: Option<String>,
}

impl Row {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Rows still held by the backend
#[async_trait]
pub trait RowCursor: Send {
    async fn to_array(self: Box<Self>) -> Result<Vec<Row>, ExecuteError>;
}

/// Either shape a backend may answer with
pub enum SqlResult {
    Results(Vec<Row>),
    Cursor(Box<dyn RowCursor>),
}

impl SqlResult {
    pub async fn into_rows(self) -> Result<Vec<Row>, ExecuteError> {
        match self {
            SqlResult::Results(rows) => Ok(rows),
            SqlResult::Cursor(cursor) => cursor.to_array().await,
        }
    }
}

impl From<Vec<Row>> for SqlResult {
    fn from(rows: Vec<Row>) -> Self {
        SqlResult::Results(rows)
    }
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run `sql` with `params` bound in placeholder order
    async fn exec(&self, sql: &str, params: &[SqlParam]) -> Result<SqlResult, ExecuteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecCursor(Vec<Row>);

    #[async_trait]
    impl RowCursor for VecCursor {
        async fn to_array(self: Box<Self>) -> Result<Vec<Row>, ExecuteError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_both_result_shapes() {
        let rows = vec![Row::new(r#"{"a":1}"#).with_id("1"), Row::new("{}")];

        let direct = SqlResult::from(rows.clone()).into_rows().await.unwrap();
        assert_eq!(direct, rows);

        let cursor = SqlResult::Cursor(Box::new(VecCursor(rows.clone())));
        assert_eq!(cursor.into_rows().await.unwrap(), rows);
    }
}
