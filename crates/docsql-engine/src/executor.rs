//! Aggregation Executor
//!
//! translate → run SQL → decode rows → resolve `$function` markers. Errors at
//! any step abort the whole call; no partial document list is returned.

use std::sync::Arc;

use docsql_translate::{AggregationTranslator, TranslatedAggregate, TranslatedQuery};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::functions::FunctionResolver;
use crate::sandbox::WorkerLoader;
use crate::sql::SqlExecutor;
use crate::ExecuteError;

/// Options of a `find` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    /// `$sort` document, e.g. `{"age": -1}`
    pub sort: Option<Value>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// `$project` document
    pub projection: Option<Value>,
}

impl FindOptions {
    /// Equivalent pipeline: match, then sort, skip, limit and projection
    pub fn pipeline(&self, filter: &Value) -> Value {
        let mut stages = vec![json!({ "$match": filter })];
        if let Some(sort) = &self.sort {
            stages.push(json!({ "$sort": sort }));
        }
        if let Some(skip) = self.skip.filter(|n| *n > 0) {
            stages.push(json!({ "$skip": skip }));
        }
        if let Some(limit) = self.limit.filter(|n| *n > 0) {
            stages.push(json!({ "$limit": limit }));
        }
        if let Some(projection) = &self.projection {
            stages.push(json!({ "$project": projection }));
        }
        Value::Array(stages)
    }
}

pub struct AggregationExecutor {
    config: EngineConfig,
    translator: AggregationTranslator,
    sql: Arc<dyn SqlExecutor>,
    loader: Option<Arc<dyn WorkerLoader>>,
}

impl AggregationExecutor {
    pub fn new(config: EngineConfig, sql: Arc<dyn SqlExecutor>) -> Self {
        let translator = AggregationTranslator::new(config.dialect, config.translator.clone());
        Self {
            config,
            translator,
            sql,
            loader: None,
        }
    }

    /// Sandbox used for `$function`; without one such pipelines fail
    pub fn with_worker_loader(mut self, loader: Arc<dyn WorkerLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn translator(&self) -> &AggregationTranslator {
        &self.translator
    }

    /// Run `pipeline` against `collection`, rows in SQL result order
    ///
    /// A trailing `$facet` yields a single document holding one array per
    /// facet.
    pub async fn execute(&self, collection: &str, pipeline: &Value) -> Result<Vec<Value>, ExecuteError> {
        let execution_id = Uuid::new_v4();
        info!("Executing aggregation {} on {}", execution_id, collection);

        match self.translator.translate(collection, pipeline)? {
            TranslatedAggregate::Single(query) => {
                let documents = self.run(&query).await?;
                info!("Aggregation {} returned {} document(s)", execution_id, documents.len());
                Ok(documents)
            }
            TranslatedAggregate::Facet(facets) => {
                let mut merged = Map::new();
                for (name, query) in facets {
                    let documents = self.run(&query).await?;
                    debug!("Facet {} returned {} document(s)", name, documents.len());
                    merged.insert(name, Value::Array(documents));
                }
                info!("Aggregation {} returned a faceted document", execution_id);
                Ok(vec![Value::Object(merged)])
            }
        }
    }

    /// `find` with the usual cursor options
    pub async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, ExecuteError> {
        self.execute(collection, &options.pipeline(filter)).await
    }

    async fn run(&self, query: &TranslatedQuery) -> Result<Vec<Value>, ExecuteError> {
        debug!("Executing SQL: {} [{} params]", query.sql, query.params.len());
        let rows = self.sql.exec(&query.sql, &query.params).await?.into_rows().await?;

        let mut documents = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                serde_json::from_str(&row.data).map_err(|source| ExecuteError::RowDecode { index, source })
            })
            .collect::<Result<Vec<Value>, _>>()?;

        FunctionResolver::new(self.loader.as_ref(), &self.config.sandbox)
            .resolve(&mut documents)
            .await?;
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_pipeline() {
        let options = FindOptions {
            sort: Some(json!({"age": -1})),
            skip: Some(5),
            limit: Some(10),
            projection: Some(json!({"name": 1})),
        };
        assert_eq!(
            options.pipeline(&json!({"active": true})),
            json!([
                {"$match": {"active": true}},
                {"$sort": {"age": -1}},
                {"$skip": 5},
                {"$limit": 10},
                {"$project": {"name": 1}}
            ])
        );
    }

    #[test]
    fn test_find_pipeline_ignores_zero_window() {
        let options = FindOptions {
            limit: Some(0),
            skip: Some(0),
            ..FindOptions::default()
        };
        assert_eq!(options.pipeline(&json!({})), json!([{"$match": {}}]));
    }
}
