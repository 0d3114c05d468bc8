//! Query Translator
//!
//! Filter document -> parameterized WHERE fragment over the `data` column.

use docsql_dialect::{Dialect, DialectProfile, OperatorRegistry, Source};
use docsql_ir::parse_filter;
use serde_json::Value;
use tracing::debug;

use crate::compiler::{Compiler, Scope};
use crate::{TranslateError, TranslatedQuery};

pub struct QueryTranslator {
    profile: Box<dyn DialectProfile>,
    registry: OperatorRegistry,
    column: String,
}

impl QueryTranslator {
    pub fn new(dialect: Dialect) -> Self {
        Self::with_profile(dialect.profile(false))
    }

    pub fn with_profile(profile: Box<dyn DialectProfile>) -> Self {
        Self {
            profile,
            registry: OperatorRegistry::default(),
            column: "data".to_string(),
        }
    }

    /// Qualify the document column (`t0.data`) when the WHERE clause is
    /// spliced into a statement with joins
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.profile.dialect()
    }

    /// WHERE-clause body for `filter`; an empty filter gives empty SQL
    pub fn translate(&self, filter: &Value) -> Result<TranslatedQuery, TranslateError> {
        let filter =
            parse_filter(filter).map_err(|err| TranslateError::from_parse(self.dialect(), err))?;
        if filter.is_empty() {
            return Ok(TranslatedQuery::default());
        }

        let compiler = Compiler::new(self.profile.as_ref(), &self.registry);
        let scope = Scope::new(Source::Column(self.column.clone()));
        let fragment = compiler.compile_filter(&filter, &scope)?;

        let query = TranslatedQuery::from_fragment(&fragment, self.profile.param_style());
        debug!(
            dialect = %self.dialect(),
            params = query.params.len(),
            sql = %query.sql,
            "Translated filter"
        );
        Ok(query)
    }
}

impl Default for QueryTranslator {
    fn default() -> Self {
        Self::new(Dialect::default())
    }
}
