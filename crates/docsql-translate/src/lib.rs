//! docsql translators
//!
//! Turns filter documents and aggregation pipelines into parameterized SQL
//! for one dialect. The SQL text never contains user values: everything the
//! caller supplied travels in [`TranslatedQuery::params`], in placeholder
//! order.

use docsql_dialect::{Fragment, ParamStyle, SqlParam};
use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod compiler;
mod error;
pub mod optimizer;
pub mod query;

pub use aggregate::AggregationTranslator;
pub use compiler::{Binding, Compiler, Resolved, Scope};
pub use error::TranslateError;
pub use optimizer::{OptimizationPass, Optimizer};
pub use query::QueryTranslator;

pub use docsql_dialect::Dialect;

/// SQL text plus its bound parameters
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TranslatedQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl TranslatedQuery {
    pub fn from_fragment(fragment: &Fragment, style: ParamStyle) -> Self {
        let (sql, params) = fragment.render(style);
        Self { sql, params }
    }

    /// Placeholders in `sql`; always equal to `params.len()`
    pub fn placeholder_count(&self) -> usize {
        count_placeholders(&self.sql)
    }
}

/// `?` and `{pN:Type}` placeholders outside string literals
fn count_placeholders(sql: &str) -> usize {
    let chars: Vec<char> = sql.chars().collect();
    let mut count = 0;
    let mut in_string = false;
    for (i, c) in chars.iter().enumerate() {
        match c {
            '\'' => in_string = !in_string,
            _ if in_string => {}
            '?' => count += 1,
            '{' if chars.get(i + 1) == Some(&'p') => {
                let digits = chars[i + 2..].iter().take_while(|c| c.is_ascii_digit()).count();
                if digits > 0 && chars.get(i + 2 + digits) == Some(&':') {
                    count += 1;
                }
            }
            _ => {}
        }
    }
    count
}

/// Result of translating an aggregation pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum TranslatedAggregate {
    Single(TranslatedQuery),
    /// One statement per `$facet` output field, in declaration order
    Facet(Vec<(String, TranslatedQuery)>),
}

impl TranslatedAggregate {
    pub fn queries(&self) -> Vec<&TranslatedQuery> {
        match self {
            TranslatedAggregate::Single(query) => vec![query],
            TranslatedAggregate::Facet(facets) => facets.iter().map(|(_, query)| query).collect(),
        }
    }
}

/// Table naming and parameter options for the aggregation translator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorOptions {
    /// Prepended to the collection name to form the backing table
    pub table_prefix: String,
    /// Column holding the JSON document
    pub document_column: String,
    /// ClickHouse only: emit `{pN:Type}` placeholders instead of `?`
    pub typed_params: bool,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            document_column: "data".to_string(),
            typed_params: false,
        }
    }
}
