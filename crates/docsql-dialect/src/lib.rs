//! SQL dialect profiles
//!
//! A profile is the only place dialect syntax lives: the translators ask it
//! for every fragment of JSON access, function naming, aggregation, array
//! iteration and parameter style, and never hardcode SQL of their own.

use std::fmt;
use std::str::FromStr;

use docsql_ir::{AccumulatorOp, BsonType, ExprOp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod clickhouse;
mod fragment;
mod pattern;
mod registry;
mod sqlite;

pub use clickhouse::ClickHouseProfile;
pub use fragment::{quote_literal, Fragment, ParamStyle, SqlParam};
pub use pattern::{PatternPart, SimplePattern};
pub use registry::{OperatorRegistry, RegistryError};
pub use sqlite::SqliteProfile;

#[derive(Debug, Error, PartialEq)]
pub enum DialectError {
    #[error("invalid dialect '{0}': expected 'sqlite' or 'clickhouse'")]
    InvalidDialect(String),
}

/// Target SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Dialect {
    #[default]
    Sqlite,
    ClickHouse,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::ClickHouse => "clickhouse",
        }
    }

    /// Build the profile for this dialect. `typed_params` only affects
    /// ClickHouse; sqlite placeholders are always positional.
    pub fn profile(&self, typed_params: bool) -> Box<dyn DialectProfile> {
        match self {
            Dialect::Sqlite => Box::new(SqliteProfile::new()),
            Dialect::ClickHouse => Box::new(ClickHouseProfile::new(if typed_params {
                ParamStyle::Typed
            } else {
                ParamStyle::Positional
            })),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = DialectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Dialect::Sqlite),
            "clickhouse" => Ok(Dialect::ClickHouse),
            other => Err(DialectError::InvalidDialect(other.to_string())),
        }
    }
}

impl TryFrom<&str> for Dialect {
    type Error = DialectError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for Dialect {
    type Error = DialectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Dialect> for String {
    fn from(dialect: Dialect) -> Self {
        dialect.as_str().to_string()
    }
}

/// SQL-level type of a compiled value
///
/// `Json` is a value that can be embedded into a constructed JSON document
/// as-is. Extraction of any other kind converts the stored JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractKind {
    Json,
    Text,
    Number,
    Integer,
    Bool,
}

impl ExtractKind {
    /// Natural kind of a JSON literal
    pub fn of_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(_) => ExtractKind::Text,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => ExtractKind::Integer,
            serde_json::Value::Number(_) => ExtractKind::Number,
            serde_json::Value::Bool(_) => ExtractKind::Bool,
            _ => ExtractKind::Json,
        }
    }
}

/// Where a document lives in the statement being built
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Qualified text column holding a JSON document (`t."data"`, `s0.data`)
    Column(String),
    /// Array element bound by an unwind join or an array lambda
    Element(String),
    /// Any expression producing JSON text
    Json(Fragment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
    DayOfWeek,
    DayOfYear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl DateUnit {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "millisecond" => DateUnit::Millisecond,
            "second" => DateUnit::Second,
            "minute" => DateUnit::Minute,
            "hour" => DateUnit::Hour,
            "day" => DateUnit::Day,
            "week" => DateUnit::Week,
            "month" => DateUnit::Month,
            "quarter" => DateUnit::Quarter,
            "year" => DateUnit::Year,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DateUnit::Millisecond => "millisecond",
            DateUnit::Second => "second",
            DateUnit::Minute => "minute",
            DateUnit::Hour => "hour",
            DateUnit::Day => "day",
            DateUnit::Week => "week",
            DateUnit::Month => "month",
            DateUnit::Quarter => "quarter",
            DateUnit::Year => "year",
        }
    }
}

/// How `$lookup` joins the foreign collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Scalar subquery per row collecting matches into a JSON array
    CorrelatedSubquery,
    /// LEFT JOIN against the foreign table grouped by join key
    GroupedJoin,
}

/// Syntax strategy for one dialect
///
/// `path` arguments are validated field path segments. Fragments passed in
/// are already compiled to the kind each method documents.
pub trait DialectProfile: fmt::Debug + Send + Sync {
    fn dialect(&self) -> Dialect;

    fn param_style(&self) -> ParamStyle;

    /// True when extraction depends on the requested kind
    fn typed_extraction(&self) -> bool;

    fn quote_ident(&self, name: &str) -> String;

    /// Bind a value
    fn param(&self, value: SqlParam) -> Fragment;

    fn null(&self) -> Fragment {
        Fragment::raw("NULL")
    }

    fn bool_literal(&self, value: bool) -> Fragment;

    /// Bind a JSON literal as a `Json`-kind value
    fn json_literal(&self, value: &serde_json::Value) -> Fragment;

    // Document access

    /// Value at `path` as `kind`; missing and null give SQL NULL
    fn extract(&self, source: &Source, path: &[String], kind: ExtractKind) -> Fragment;

    /// True when `path` is present, including explicit null
    fn exists(&self, source: &Source, path: &[String]) -> Fragment;

    /// JSON type name at `path`, NULL when missing
    fn json_type(&self, source: &Source, path: &[String]) -> Fragment;

    /// Names `json_type` reports for a BSON type
    fn type_names(&self, ty: BsonType) -> &'static [&'static str];

    /// JSON text of the value at `path`
    fn json_text(&self, source: &Source, path: &[String]) -> Fragment;

    /// JSON text of a `Json`-kind value
    fn to_json_text(&self, value: Fragment) -> Fragment;

    fn coerce(&self, value: Fragment, from: ExtractKind, to: ExtractKind) -> Fragment;

    // Document construction (values are `Json` kind)

    fn build_object(&self, fields: Vec<(String, Fragment)>) -> Fragment;

    fn build_array(&self, items: Vec<Fragment>) -> Fragment;

    fn set_paths(&self, doc: Fragment, sets: Vec<(Vec<String>, Fragment)>) -> Fragment;

    /// `None` when the dialect cannot remove fields from a document
    fn remove_paths(&self, doc: Fragment, paths: &[Vec<String>]) -> Option<Fragment>;

    // Scalar functions

    fn if_null(&self, args: Vec<Fragment>) -> Fragment;

    /// Arithmetic, string and conversion operators; `None` if unsupported
    fn function(&self, op: ExprOp, args: Vec<Fragment>) -> Option<Fragment>;

    /// Pattern match with a LIKE-style pattern against `Text`
    fn like(&self, subject: Fragment, pattern: &SimplePattern, case_insensitive: bool) -> Fragment;

    /// Native regular expression; `None` if the dialect has none
    fn regex(&self, subject: Fragment, pattern: &str, flags: &str) -> Option<Fragment>;

    // Dates (ISO-8601 text in, `Text`/`Integer` out)

    fn date_part(&self, part: DatePart, date: Fragment) -> Fragment;

    /// `Err` names the format specifier the dialect cannot express
    fn date_format(&self, date: Fragment, format: &str) -> Result<Fragment, String>;

    fn date_parse(&self, text: Fragment) -> Fragment;

    fn date_diff(&self, start: Fragment, end: Fragment, unit: DateUnit) -> Fragment;

    fn date_add(&self, date: Fragment, unit: DateUnit, amount: Fragment) -> Fragment;

    // Arrays (inputs are JSON text, outputs `Json` kind unless noted)

    /// `Integer`
    fn array_length(&self, array: Fragment) -> Fragment;

    /// `index` is `Integer`, negative counts from the end
    fn array_element(&self, array: Fragment, index: Fragment) -> Fragment;

    fn array_concat(&self, arrays: Vec<Fragment>) -> Fragment;

    /// `$slice`: `count` elements from `position` (start when `None`)
    fn array_slice(&self, array: Fragment, position: Option<Fragment>, count: Fragment) -> Fragment;

    /// `Bool`; `value` is `Json` kind
    fn array_contains(&self, array: Fragment, value: Fragment) -> Fragment;

    /// `Bool`; `predicate` refers to the element as `Source::Element(alias)`
    fn array_any(&self, array: Fragment, alias: &str, predicate: Fragment) -> Fragment;

    fn array_filter(&self, array: Fragment, alias: &str, predicate: Fragment) -> Fragment;

    fn array_map(&self, array: Fragment, alias: &str, value: Fragment) -> Fragment;

    /// `None` if the dialect cannot fold arrays
    fn array_reduce(
        &self,
        array: Fragment,
        alias: &str,
        accumulator: &str,
        initial: Fragment,
        step: Fragment,
    ) -> Option<Fragment>;

    // Aggregation

    fn aggregate_arg_kind(&self, op: AccumulatorOp) -> ExtractKind;

    /// Aggregate call and its result kind; `None` if unsupported
    fn aggregate(&self, op: AccumulatorOp, arg: Fragment) -> Option<(Fragment, ExtractKind)>;

    /// Aggregate collecting JSON document text into a JSON array text
    fn collect_documents(&self, doc: Fragment) -> Fragment;

    fn count_all(&self) -> &'static str;

    /// A GROUP BY key as it appears in the grouped SELECT list
    fn group_key(&self, key: Fragment) -> Fragment {
        key
    }

    // Statement structure

    fn lookup_strategy(&self) -> LookupStrategy;

    /// Join clause iterating the array at `path`, binding elements to `alias`
    fn unwind_join(
        &self,
        source: &Source,
        path: &[String],
        alias: &str,
        preserve_empty: bool,
        with_index: bool,
    ) -> Fragment;

    /// `Integer` position of the current element of an unwind join
    fn unwind_index(&self, alias: &str) -> Fragment;

    fn random(&self) -> &'static str;

    fn order_term(&self, key: Fragment, descending: bool) -> Fragment {
        key.text(if descending { " DESC" } else { " ASC" })
    }

    /// JSON array text of documents collected by a `GroupedJoin` lookup,
    /// `[]` when the join found nothing
    fn joined_documents(&self, column: Fragment) -> Fragment {
        self.if_null(vec![column, self.build_array(Vec::new())])
    }

    fn limit_offset(&self, limit: Option<Fragment>, offset: Option<Fragment>) -> Fragment;

    /// Extraction kinds used as ORDER BY keys for one field, in order
    fn sort_kinds(&self) -> &'static [ExtractKind];
}
