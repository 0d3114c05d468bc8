//! docsql Intermediate Representation (IR)
//!
//! Typed form of MongoDB-style aggregation pipelines and query filters.
//! Pipelines arrive as JSON, are parsed once into these closed enums, and are
//! consumed by the translators. All types serialize deterministically so a
//! pipeline can be fingerprinted for log correlation.

use serde::Serialize;
use sha2::{Digest, Sha256};

mod expr;
mod filter;
mod marker;
mod parse;
mod types;

pub use expr::*;
pub use filter::*;
pub use marker::*;
pub use parse::{parse_expression, parse_filter, parse_pipeline, ParseError};
pub use types::*;

/// Aggregation pipeline - an ordered list of stages
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Parse a pipeline from its JSON form (an array of stage documents)
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ParseError> {
        parse_pipeline(value)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Calculate fingerprint (SHA-256) of the canonical serialization
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).expect("IR should always serialize");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Pipeline stages
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stage {
    Match(Filter),
    Project(Projection),
    /// `$addFields` and its alias `$set`
    AddFields(Vec<(FieldPath, Expression)>),
    Unset(Vec<FieldPath>),
    Group(Group),
    Sort(Vec<SortKey>),
    Limit(u64),
    Skip(u64),
    Lookup(Lookup),
    Unwind(Unwind),
    Count(String),
    Facet(Vec<(String, Pipeline)>),
    /// `$replaceRoot` and `$replaceWith`
    ReplaceRoot(Expression),
    Sample(u64),
}

impl Stage {
    /// Stage operator name as it appears in pipeline JSON
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unset(_) => "$unset",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::Count(_) => "$count",
            Stage::Facet(_) => "$facet",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::Sample(_) => "$sample",
        }
    }
}

/// `$project` specification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Projection {
    /// Inclusion mode: only the listed fields (plus `_id` unless suppressed)
    Include {
        fields: Vec<(FieldPath, ProjectField)>,
        include_id: bool,
    },
    /// Exclusion mode: everything except the listed fields
    Exclude { fields: Vec<FieldPath> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProjectField {
    Keep,
    Computed(Expression),
}

/// `$group` specification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    /// Grouping key; `Literal(null)` groups the whole input
    pub id: Expression,
    pub accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accumulator {
    pub op: AccumulatorOp,
    pub expr: Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccumulatorOp {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
    StdDevPop,
    StdDevSamp,
}

impl AccumulatorOp {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            "$count" => AccumulatorOp::Count,
            "$stdDevPop" => AccumulatorOp::StdDevPop,
            "$stdDevSamp" => AccumulatorOp::StdDevSamp,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccumulatorOp::Sum => "$sum",
            AccumulatorOp::Avg => "$avg",
            AccumulatorOp::Min => "$min",
            AccumulatorOp::Max => "$max",
            AccumulatorOp::First => "$first",
            AccumulatorOp::Last => "$last",
            AccumulatorOp::Push => "$push",
            AccumulatorOp::AddToSet => "$addToSet",
            AccumulatorOp::Count => "$count",
            AccumulatorOp::StdDevPop => "$stdDevPop",
            AccumulatorOp::StdDevSamp => "$stdDevSamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    pub path: FieldPath,
    pub descending: bool,
}

/// `$lookup` specification, equality form and/or pipeline form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lookup {
    pub from: String,
    pub local_field: Option<FieldPath>,
    pub foreign_field: Option<FieldPath>,
    pub let_vars: Vec<(String, Expression)>,
    pub pipeline: Option<Pipeline>,
    pub as_field: FieldPath,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unwind {
    pub path: FieldPath,
    pub include_array_index: Option<FieldPath>,
    pub preserve_null_and_empty_arrays: bool,
}
