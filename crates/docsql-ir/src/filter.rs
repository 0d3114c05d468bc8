//! Query filter documents (`find` filters and `$match` bodies)

use serde::Serialize;
use serde_json::Value;

use crate::{BsonType, Expression, FieldPath};

/// A filter document: all clauses must hold
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

impl Filter {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    /// `{}` matches every document
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Conjunction of two filters
    pub fn and(mut self, other: Filter) -> Filter {
        self.clauses.extend(other.clauses);
        self
    }

    /// Field paths referenced by this filter, in order of appearance
    pub fn referenced_paths(&self) -> Vec<&FieldPath> {
        let mut paths = Vec::new();
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, .. } => paths.push(path),
                Clause::And(filters) | Clause::Or(filters) | Clause::Nor(filters) => {
                    for filter in filters {
                        paths.extend(filter.referenced_paths());
                    }
                }
                Clause::Expr(_) => {}
            }
        }
        paths
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Clause {
    Field {
        path: FieldPath,
        predicates: Vec<Predicate>,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    /// `$expr` - an aggregation expression evaluated per document
    Expr(Expression),
}

/// Field-level query operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex { pattern: String, options: String },
    Type(Vec<BsonType>),
    Size(u64),
    Not(Vec<Predicate>),
    All(Vec<Value>),
    ElemMatch(Box<ElemMatch>),
    Mod { divisor: i64, remainder: i64 },
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Eq(_) => "$eq",
            Predicate::Ne(_) => "$ne",
            Predicate::Gt(_) => "$gt",
            Predicate::Gte(_) => "$gte",
            Predicate::Lt(_) => "$lt",
            Predicate::Lte(_) => "$lte",
            Predicate::In(_) => "$in",
            Predicate::Nin(_) => "$nin",
            Predicate::Exists(_) => "$exists",
            Predicate::Regex { .. } => "$regex",
            Predicate::Type(_) => "$type",
            Predicate::Size(_) => "$size",
            Predicate::Not(_) => "$not",
            Predicate::All(_) => "$all",
            Predicate::ElemMatch(_) => "$elemMatch",
            Predicate::Mod { .. } => "$mod",
        }
    }
}

/// `$elemMatch` body: operators applied to scalar elements, or a filter
/// applied to embedded documents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ElemMatch {
    Scalar(Vec<Predicate>),
    Document(Filter),
}
