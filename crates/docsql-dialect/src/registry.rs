//! Operator support registry
//!
//! Records, per dialect, the operators and stage forms that have no
//! translation. Translators consult it before compiling so gaps surface as
//! `UnsupportedOperator` at translate time.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::Dialect;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("operator {operator} is not supported by the {dialect} dialect")]
    Unsupported { dialect: Dialect, operator: String },
}

pub struct OperatorRegistry {
    unsupported: HashMap<Dialect, HashSet<&'static str>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            unsupported: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        // No native regex, statistics or array folding in sqlite's JSON1
        for operator in ["$stdDevPop", "$stdDevSamp", "$reduce", "$split"] {
            self.register_gap(Dialect::Sqlite, operator);
        }

        // Documents are plain JSON strings in ClickHouse: no key removal,
        // and no correlated subqueries for `let` bindings
        for operator in ["$unset", "$project:exclude", "$lookup:let"] {
            self.register_gap(Dialect::ClickHouse, operator);
        }
    }

    pub fn register_gap(&mut self, dialect: Dialect, operator: &'static str) {
        self.unsupported.entry(dialect).or_default().insert(operator);
    }

    pub fn supports(&self, dialect: Dialect, operator: &str) -> bool {
        self.unsupported
            .get(&dialect)
            .map_or(true, |gaps| !gaps.contains(operator))
    }

    pub fn check(&self, dialect: Dialect, operator: &str) -> Result<(), RegistryError> {
        if self.supports(dialect, operator) {
            Ok(())
        } else {
            Err(RegistryError::Unsupported {
                dialect,
                operator: operator.to_string(),
            })
        }
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
