//! Function markers: the out-of-band channel for `$function`
//!
//! SQL cannot run user JavaScript, so the translator replaces each
//! `$function` call with a marker string bound into the projected JSON. The
//! executor finds these strings in result documents, runs the functions in
//! the sandbox in batches and splices the results back.
//!
//! Wire format: `__FUNCTION__` followed by the JSON of [`FunctionMarker`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{Expression, FunctionCall};

pub const FUNCTION_MARKER_PREFIX: &str = "__FUNCTION__";

#[derive(Debug, Error, PartialEq)]
pub enum MarkerError {
    #[error("$function argument {index} must be a field path or a constant")]
    UnsupportedArgument { index: usize },

    #[error("malformed function marker: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMarker {
    pub body: String,
    pub arg_paths: Vec<String>,
    /// Constant arguments keyed by their position in the call
    pub literal_args: BTreeMap<usize, Value>,
    pub arg_order: Vec<ArgBinding>,
}

/// Where one call argument comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArgBinding {
    /// Resolved against the owning document; empty path is the document itself
    Field { path: String },
    Literal { index: usize },
}

/// Batching identity: same body and same argument binding shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerSignature {
    pub body: String,
    pub arg_order: Vec<ArgBinding>,
}

impl FunctionMarker {
    pub fn from_call(call: &FunctionCall) -> Result<Self, MarkerError> {
        let mut marker = FunctionMarker {
            body: call.body.clone(),
            arg_paths: Vec::new(),
            literal_args: BTreeMap::new(),
            arg_order: Vec::with_capacity(call.args.len()),
        };

        for (index, arg) in call.args.iter().enumerate() {
            let path = match arg {
                Expression::FieldRef(path) => Some(path.dotted()),
                Expression::Variable { name, path } if name == "ROOT" || name == "CURRENT" => {
                    Some(path.as_ref().map(|p| p.dotted()).unwrap_or_default())
                }
                _ => None,
            };

            match path {
                Some(path) => {
                    marker.arg_paths.push(path.clone());
                    marker.arg_order.push(ArgBinding::Field { path });
                }
                None => {
                    let value = constant_value(arg)
                        .ok_or(MarkerError::UnsupportedArgument { index })?;
                    marker.literal_args.insert(index, value);
                    marker.arg_order.push(ArgBinding::Literal { index });
                }
            }
        }

        Ok(marker)
    }

    /// Serialize to the `__FUNCTION__<json>` wire form
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).expect("marker should always serialize");
        format!("{}{}", FUNCTION_MARKER_PREFIX, json)
    }

    pub fn is_marker(value: &str) -> bool {
        value.starts_with(FUNCTION_MARKER_PREFIX)
    }

    pub fn decode(value: &str) -> Result<Self, MarkerError> {
        let json = value
            .strip_prefix(FUNCTION_MARKER_PREFIX)
            .ok_or_else(|| MarkerError::Malformed("missing __FUNCTION__ prefix".to_string()))?;
        let marker: FunctionMarker =
            serde_json::from_str(json).map_err(|e| MarkerError::Malformed(e.to_string()))?;
        marker.validate()?;
        Ok(marker)
    }

    /// Check that `argOrder` accounts for every path and literal exactly once
    pub fn validate(&self) -> Result<(), MarkerError> {
        if self.arg_order.len() != self.arg_paths.len() + self.literal_args.len() {
            return Err(MarkerError::Malformed(format!(
                "argOrder has {} entries for {} paths and {} literals",
                self.arg_order.len(),
                self.arg_paths.len(),
                self.literal_args.len()
            )));
        }

        let mut paths = self.arg_paths.iter();
        for binding in &self.arg_order {
            match binding {
                ArgBinding::Field { path } => {
                    if paths.next() != Some(path) {
                        return Err(MarkerError::Malformed(format!(
                            "argOrder field '{}' does not match argPaths",
                            path
                        )));
                    }
                }
                ArgBinding::Literal { index } => {
                    if !self.literal_args.contains_key(index) {
                        return Err(MarkerError::Malformed(format!(
                            "argOrder references missing literal {}",
                            index
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn signature(&self) -> MarkerSignature {
        MarkerSignature {
            body: self.body.clone(),
            arg_order: self.arg_order.clone(),
        }
    }

    /// Build the call's argument list against `doc`, replaying `argOrder`
    pub fn resolve_args(&self, doc: &Value) -> Vec<Value> {
        self.arg_order
            .iter()
            .map(|binding| match binding {
                ArgBinding::Field { path } => resolve_path(doc, path),
                ArgBinding::Literal { index } => {
                    self.literal_args.get(index).cloned().unwrap_or(Value::Null)
                }
            })
            .collect()
    }
}

/// Dot-path lookup; anything missing along the way resolves to `null`
pub fn resolve_path(doc: &Value, path: &str) -> Value {
    if path.is_empty() {
        return doc.clone();
    }
    let mut current = doc;
    for part in path.split('.') {
        match current {
            Value::Object(map) => match map.get(part) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn constant_value(expr: &Expression) -> Option<Value> {
    match expr {
        Expression::Literal(value) => Some(value.clone()),
        Expression::Array(items) => items
            .iter()
            .map(constant_value)
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Expression::Object(fields) => {
            let mut map = serde_json::Map::new();
            for (key, value) in fields {
                map.insert(key.clone(), constant_value(value)?);
            }
            Some(Value::Object(map))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldPath;
    use serde_json::json;

    fn call(args: Vec<Expression>) -> FunctionCall {
        FunctionCall {
            body: "(x, m) => x * m".to_string(),
            args,
            lang: "js".to_string(),
        }
    }

    #[test]
    fn test_marker_wire_format() {
        let marker = FunctionMarker::from_call(&call(vec![
            Expression::FieldRef(FieldPath::parse("value").unwrap()),
            Expression::Literal(json!(10)),
        ]))
        .unwrap();

        let encoded = marker.encode();
        assert!(encoded.starts_with("__FUNCTION__{"));

        let wire: Value = serde_json::from_str(&encoded["__FUNCTION__".len()..]).unwrap();
        assert_eq!(wire["argPaths"], json!(["value"]));
        assert_eq!(wire["literalArgs"], json!({"1": 10}));
        assert_eq!(
            wire["argOrder"],
            json!([{"type": "field", "path": "value"}, {"type": "literal", "index": 1}])
        );

        assert_eq!(FunctionMarker::decode(&encoded).unwrap(), marker);
    }

    #[test]
    fn test_resolve_args_interleaves_in_order() {
        let marker = FunctionMarker::from_call(&call(vec![
            Expression::Literal(json!("prefix")),
            Expression::FieldRef(FieldPath::parse("a.b").unwrap()),
            Expression::Literal(json!([1, 2])),
            Expression::FieldRef(FieldPath::parse("missing.deep").unwrap()),
        ]))
        .unwrap();

        let doc = json!({"a": {"b": 7}});
        assert_eq!(
            marker.resolve_args(&doc),
            vec![json!("prefix"), json!(7), json!([1, 2]), Value::Null]
        );
    }

    #[test]
    fn test_decode_rejects_inconsistent_marker() {
        let bad = r#"__FUNCTION__{"body":"x=>x","argPaths":["a"],"literalArgs":{},"argOrder":[]}"#;
        assert!(matches!(FunctionMarker::decode(bad), Err(MarkerError::Malformed(_))));

        assert!(matches!(
            FunctionMarker::decode("__FUNCTION__not json"),
            Err(MarkerError::Malformed(_))
        ));
        assert!(FunctionMarker::decode("plain").is_err());
    }

    #[test]
    fn test_computed_argument_rejected() {
        let result = FunctionMarker::from_call(&call(vec![Expression::Operator {
            op: crate::ExprOp::Add,
            args: vec![],
        }]));
        assert_eq!(result, Err(MarkerError::UnsupportedArgument { index: 0 }));
    }
}
