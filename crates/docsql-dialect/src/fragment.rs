//! SQL fragments with inline bound parameters
//!
//! A fragment is a sequence of literal SQL text and parameter slots. Slots
//! are only numbered when the final statement is rendered, so fragments can
//! be compiled in any order and spliced together freely while the
//! placeholder list stays in text order.

use serde::Serialize;
use serde_json::Value;

/// Placeholder syntax for bound parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ParamStyle {
    /// `?`
    #[default]
    Positional,
    /// ClickHouse `{p1:Type}`
    Typed,
}

/// A bound parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Serialized JSON (objects and arrays)
    Json(String),
}

impl SqlParam {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Int(i),
                None => SqlParam::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Json(other.to_string()),
        }
    }

    /// ClickHouse type name used in typed placeholders
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlParam::Null => "Nullable(String)",
            SqlParam::Bool(_) => "Bool",
            SqlParam::Int(_) => "Int64",
            SqlParam::Float(_) => "Float64",
            SqlParam::Text(_) | SqlParam::Json(_) => "String",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Text(String),
    Param(SqlParam),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pieces: Vec<Piece>,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Literal SQL text. Never pass user values here.
    pub fn raw(sql: impl Into<String>) -> Self {
        let mut fragment = Self::new();
        fragment.push_str(&sql.into());
        fragment
    }

    pub fn param(value: SqlParam) -> Self {
        Self {
            pieces: vec![Piece::Param(value)],
        }
    }

    /// `name(arg1, arg2, ...)`
    pub fn call(name: &str, args: Vec<Fragment>) -> Self {
        Fragment::raw(format!("{}(", name))
            .append(Fragment::join(args, ", "))
            .text(")")
    }

    /// `(inner)`
    pub fn paren(inner: Fragment) -> Self {
        Fragment::raw("(").append(inner).text(")")
    }

    pub fn join(parts: impl IntoIterator<Item = Fragment>, separator: &str) -> Self {
        let mut joined = Fragment::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                joined.push_str(separator);
            }
            joined.push(part);
        }
        joined
    }

    pub fn push_str(&mut self, sql: &str) {
        if sql.is_empty() {
            return;
        }
        match self.pieces.last_mut() {
            Some(Piece::Text(text)) => text.push_str(sql),
            _ => self.pieces.push(Piece::Text(sql.to_string())),
        }
    }

    pub fn push(&mut self, other: Fragment) {
        for piece in other.pieces {
            match piece {
                Piece::Text(text) => self.push_str(&text),
                param => self.pieces.push(param),
            }
        }
    }

    pub fn text(mut self, sql: &str) -> Self {
        self.push_str(sql);
        self
    }

    pub fn append(mut self, other: Fragment) -> Self {
        self.push(other);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn params(&self) -> impl Iterator<Item = &SqlParam> {
        self.pieces.iter().filter_map(|piece| match piece {
            Piece::Param(p) => Some(p),
            Piece::Text(_) => None,
        })
    }

    /// Number parameter slots and produce the SQL text plus values in
    /// placeholder order
    pub fn render(&self, style: ParamStyle) -> (String, Vec<SqlParam>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => sql.push_str(text),
                Piece::Param(value) => {
                    params.push(value.clone());
                    match style {
                        ParamStyle::Positional => sql.push('?'),
                        ParamStyle::Typed => {
                            sql.push_str(&format!("{{p{}:{}}}", params.len(), value.type_name()))
                        }
                    }
                }
            }
        }
        (sql, params)
    }
}

/// Quote a string as a SQL string literal, doubling single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_positional() {
        let fragment = Fragment::raw("a = ")
            .append(Fragment::param(SqlParam::Int(1)))
            .text(" AND b IN (")
            .append(Fragment::join(
                vec![
                    Fragment::param(SqlParam::Text("x".to_string())),
                    Fragment::param(SqlParam::Text("y".to_string())),
                ],
                ", ",
            ))
            .text(")");

        let (sql, params) = fragment.render(ParamStyle::Positional);
        assert_eq!(sql, "a = ? AND b IN (?, ?)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_render_typed() {
        let fragment = Fragment::call(
            "f",
            vec![
                Fragment::param(SqlParam::Text("x".to_string())),
                Fragment::param(SqlParam::Float(1.5)),
                Fragment::param(SqlParam::Null),
            ],
        );

        let (sql, params) = fragment.render(ParamStyle::Typed);
        assert_eq!(sql, "f({p1:String}, {p2:Float64}, {p3:Nullable(String)})");
        assert_eq!(params, vec![SqlParam::Text("x".to_string()), SqlParam::Float(1.5), SqlParam::Null]);
    }

    #[test]
    fn test_params_follow_text_order() {
        let late = Fragment::param(SqlParam::Int(2));
        let early = Fragment::param(SqlParam::Int(1));
        let (_, params) = early.text(" < ").append(late).render(ParamStyle::Positional);
        assert_eq!(params, vec![SqlParam::Int(1), SqlParam::Int(2)]);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(SqlParam::from_json(&json!(3)), SqlParam::Int(3));
        assert_eq!(SqlParam::from_json(&json!(2.5)), SqlParam::Float(2.5));
        assert_eq!(SqlParam::from_json(&json!({"a": 1})), SqlParam::Json("{\"a\":1}".to_string()));
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
