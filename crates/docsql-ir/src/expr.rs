//! Aggregation expressions and field paths

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::ParseError;

/// Dot-notation path into a document (`items.price`)
///
/// Segments are validated on construction: they end up inside SQL JSON-path
/// string literals, so quotes, backslashes, `?` and control characters are
/// rejected rather than escaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, ParseError> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| !valid_segment(s)) {
            return Err(ParseError::InvalidFieldPath(path.to_string()));
        }
        Ok(Self(segments))
    }

    pub fn from_segments(segments: Vec<String>) -> Result<Self, ParseError> {
        if segments.is_empty() || segments.iter().any(|s| !valid_segment(s)) {
            return Err(ParseError::InvalidFieldPath(segments.join(".")));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn dotted(&self) -> String {
        self.0.join(".")
    }

    pub fn first(&self) -> &str {
        &self.0[0]
    }

    pub fn is_id(&self) -> bool {
        self.0.len() == 1 && self.0[0] == "_id"
    }

    /// True if `prefix` equals this path or is one of its ancestors
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Remaining segments after `prefix`; `None` if `prefix` does not match
    pub fn strip_prefix(&self, prefix: &FieldPath) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }

    pub fn child(&self, segment: &str) -> Result<Self, ParseError> {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self::from_segments(segments)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('$')
        && !segment
            .chars()
            .any(|c| matches!(c, '\'' | '"' | '\\' | '?' | '`') || c.is_control())
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.dotted())
    }
}

/// Expression types
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expression {
    /// `"$a.b"`
    FieldRef(FieldPath),
    /// `"$$name"` or `"$$name.a.b"`
    Variable {
        name: String,
        path: Option<FieldPath>,
    },
    Literal(Value),
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
    Operator {
        op: ExprOp,
        args: Vec<Expression>,
    },
    Cond {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    Switch {
        branches: Vec<(Expression, Expression)>,
        default: Option<Box<Expression>>,
    },
    Filter {
        input: Box<Expression>,
        var: String,
        cond: Box<Expression>,
    },
    Map {
        input: Box<Expression>,
        var: String,
        expr: Box<Expression>,
    },
    Reduce {
        input: Box<Expression>,
        initial: Box<Expression>,
        expr: Box<Expression>,
    },
    DateToString {
        date: Box<Expression>,
        format: String,
    },
    Function(FunctionCall),
}

impl Expression {
    pub fn null() -> Self {
        Expression::Literal(Value::Null)
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(self, Expression::Literal(Value::Null))
    }

    /// True if a `$function` call appears anywhere inside this expression
    pub fn contains_function(&self) -> bool {
        match self {
            Expression::Function(_) => true,
            Expression::FieldRef(_) | Expression::Variable { .. } | Expression::Literal(_) => false,
            Expression::Array(items) => items.iter().any(Expression::contains_function),
            Expression::Object(fields) => fields.iter().any(|(_, e)| e.contains_function()),
            Expression::Operator { args, .. } => args.iter().any(Expression::contains_function),
            Expression::Cond { condition, then, otherwise } => {
                condition.contains_function() || then.contains_function() || otherwise.contains_function()
            }
            Expression::Switch { branches, default } => {
                branches
                    .iter()
                    .any(|(c, t)| c.contains_function() || t.contains_function())
                    || default.as_ref().map_or(false, |d| d.contains_function())
            }
            Expression::Filter { input, cond, .. } => input.contains_function() || cond.contains_function(),
            Expression::Map { input, expr, .. } => input.contains_function() || expr.contains_function(),
            Expression::Reduce { input, initial, expr } => {
                input.contains_function() || initial.contains_function() || expr.contains_function()
            }
            Expression::DateToString { date, .. } => date.contains_function(),
        }
    }
}

/// User-defined function call (`$function`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCall {
    pub body: String,
    pub args: Vec<Expression>,
    pub lang: String,
}

/// Positional expression operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExprOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
    Abs,
    Ceil,
    Floor,
    Round,
    Trunc,
    Sqrt,
    Pow,
    // Comparison
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    // Logical
    And,
    Or,
    Not,
    // Conditional
    IfNull,
    // String
    Concat,
    ToUpper,
    ToLower,
    Substr,
    StrLen,
    Trim,
    Split,
    RegexMatch,
    // Conversion
    ToInt,
    ToLong,
    ToDouble,
    ToDecimal,
    ToString,
    ToBool,
    // Date
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
    DayOfWeek,
    DayOfYear,
    DateFromString,
    DateDiff,
    DateAdd,
    DateSubtract,
    // Array
    Size,
    ArrayElemAt,
    First,
    Last,
    ConcatArrays,
    Slice,
    In,
    IsArray,
}

impl ExprOp {
    pub fn from_name(name: &str) -> Option<Self> {
        use ExprOp::*;
        Some(match name {
            "$add" => Add,
            "$subtract" => Subtract,
            "$multiply" => Multiply,
            "$divide" => Divide,
            "$mod" => Mod,
            "$abs" => Abs,
            "$ceil" => Ceil,
            "$floor" => Floor,
            "$round" => Round,
            "$trunc" => Trunc,
            "$sqrt" => Sqrt,
            "$pow" => Pow,
            "$eq" => Eq,
            "$ne" => Ne,
            "$gt" => Gt,
            "$gte" => Gte,
            "$lt" => Lt,
            "$lte" => Lte,
            "$cmp" => Cmp,
            "$and" => And,
            "$or" => Or,
            "$not" => Not,
            "$ifNull" => IfNull,
            "$concat" => Concat,
            "$toUpper" => ToUpper,
            "$toLower" => ToLower,
            "$substr" | "$substrCP" | "$substrBytes" => Substr,
            "$strLenCP" | "$strLenBytes" => StrLen,
            "$trim" => Trim,
            "$split" => Split,
            "$regexMatch" => RegexMatch,
            "$toInt" => ToInt,
            "$toLong" => ToLong,
            "$toDouble" => ToDouble,
            "$toDecimal" => ToDecimal,
            "$toString" => ToString,
            "$toBool" => ToBool,
            "$year" => Year,
            "$month" => Month,
            "$dayOfMonth" => DayOfMonth,
            "$hour" => Hour,
            "$minute" => Minute,
            "$second" => Second,
            "$dayOfWeek" => DayOfWeek,
            "$dayOfYear" => DayOfYear,
            "$dateFromString" => DateFromString,
            "$dateDiff" => DateDiff,
            "$dateAdd" => DateAdd,
            "$dateSubtract" => DateSubtract,
            "$size" => Size,
            "$arrayElemAt" => ArrayElemAt,
            "$first" => First,
            "$last" => Last,
            "$concatArrays" => ConcatArrays,
            "$slice" => Slice,
            "$in" => In,
            "$isArray" => IsArray,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        use ExprOp::*;
        match self {
            Add => "$add",
            Subtract => "$subtract",
            Multiply => "$multiply",
            Divide => "$divide",
            Mod => "$mod",
            Abs => "$abs",
            Ceil => "$ceil",
            Floor => "$floor",
            Round => "$round",
            Trunc => "$trunc",
            Sqrt => "$sqrt",
            Pow => "$pow",
            Eq => "$eq",
            Ne => "$ne",
            Gt => "$gt",
            Gte => "$gte",
            Lt => "$lt",
            Lte => "$lte",
            Cmp => "$cmp",
            And => "$and",
            Or => "$or",
            Not => "$not",
            IfNull => "$ifNull",
            Concat => "$concat",
            ToUpper => "$toUpper",
            ToLower => "$toLower",
            Substr => "$substr",
            StrLen => "$strLenCP",
            Trim => "$trim",
            Split => "$split",
            RegexMatch => "$regexMatch",
            ToInt => "$toInt",
            ToLong => "$toLong",
            ToDouble => "$toDouble",
            ToDecimal => "$toDecimal",
            ToString => "$toString",
            ToBool => "$toBool",
            Year => "$year",
            Month => "$month",
            DayOfMonth => "$dayOfMonth",
            Hour => "$hour",
            Minute => "$minute",
            Second => "$second",
            DayOfWeek => "$dayOfWeek",
            DayOfYear => "$dayOfYear",
            DateFromString => "$dateFromString",
            DateDiff => "$dateDiff",
            DateAdd => "$dateAdd",
            DateSubtract => "$dateSubtract",
            Size => "$size",
            ArrayElemAt => "$arrayElemAt",
            First => "$first",
            Last => "$last",
            ConcatArrays => "$concatArrays",
            Slice => "$slice",
            In => "$in",
            IsArray => "$isArray",
        }
    }

    /// Accepted operand count as `(min, max)`; `None` means variadic
    pub fn arity(&self) -> (usize, Option<usize>) {
        use ExprOp::*;
        match self {
            Add | Multiply | And | Or | Concat | ConcatArrays => (0, None),
            IfNull => (2, None),
            Subtract | Divide | Mod | Pow | Eq | Ne | Gt | Gte | Lt | Lte | Cmp | Split
            | ArrayElemAt | In => (2, Some(2)),
            Round | Trunc => (1, Some(2)),
            Slice => (2, Some(3)),
            Substr | RegexMatch | DateDiff | DateAdd | DateSubtract => (3, Some(3)),
            Abs | Ceil | Floor | Sqrt | Not | ToUpper | ToLower | StrLen | Trim | ToInt
            | ToLong | ToDouble | ToDecimal | ToString | ToBool | Year | Month | DayOfMonth
            | Hour | Minute | Second | DayOfWeek | DayOfYear | DateFromString | Size | First
            | Last | IsArray => (1, Some(1)),
        }
    }
}

impl fmt::Display for ExprOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
