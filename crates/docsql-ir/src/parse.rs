//! Convert pipeline and filter JSON into the typed IR
//!
//! Key order in stage documents is significant (`$sort`, `$project`,
//! compound `$group` keys), so this relies on serde_json preserving
//! insertion order.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    Accumulator, AccumulatorOp, BsonType, Clause, ElemMatch, ExprOp, Expression, FieldPath,
    Filter, FunctionCall, Group, Lookup, Pipeline, Predicate, ProjectField, Projection, SortKey,
    Stage, Unwind,
};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("pipeline must be an array of stage documents")]
    NotAnArray,

    #[error("a pipeline stage must be a document with exactly one field, got {0}")]
    MalformedStage(String),

    #[error("unrecognized pipeline stage name: {0}")]
    UnknownStage(String),

    #[error("invalid {stage} stage: {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("unrecognized operator: {0}")]
    UnknownOperator(String),

    #[error("invalid arguments for {op}: {reason}")]
    InvalidArguments { op: String, reason: String },

    #[error("invalid field path '{0}'")]
    InvalidFieldPath(String),

    #[error("invalid query filter: {0}")]
    InvalidFilter(String),

    #[error("unknown $type: {0}")]
    UnknownType(String),
}

fn invalid_stage(stage: &str, reason: impl Into<String>) -> ParseError {
    ParseError::InvalidStage {
        stage: stage.to_string(),
        reason: reason.into(),
    }
}

fn invalid_args(op: &str, reason: impl Into<String>) -> ParseError {
    ParseError::InvalidArguments {
        op: op.to_string(),
        reason: reason.into(),
    }
}

/// Parse a pipeline: a JSON array of single-field stage documents
pub fn parse_pipeline(value: &Value) -> Result<Pipeline, ParseError> {
    let stages = value.as_array().ok_or(ParseError::NotAnArray)?;
    let stages = stages.iter().map(parse_stage).collect::<Result<Vec<_>, _>>()?;
    Ok(Pipeline::new(stages))
}

fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

fn parse_stage(value: &Value) -> Result<Stage, ParseError> {
    let (name, body) =
        single_entry(value).ok_or_else(|| ParseError::MalformedStage(value.to_string()))?;

    match name {
        "$match" => Ok(Stage::Match(parse_filter(body)?)),
        "$project" => Ok(Stage::Project(parse_projection(body)?)),
        "$addFields" | "$set" => parse_add_fields(name, body),
        "$unset" => parse_unset(body),
        "$group" => parse_group(body),
        "$sort" => parse_sort(body),
        "$limit" => {
            let limit = non_negative(name, body)?;
            if limit == 0 {
                return Err(invalid_stage(name, "the limit must be positive"));
            }
            Ok(Stage::Limit(limit))
        }
        "$skip" => Ok(Stage::Skip(non_negative(name, body)?)),
        "$lookup" => parse_lookup(body),
        "$unwind" => parse_unwind(body),
        "$count" => parse_count(body),
        "$facet" => parse_facet(body),
        "$replaceRoot" => {
            let new_root = body
                .get("newRoot")
                .ok_or_else(|| invalid_stage(name, "missing 'newRoot'"))?;
            Ok(Stage::ReplaceRoot(parse_expression(new_root)?))
        }
        "$replaceWith" => Ok(Stage::ReplaceRoot(parse_expression(body)?)),
        "$sample" => {
            let size = body
                .get("size")
                .ok_or_else(|| invalid_stage(name, "missing 'size'"))?;
            Ok(Stage::Sample(non_negative(name, size)?))
        }
        other => Err(ParseError::UnknownStage(other.to_string())),
    }
}

fn non_negative(stage: &str, value: &Value) -> Result<u64, ParseError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
        _ => Err(invalid_stage(
            stage,
            format!("expected a non-negative integer, got {}", value),
        )),
    }
}

fn object<'a>(stage: &str, value: &'a Value) -> Result<&'a Map<String, Value>, ParseError> {
    value
        .as_object()
        .ok_or_else(|| invalid_stage(stage, "specification must be a document"))
}

/// A top-level output field name: one path segment
fn field_name(stage: &str, name: &str) -> Result<String, ParseError> {
    let path = FieldPath::parse(name)?;
    if path.segments().len() != 1 {
        return Err(invalid_stage(stage, format!("field name '{}' cannot contain '.'", name)));
    }
    Ok(name.to_string())
}

fn parse_projection(body: &Value) -> Result<Projection, ParseError> {
    let map = object("$project", body)?;
    if map.is_empty() {
        return Err(invalid_stage("$project", "specification must have at least one field"));
    }

    let mut entries = Vec::new();
    flatten_projection(String::new(), map, &mut entries);

    let mut include_id = true;
    let mut included = Vec::new();
    let mut excluded = Vec::new();

    for (key, value) in entries {
        let path = FieldPath::parse(&key)?;
        match projection_flag(value) {
            Some(true) => {
                if !path.is_id() {
                    included.push((path, ProjectField::Keep));
                }
            }
            Some(false) => {
                if path.is_id() {
                    include_id = false;
                } else {
                    excluded.push(path);
                }
            }
            None => {
                if path.is_id() {
                    include_id = false;
                }
                included.push((path, ProjectField::Computed(parse_expression(value)?)));
            }
        }
    }

    if !included.is_empty() && !excluded.is_empty() {
        return Err(invalid_stage(
            "$project",
            "cannot mix inclusion and exclusion of fields other than _id",
        ));
    }

    if !excluded.is_empty() || (included.is_empty() && !include_id) {
        if !include_id {
            excluded.insert(0, FieldPath::parse("_id")?);
        }
        return Ok(Projection::Exclude { fields: excluded });
    }

    Ok(Projection::Include {
        fields: included,
        include_id,
    })
}

/// `{a: {b: 1}}` is the same projection as `{"a.b": 1}`
fn flatten_projection<'a>(prefix: String, map: &'a Map<String, Value>, out: &mut Vec<(String, &'a Value)>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value.as_object() {
            Some(nested) if !nested.is_empty() && !nested.keys().any(|k| k.starts_with('$')) => {
                flatten_projection(path, nested, out)
            }
            _ => out.push((path, value)),
        }
    }
}

fn projection_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64() != Some(0.0)),
        _ => None,
    }
}

fn parse_add_fields(name: &str, body: &Value) -> Result<Stage, ParseError> {
    let map = object(name, body)?;
    let fields = map
        .iter()
        .map(|(key, value)| Ok((FieldPath::parse(key)?, parse_expression(value)?)))
        .collect::<Result<Vec<_>, ParseError>>()?;
    Ok(Stage::AddFields(fields))
}

fn parse_unset(body: &Value) -> Result<Stage, ParseError> {
    let names: Vec<&str> = match body {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().ok_or_else(|| invalid_stage("$unset", "field names must be strings")))
            .collect::<Result<_, _>>()?,
        _ => return Err(invalid_stage("$unset", "expected a field name or an array of names")),
    };
    let fields = names
        .into_iter()
        .map(FieldPath::parse)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage::Unset(fields))
}

fn parse_group(body: &Value) -> Result<Stage, ParseError> {
    let map = object("$group", body)?;
    let id = map
        .get("_id")
        .ok_or_else(|| invalid_stage("$group", "a group specification must include an _id"))?;

    let mut accumulators = Vec::new();
    for (key, value) in map {
        if key == "_id" {
            continue;
        }
        let name = field_name("$group", key)?;
        let (op_name, arg) = single_entry(value).ok_or_else(|| {
            invalid_stage("$group", format!("field '{}' must be an accumulator object", key))
        })?;
        let op = AccumulatorOp::from_name(op_name)
            .ok_or_else(|| ParseError::UnknownOperator(op_name.to_string()))?;
        let expr = match op {
            AccumulatorOp::Count => {
                if !arg.as_object().map_or(false, Map::is_empty) {
                    return Err(invalid_args("$count", "accumulator takes an empty document"));
                }
                Expression::null()
            }
            _ => parse_expression(arg)?,
        };
        accumulators.push((name, Accumulator { op, expr }));
    }

    Ok(Stage::Group(Group {
        id: parse_expression(id)?,
        accumulators,
    }))
}

fn parse_sort(body: &Value) -> Result<Stage, ParseError> {
    let map = object("$sort", body)?;
    if map.is_empty() {
        return Err(invalid_stage("$sort", "specification must have at least one key"));
    }
    let keys = map
        .iter()
        .map(|(key, value)| {
            let descending = match value.as_i64() {
                Some(1) => false,
                Some(-1) => true,
                _ => {
                    return Err(invalid_stage(
                        "$sort",
                        format!("sort direction for '{}' must be 1 or -1", key),
                    ))
                }
            };
            Ok(SortKey {
                path: FieldPath::parse(key)?,
                descending,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;
    Ok(Stage::Sort(keys))
}

fn parse_lookup(body: &Value) -> Result<Stage, ParseError> {
    let map = object("$lookup", body)?;
    let string_field = |name: &str| lookup_string(map, name);

    let from = string_field("from")?
        .ok_or_else(|| invalid_stage("$lookup", "missing 'from'"))?
        .to_string();
    let as_field = string_field("as")?.ok_or_else(|| invalid_stage("$lookup", "missing 'as'"))?;
    let local_field = string_field("localField")?.map(FieldPath::parse).transpose()?;
    let foreign_field = string_field("foreignField")?.map(FieldPath::parse).transpose()?;

    if local_field.is_some() != foreign_field.is_some() {
        return Err(invalid_stage(
            "$lookup",
            "'localField' and 'foreignField' must be specified together",
        ));
    }

    let pipeline = map.get("pipeline").map(parse_pipeline).transpose()?;
    if local_field.is_none() && pipeline.is_none() {
        return Err(invalid_stage(
            "$lookup",
            "either 'localField'/'foreignField' or 'pipeline' is required",
        ));
    }

    let let_vars = match map.get("let") {
        None => Vec::new(),
        Some(Value::Object(vars)) => vars
            .iter()
            .map(|(name, value)| Ok((name.clone(), parse_expression(value)?)))
            .collect::<Result<Vec<_>, ParseError>>()?,
        Some(_) => return Err(invalid_stage("$lookup", "'let' must be a document")),
    };

    Ok(Stage::Lookup(Lookup {
        from,
        local_field,
        foreign_field,
        let_vars,
        pipeline,
        as_field: FieldPath::parse(as_field)?,
    }))
}

fn lookup_string<'a>(map: &'a Map<String, Value>, name: &str) -> Result<Option<&'a str>, ParseError> {
    match map.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(invalid_stage("$lookup", format!("'{}' must be a string", name))),
    }
}

fn unwind_path(value: &Value) -> Result<FieldPath, ParseError> {
    match value.as_str().and_then(|s| s.strip_prefix('$')) {
        Some(path) => FieldPath::parse(path),
        None => Err(invalid_stage("$unwind", "path must be a field path prefixed with '$'")),
    }
}

fn parse_unwind(body: &Value) -> Result<Stage, ParseError> {
    let unwind = match body {
        Value::String(_) => Unwind {
            path: unwind_path(body)?,
            include_array_index: None,
            preserve_null_and_empty_arrays: false,
        },
        Value::Object(map) => {
            let path = map
                .get("path")
                .ok_or_else(|| invalid_stage("$unwind", "missing 'path'"))?;
            let include_array_index = match map.get("includeArrayIndex") {
                None => None,
                Some(Value::String(name)) => Some(FieldPath::parse(name)?),
                Some(_) => return Err(invalid_stage("$unwind", "'includeArrayIndex' must be a string")),
            };
            let preserve = match map.get("preserveNullAndEmptyArrays") {
                None => false,
                Some(Value::Bool(b)) => *b,
                Some(_) => {
                    return Err(invalid_stage(
                        "$unwind",
                        "'preserveNullAndEmptyArrays' must be a boolean",
                    ))
                }
            };
            Unwind {
                path: unwind_path(path)?,
                include_array_index,
                preserve_null_and_empty_arrays: preserve,
            }
        }
        _ => return Err(invalid_stage("$unwind", "expected a field path or a document")),
    };
    Ok(Stage::Unwind(unwind))
}

fn parse_count(body: &Value) -> Result<Stage, ParseError> {
    let name = body
        .as_str()
        .ok_or_else(|| invalid_stage("$count", "the count field must be a string"))?;
    Ok(Stage::Count(field_name("$count", name)?))
}

fn parse_facet(body: &Value) -> Result<Stage, ParseError> {
    let map = object("$facet", body)?;
    if map.is_empty() {
        return Err(invalid_stage("$facet", "specification must have at least one facet"));
    }
    let mut facets = Vec::new();
    for (name, value) in map {
        let pipeline = parse_pipeline(value)?;
        if pipeline.stages.iter().any(|s| matches!(s, Stage::Facet(_))) {
            return Err(invalid_stage("$facet", "sub-pipelines cannot contain $facet"));
        }
        facets.push((field_name("$facet", name)?, pipeline));
    }
    Ok(Stage::Facet(facets))
}

/// Parse an aggregation expression
pub fn parse_expression(value: &Value) -> Result<Expression, ParseError> {
    match value {
        Value::String(s) => parse_string_expression(s),
        Value::Array(items) => Ok(Expression::Array(
            items.iter().map(parse_expression).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            if let Some((name, arg)) = single_entry(value) {
                if name.starts_with('$') {
                    return parse_operator(name, arg);
                }
            }
            if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
                return Err(invalid_args(key, "an operator must be the only field in its document"));
            }
            let fields = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
                .collect::<Result<Vec<_>, ParseError>>()?;
            Ok(Expression::Object(fields))
        }
        other => Ok(Expression::Literal(other.clone())),
    }
}

fn parse_string_expression(s: &str) -> Result<Expression, ParseError> {
    if let Some(var) = s.strip_prefix("$$") {
        let (name, path) = match var.split_once('.') {
            Some((name, rest)) => (name, Some(FieldPath::parse(rest)?)),
            None => (var, None),
        };
        if name.is_empty() {
            return Err(ParseError::InvalidFieldPath(s.to_string()));
        }
        return Ok(Expression::Variable {
            name: name.to_string(),
            path,
        });
    }
    if let Some(path) = s.strip_prefix('$') {
        return Ok(Expression::FieldRef(FieldPath::parse(path)?));
    }
    Ok(Expression::Literal(Value::String(s.to_string())))
}

fn named_args<'a>(op: &str, arg: &'a Value) -> Result<&'a Map<String, Value>, ParseError> {
    arg.as_object()
        .ok_or_else(|| invalid_args(op, "expected a document of named arguments"))
}

fn required<'a>(op: &str, args: &'a Map<String, Value>, name: &str) -> Result<&'a Value, ParseError> {
    args.get(name)
        .ok_or_else(|| invalid_args(op, format!("missing '{}'", name)))
}

fn boxed(value: &Value) -> Result<Box<Expression>, ParseError> {
    Ok(Box::new(parse_expression(value)?))
}

fn variable_name(op: &str, args: &Map<String, Value>) -> Result<String, ParseError> {
    match args.get("as") {
        None => Ok("this".to_string()),
        Some(Value::String(name)) if !name.is_empty() && !name.starts_with('$') => Ok(name.clone()),
        Some(_) => Err(invalid_args(op, "'as' must be a variable name")),
    }
}

fn parse_operator(name: &str, arg: &Value) -> Result<Expression, ParseError> {
    match name {
        "$literal" => Ok(Expression::Literal(arg.clone())),
        "$cond" => match arg {
            Value::Array(items) if items.len() == 3 => Ok(Expression::Cond {
                condition: boxed(&items[0])?,
                then: boxed(&items[1])?,
                otherwise: boxed(&items[2])?,
            }),
            Value::Object(args) => Ok(Expression::Cond {
                condition: boxed(required(name, args, "if")?)?,
                then: boxed(required(name, args, "then")?)?,
                otherwise: boxed(required(name, args, "else")?)?,
            }),
            _ => Err(invalid_args(name, "expected [if, then, else] or {if, then, else}")),
        },
        "$switch" => {
            let args = named_args(name, arg)?;
            let branches = required(name, args, "branches")?
                .as_array()
                .ok_or_else(|| invalid_args(name, "'branches' must be an array"))?
                .iter()
                .map(|branch| {
                    let branch = named_args(name, branch)?;
                    Ok((
                        parse_expression(required(name, branch, "case")?)?,
                        parse_expression(required(name, branch, "then")?)?,
                    ))
                })
                .collect::<Result<Vec<_>, ParseError>>()?;
            if branches.is_empty() {
                return Err(invalid_args(name, "requires at least one branch"));
            }
            Ok(Expression::Switch {
                branches,
                default: args.get("default").map(boxed).transpose()?,
            })
        }
        "$filter" => {
            let args = named_args(name, arg)?;
            Ok(Expression::Filter {
                input: boxed(required(name, args, "input")?)?,
                var: variable_name(name, args)?,
                cond: boxed(required(name, args, "cond")?)?,
            })
        }
        "$map" => {
            let args = named_args(name, arg)?;
            Ok(Expression::Map {
                input: boxed(required(name, args, "input")?)?,
                var: variable_name(name, args)?,
                expr: boxed(required(name, args, "in")?)?,
            })
        }
        "$reduce" => {
            let args = named_args(name, arg)?;
            Ok(Expression::Reduce {
                input: boxed(required(name, args, "input")?)?,
                initial: boxed(required(name, args, "initialValue")?)?,
                expr: boxed(required(name, args, "in")?)?,
            })
        }
        "$dateToString" => {
            let args = named_args(name, arg)?;
            let format = match args.get("format") {
                None => "%Y-%m-%dT%H:%M:%S.%LZ".to_string(),
                Some(Value::String(f)) => f.clone(),
                Some(_) => return Err(invalid_args(name, "'format' must be a string")),
            };
            Ok(Expression::DateToString {
                date: boxed(required(name, args, "date")?)?,
                format,
            })
        }
        "$function" => {
            let args = named_args(name, arg)?;
            let body = required(name, args, "body")?
                .as_str()
                .ok_or_else(|| invalid_args(name, "'body' must be a string"))?;
            let call_args = required(name, args, "args")?
                .as_array()
                .ok_or_else(|| invalid_args(name, "'args' must be an array"))?
                .iter()
                .map(parse_expression)
                .collect::<Result<Vec<_>, _>>()?;
            let lang = args.get("lang").and_then(Value::as_str).unwrap_or("js");
            if lang != "js" {
                return Err(invalid_args(name, format!("unsupported lang '{}'", lang)));
            }
            Ok(Expression::Function(FunctionCall {
                body: body.to_string(),
                args: call_args,
                lang: lang.to_string(),
            }))
        }
        "$regexMatch" => {
            let args = named_args(name, arg)?;
            let regex = required(name, args, "regex")?;
            if !regex.is_string() {
                return Err(invalid_args(name, "'regex' must be a string"));
            }
            let options = args.get("options").cloned().unwrap_or_else(|| Value::String(String::new()));
            operator(
                ExprOp::RegexMatch,
                vec![
                    parse_expression(required(name, args, "input")?)?,
                    Expression::Literal(regex.clone()),
                    Expression::Literal(options),
                ],
            )
        }
        "$trim" => {
            let args = named_args(name, arg)?;
            if args.contains_key("chars") {
                return Err(invalid_args(name, "'chars' is not supported"));
            }
            operator(ExprOp::Trim, vec![parse_expression(required(name, args, "input")?)?])
        }
        "$dateFromString" => {
            let args = named_args(name, arg)?;
            operator(
                ExprOp::DateFromString,
                vec![parse_expression(required(name, args, "dateString")?)?],
            )
        }
        "$dateDiff" => {
            let args = named_args(name, arg)?;
            operator(
                ExprOp::DateDiff,
                vec![
                    parse_expression(required(name, args, "startDate")?)?,
                    parse_expression(required(name, args, "endDate")?)?,
                    parse_expression(required(name, args, "unit")?)?,
                ],
            )
        }
        "$dateAdd" | "$dateSubtract" => {
            let args = named_args(name, arg)?;
            let op = if name == "$dateAdd" {
                ExprOp::DateAdd
            } else {
                ExprOp::DateSubtract
            };
            operator(
                op,
                vec![
                    parse_expression(required(name, args, "startDate")?)?,
                    parse_expression(required(name, args, "unit")?)?,
                    parse_expression(required(name, args, "amount")?)?,
                ],
            )
        }
        _ => {
            let op = ExprOp::from_name(name)
                .ok_or_else(|| ParseError::UnknownOperator(name.to_string()))?;
            let args = match (op, arg) {
                (_, Value::Array(items)) => items
                    .iter()
                    .map(parse_expression)
                    .collect::<Result<Vec<_>, _>>()?,
                // Date part operators also accept {date: <expr>}
                (
                    ExprOp::Year
                    | ExprOp::Month
                    | ExprOp::DayOfMonth
                    | ExprOp::Hour
                    | ExprOp::Minute
                    | ExprOp::Second
                    | ExprOp::DayOfWeek
                    | ExprOp::DayOfYear,
                    Value::Object(args),
                ) if args.contains_key("date") => vec![parse_expression(&args["date"])?],
                (_, other) => vec![parse_expression(other)?],
            };
            operator(op, args)
        }
    }
}

fn operator(op: ExprOp, args: Vec<Expression>) -> Result<Expression, ParseError> {
    let (min, max) = op.arity();
    if args.len() < min || max.map_or(false, |max| args.len() > max) {
        let expected = match max {
            Some(max) if max == min => format!("{}", min),
            Some(max) => format!("{} to {}", min, max),
            None => format!("at least {}", min),
        };
        return Err(invalid_args(
            op.name(),
            format!("expected {} arguments, got {}", expected, args.len()),
        ));
    }
    Ok(Expression::Operator { op, args })
}

/// Parse a query filter document
pub fn parse_filter(value: &Value) -> Result<Filter, ParseError> {
    let map = value
        .as_object()
        .ok_or_else(|| ParseError::InvalidFilter(format!("expected a document, got {}", value)))?;

    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let filters = value
                    .as_array()
                    .filter(|items| !items.is_empty())
                    .ok_or_else(|| {
                        ParseError::InvalidFilter(format!("{} must be a nonempty array", key))
                    })?
                    .iter()
                    .map(parse_filter)
                    .collect::<Result<Vec<_>, _>>()?;
                match key.as_str() {
                    "$and" => Clause::And(filters),
                    "$or" => Clause::Or(filters),
                    _ => Clause::Nor(filters),
                }
            }
            "$expr" => Clause::Expr(parse_expression(value)?),
            "$comment" => continue,
            op if op.starts_with('$') => return Err(ParseError::UnknownOperator(op.to_string())),
            field => Clause::Field {
                path: FieldPath::parse(field)?,
                predicates: parse_field_value(value)?,
            },
        };
        clauses.push(clause);
    }
    Ok(Filter::new(clauses))
}

fn is_operator_document(value: &Value) -> Option<&Map<String, Value>> {
    value
        .as_object()
        .filter(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn parse_field_value(value: &Value) -> Result<Vec<Predicate>, ParseError> {
    match is_operator_document(value) {
        Some(ops) => parse_predicates(ops),
        None => Ok(vec![Predicate::Eq(value.clone())]),
    }
}

fn array_arg(op: &str, value: &Value) -> Result<Vec<Value>, ParseError> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| invalid_args(op, "needs an array"))
}

fn parse_predicates(ops: &Map<String, Value>) -> Result<Vec<Predicate>, ParseError> {
    let options = match ops.get("$options") {
        None => String::new(),
        Some(Value::String(o)) => o.clone(),
        Some(_) => return Err(invalid_args("$options", "must be a string")),
    };
    if ops.contains_key("$options") && !ops.contains_key("$regex") {
        return Err(invalid_args("$options", "needs a $regex"));
    }

    let mut predicates = Vec::with_capacity(ops.len());
    for (op, arg) in ops {
        let predicate = match op.as_str() {
            "$eq" => Predicate::Eq(arg.clone()),
            "$ne" => Predicate::Ne(arg.clone()),
            "$gt" => Predicate::Gt(arg.clone()),
            "$gte" => Predicate::Gte(arg.clone()),
            "$lt" => Predicate::Lt(arg.clone()),
            "$lte" => Predicate::Lte(arg.clone()),
            "$in" => Predicate::In(array_arg(op, arg)?),
            "$nin" => Predicate::Nin(array_arg(op, arg)?),
            "$all" => Predicate::All(array_arg(op, arg)?),
            "$exists" => Predicate::Exists(match arg {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64() != Some(0.0),
                Value::Null => false,
                _ => true,
            }),
            "$regex" => Predicate::Regex {
                pattern: arg
                    .as_str()
                    .ok_or_else(|| invalid_args(op, "pattern must be a string"))?
                    .to_string(),
                options: options.clone(),
            },
            "$options" => continue,
            "$type" => Predicate::Type(parse_types(arg)?),
            "$size" => Predicate::Size(
                arg.as_u64()
                    .ok_or_else(|| invalid_args(op, "needs a non-negative integer"))?,
            ),
            "$not" => {
                let inner = is_operator_document(arg)
                    .ok_or_else(|| invalid_args(op, "needs an operator document"))?;
                Predicate::Not(parse_predicates(inner)?)
            }
            "$elemMatch" => {
                let map = arg
                    .as_object()
                    .ok_or_else(|| invalid_args(op, "needs a document"))?;
                let scalar = !map.is_empty()
                    && map.keys().all(|k| {
                        k.starts_with('$') && !matches!(k.as_str(), "$and" | "$or" | "$nor" | "$expr")
                    });
                let body = if scalar {
                    ElemMatch::Scalar(parse_predicates(map)?)
                } else {
                    ElemMatch::Document(parse_filter(arg)?)
                };
                Predicate::ElemMatch(Box::new(body))
            }
            "$mod" => {
                let parts = array_arg(op, arg)?;
                let ints: Vec<i64> = parts.iter().filter_map(Value::as_i64).collect();
                if parts.len() != 2 || ints.len() != 2 {
                    return Err(invalid_args(op, "needs [divisor, remainder]"));
                }
                if ints[0] == 0 {
                    return Err(invalid_args(op, "divisor cannot be 0"));
                }
                Predicate::Mod {
                    divisor: ints[0],
                    remainder: ints[1],
                }
            }
            other => return Err(ParseError::UnknownOperator(other.to_string())),
        };
        predicates.push(predicate);
    }
    Ok(predicates)
}

fn parse_types(value: &Value) -> Result<Vec<BsonType>, ParseError> {
    let one = |v: &Value| -> Result<BsonType, ParseError> {
        let resolved = match v {
            Value::String(alias) => BsonType::from_alias(alias),
            Value::Number(n) => n.as_i64().and_then(BsonType::from_code),
            _ => None,
        };
        resolved.ok_or_else(|| ParseError::UnknownType(v.to_string()))
    };
    match value {
        Value::Array(items) => items.iter().map(one).collect(),
        other => Ok(vec![one(other)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    #[test]
    fn test_parse_match_and_sort() {
        let pipeline = parse_pipeline(&json!([
            {"$match": {"status": "completed", "qty": {"$gte": 2, "$lt": 10}}},
            {"$sort": {"total": -1, "name": 1}}
        ]))
        .unwrap();

        assert_eq!(
            pipeline.stages[0],
            Stage::Match(Filter::new(vec![
                Clause::Field {
                    path: path("status"),
                    predicates: vec![Predicate::Eq(json!("completed"))],
                },
                Clause::Field {
                    path: path("qty"),
                    predicates: vec![Predicate::Gte(json!(2)), Predicate::Lt(json!(10))],
                },
            ]))
        );
        assert_eq!(
            pipeline.stages[1],
            Stage::Sort(vec![
                SortKey { path: path("total"), descending: true },
                SortKey { path: path("name"), descending: false },
            ])
        );
    }

    #[test]
    fn test_parse_group() {
        let pipeline = parse_pipeline(&json!([
            {"$group": {
                "_id": "$items.category",
                "totalRevenue": {"$sum": {"$multiply": ["$items.price", "$items.qty"]}},
                "orderCount": {"$sum": 1},
                "n": {"$count": {}}
            }}
        ]))
        .unwrap();

        let Stage::Group(group) = &pipeline.stages[0] else {
            panic!("expected $group");
        };
        assert_eq!(group.id, Expression::FieldRef(path("items.category")));
        assert_eq!(group.accumulators.len(), 3);
        assert_eq!(group.accumulators[0].0, "totalRevenue");
        assert_eq!(
            group.accumulators[0].1.expr,
            Expression::Operator {
                op: ExprOp::Multiply,
                args: vec![
                    Expression::FieldRef(path("items.price")),
                    Expression::FieldRef(path("items.qty")),
                ],
            }
        );
        assert_eq!(group.accumulators[2].1.op, AccumulatorOp::Count);
    }

    #[test]
    fn test_parse_projection_modes() {
        let include = parse_projection(&json!({"name": 1, "_id": 0, "total": {"$add": ["$a", 1]}})).unwrap();
        match include {
            Projection::Include { fields, include_id } => {
                assert!(!include_id);
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0], (path("name"), ProjectField::Keep));
            }
            other => panic!("expected inclusion, got {:?}", other),
        }

        let exclude = parse_projection(&json!({"secret": 0, "_id": 0})).unwrap();
        assert_eq!(
            exclude,
            Projection::Exclude {
                fields: vec![path("_id"), path("secret")]
            }
        );

        let nested = parse_projection(&json!({"address": {"city": 1}})).unwrap();
        assert_eq!(
            nested,
            Projection::Include {
                fields: vec![(path("address.city"), ProjectField::Keep)],
                include_id: true,
            }
        );

        assert!(parse_projection(&json!({"a": 1, "b": 0})).is_err());
    }

    #[test]
    fn test_parse_unwind_forms() {
        let pipeline = parse_pipeline(&json!([
            {"$unwind": "$items"},
            {"$unwind": {"path": "$tags", "includeArrayIndex": "idx", "preserveNullAndEmptyArrays": true}}
        ]))
        .unwrap();

        assert_eq!(
            pipeline.stages[1],
            Stage::Unwind(Unwind {
                path: path("tags"),
                include_array_index: Some(path("idx")),
                preserve_null_and_empty_arrays: true,
            })
        );
        assert!(parse_pipeline(&json!([{"$unwind": "items"}])).is_err());
    }

    #[test]
    fn test_parse_function_expression() {
        let expr = parse_expression(&json!({
            "$function": {"body": "(x, m) => x * m", "args": ["$value", 10], "lang": "js"}
        }))
        .unwrap();

        assert_eq!(
            expr,
            Expression::Function(FunctionCall {
                body: "(x, m) => x * m".to_string(),
                args: vec![Expression::FieldRef(path("value")), Expression::Literal(json!(10))],
                lang: "js".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_variables_and_literals() {
        assert_eq!(
            parse_expression(&json!("$$this.price")).unwrap(),
            Expression::Variable {
                name: "this".to_string(),
                path: Some(path("price")),
            }
        );
        assert_eq!(
            parse_expression(&json!({"$literal": "$notAField"})).unwrap(),
            Expression::Literal(json!("$notAField"))
        );
        assert_eq!(parse_expression(&json!("plain")).unwrap(), Expression::Literal(json!("plain")));
    }

    #[test]
    fn test_parse_filter_operators() {
        let filter = parse_filter(&json!({
            "name": {"$regex": "^al", "$options": "i"},
            "tags": {"$all": ["a", "b"], "$size": 2},
            "$or": [{"x": null}, {"y": {"$exists": false}}],
            "kind": {"$type": ["string", 16]},
            "scores": {"$elemMatch": {"$gte": 80, "$lt": 90}}
        }))
        .unwrap();

        assert_eq!(filter.clauses.len(), 5);
        assert_eq!(
            filter.clauses[0],
            Clause::Field {
                path: path("name"),
                predicates: vec![Predicate::Regex {
                    pattern: "^al".to_string(),
                    options: "i".to_string()
                }],
            }
        );
        assert_eq!(
            filter.clauses[3],
            Clause::Field {
                path: path("kind"),
                predicates: vec![Predicate::Type(vec![BsonType::String, BsonType::Int])],
            }
        );
        assert!(matches!(
            &filter.clauses[4],
            Clause::Field { predicates, .. }
                if matches!(&predicates[0], Predicate::ElemMatch(m) if matches!(**m, ElemMatch::Scalar(_)))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_pipeline(&json!({"$match": {}})), Err(ParseError::NotAnArray));
        assert_eq!(
            parse_pipeline(&json!([{"$bogus": {}}])),
            Err(ParseError::UnknownStage("$bogus".to_string()))
        );
        assert!(matches!(
            parse_pipeline(&json!([{"$match": {}, "$limit": 1}])),
            Err(ParseError::MalformedStage(_))
        ));
        assert_eq!(
            parse_filter(&json!({"a": {"$near": 1}})),
            Err(ParseError::UnknownOperator("$near".to_string()))
        );
        assert!(matches!(
            parse_expression(&json!({"$add": [1]})).and_then(|_| parse_expression(&json!({"$subtract": [1]}))),
            Err(ParseError::InvalidArguments { .. })
        ));
    }
}
