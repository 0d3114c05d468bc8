//! ClickHouse profile
//!
//! Documents are `String` columns holding JSON text, read with the
//! `JSONExtract*` family. A `Json`-kind value is nullable raw JSON text, and
//! constructed documents are plain string concatenation.

use docsql_ir::{AccumulatorOp, BsonType, ExprOp};
use serde_json::Value;

use crate::{
    quote_literal, DatePart, DateUnit, Dialect, DialectProfile, ExtractKind, Fragment,
    LookupStrategy, ParamStyle, SimplePattern, Source, SqlParam,
};

const NUMERIC_TYPES: &str = "('Int64', 'UInt64', 'Double')";

#[derive(Debug, Clone)]
pub struct ClickHouseProfile {
    style: ParamStyle,
}

impl ClickHouseProfile {
    pub fn new(style: ParamStyle) -> Self {
        Self { style }
    }

    fn doc_text(&self, source: &Source) -> Fragment {
        match source {
            Source::Column(column) => Fragment::raw(column.as_str()),
            Source::Element(alias) => Fragment::raw(alias.as_str()),
            Source::Json(json) => json.clone(),
        }
    }

    /// `t, 'a', 'b'`
    fn path_args(&self, source: &Source, path: &[String]) -> Vec<Fragment> {
        let mut args = vec![self.doc_text(source)];
        args.extend(path.iter().map(|segment| Fragment::raw(quote_literal(segment))));
        args
    }

    fn path_call(&self, function: &str, source: &Source, path: &[String]) -> Fragment {
        Fragment::call(function, self.path_args(source, path))
    }

    /// `if(JSONType(..) <test>, <value>, NULL)`
    fn typed(&self, source: &Source, path: &[String], test: &str, value: Fragment) -> Fragment {
        Fragment::raw("if(")
            .append(self.path_call("JSONType", source, path))
            .text(&format!(" {}, ", test))
            .append(value)
            .text(", NULL)")
    }
}

fn raw_array(array: Fragment) -> Fragment {
    Fragment::call("JSONExtractArrayRaw", vec![array])
}

/// JSON array text from a ClickHouse `Array(String)` of JSON texts
fn to_json_array(array: Fragment) -> Fragment {
    Fragment::raw("concat('[', arrayStringConcat(")
        .append(array)
        .text(", ','), ']')")
}

fn json_or_null(value: Fragment) -> Fragment {
    Fragment::call("ifNull", vec![value, Fragment::raw("'null'")])
}

fn binary(args: Vec<Fragment>, op: &str) -> Fragment {
    Fragment::paren(Fragment::join(args, op))
}

fn unquote(value: Fragment) -> Fragment {
    Fragment::raw("trim(BOTH '\"' FROM ").append(value).text(")")
}

fn parse_date(date: Fragment) -> Fragment {
    Fragment::call("parseDateTime64BestEffortOrNull", vec![date, Fragment::raw("3")])
}

/// Pieces of a `$dateToString` format: formatDateTime specs and `%L` gaps
enum FormatPiece {
    Spec(String),
    Millis,
}

fn format_pieces(format: &str) -> Result<Vec<FormatPiece>, String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            current.push(c);
            continue;
        }
        let spec = chars.next().ok_or_else(|| "%".to_string())?;
        match spec {
            'Y' | 'm' | 'd' | 'H' | 'S' | 'j' | 'u' | 'V' | '%' => {
                current.push('%');
                current.push(spec);
            }
            'M' => current.push_str("%i"),
            'L' => {
                if !current.is_empty() {
                    pieces.push(FormatPiece::Spec(std::mem::take(&mut current)));
                }
                pieces.push(FormatPiece::Millis);
            }
            other => return Err(format!("%{}", other)),
        }
    }
    if !current.is_empty() {
        pieces.push(FormatPiece::Spec(current));
    }
    Ok(pieces)
}

impl DialectProfile for ClickHouseProfile {
    fn dialect(&self) -> Dialect {
        Dialect::ClickHouse
    }

    fn param_style(&self) -> ParamStyle {
        self.style
    }

    fn typed_extraction(&self) -> bool {
        true
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn param(&self, value: SqlParam) -> Fragment {
        Fragment::param(value)
    }

    fn bool_literal(&self, value: bool) -> Fragment {
        Fragment::raw(if value { "true" } else { "false" })
    }

    fn json_literal(&self, value: &Value) -> Fragment {
        match value {
            Value::Null => self.null(),
            other => Fragment::param(SqlParam::Json(other.to_string())),
        }
    }

    fn extract(&self, source: &Source, path: &[String], kind: ExtractKind) -> Fragment {
        match kind {
            ExtractKind::Json if path.is_empty() => Fragment::call(
                "nullIf",
                vec![
                    Fragment::call("nullIf", vec![self.doc_text(source), Fragment::raw("''")]),
                    Fragment::raw("'null'"),
                ],
            ),
            ExtractKind::Json => Fragment::raw("if(")
                .append(self.path_call("JSONHas", source, path))
                .text(" AND ")
                .append(self.path_call("JSONType", source, path))
                .text(" != 'Null', ")
                .append(self.path_call("JSONExtractRaw", source, path))
                .text(", NULL)"),
            ExtractKind::Text => self.typed(
                source,
                path,
                "= 'String'",
                self.path_call("JSONExtractString", source, path),
            ),
            ExtractKind::Number => self.typed(
                source,
                path,
                &format!("IN {}", NUMERIC_TYPES),
                self.path_call("JSONExtractFloat", source, path),
            ),
            ExtractKind::Integer => self.typed(
                source,
                path,
                &format!("IN {}", NUMERIC_TYPES),
                self.path_call("JSONExtractInt", source, path),
            ),
            ExtractKind::Bool => self.typed(
                source,
                path,
                "= 'Bool'",
                self.path_call("JSONExtractBool", source, path).text(" = 1"),
            ),
        }
    }

    fn exists(&self, source: &Source, path: &[String]) -> Fragment {
        if path.is_empty() {
            return Fragment::call("notEmpty", vec![self.doc_text(source)]);
        }
        self.path_call("JSONHas", source, path)
    }

    fn json_type(&self, source: &Source, path: &[String]) -> Fragment {
        Fragment::raw("if(")
            .append(self.exists(source, path))
            .text(", toString(")
            .append(self.path_call("JSONType", source, path))
            .text("), NULL)")
    }

    fn type_names(&self, ty: BsonType) -> &'static [&'static str] {
        match ty {
            BsonType::Double | BsonType::Decimal => &["Double"],
            BsonType::String => &["String"],
            BsonType::Object => &["Object"],
            BsonType::Array => &["Array"],
            BsonType::Bool => &["Bool"],
            BsonType::Null => &["Null"],
            BsonType::Int | BsonType::Long => &["Int64", "UInt64"],
            BsonType::Number => &["Int64", "UInt64", "Double"],
        }
    }

    fn json_text(&self, source: &Source, path: &[String]) -> Fragment {
        if path.is_empty() {
            return self.doc_text(source);
        }
        self.path_call("JSONExtractRaw", source, path)
    }

    fn to_json_text(&self, value: Fragment) -> Fragment {
        json_or_null(value)
    }

    fn coerce(&self, value: Fragment, from: ExtractKind, to: ExtractKind) -> Fragment {
        use ExtractKind::*;
        let bool_text = |value: Fragment| {
            Fragment::raw("multiIf(")
                .append(value.clone())
                .text(" IS NULL, NULL, ")
                .append(value)
                .text(", 'true', 'false')")
        };
        match (from, to) {
            (a, b) if a == b => value,
            (Json, Text) => Fragment::call("JSONExtractString", vec![value]),
            (Json, Number) => Fragment::call("JSONExtractFloat", vec![value]),
            (Json, Integer) => Fragment::call("JSONExtractInt", vec![value]),
            (Json, Bool) => Fragment::paren(Fragment::call("JSONExtractBool", vec![value]).text(" = 1")),
            (Text, Json) => Fragment::call("toJSONString", vec![value]),
            (Number, Json) | (Integer, Json) => Fragment::call("toString", vec![value]),
            (Bool, Json) | (Bool, Text) => bool_text(value),
            (Text, Number) => Fragment::call("toFloat64OrNull", vec![value]),
            (Text, Integer) => Fragment::call("toInt64OrNull", vec![value]),
            (Text, Bool) => Fragment::paren(value.text(" != ''")),
            (Number, Text) | (Integer, Text) => Fragment::call("toString", vec![value]),
            (Number, Integer) | (Bool, Integer) | (Bool, Number) => {
                Fragment::call("toInt64", vec![value])
            }
            (Integer, Number) => Fragment::call("toFloat64", vec![value]),
            (Number, Bool) | (Integer, Bool) => Fragment::paren(value.text(" != 0")),
            _ => value,
        }
    }

    fn build_object(&self, fields: Vec<(String, Fragment)>) -> Fragment {
        if fields.is_empty() {
            return Fragment::raw("'{}'");
        }
        let mut args = vec![Fragment::raw("'{'")];
        for (i, (key, value)) in fields.into_iter().enumerate() {
            let separator = if i == 0 { "" } else { "," };
            let key = Value::String(key).to_string();
            args.push(Fragment::raw(quote_literal(&format!("{}{}:", separator, key))));
            args.push(json_or_null(value));
        }
        args.push(Fragment::raw("'}'"));
        Fragment::call("concat", args)
    }

    fn build_array(&self, items: Vec<Fragment>) -> Fragment {
        if items.is_empty() {
            return Fragment::raw("'[]'");
        }
        let mut args = vec![Fragment::raw("'['")];
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                args.push(Fragment::raw("','"));
            }
            args.push(json_or_null(item));
        }
        args.push(Fragment::raw("']'"));
        Fragment::call("concat", args)
    }

    fn set_paths(&self, doc: Fragment, sets: Vec<(Vec<String>, Fragment)>) -> Fragment {
        if sets.is_empty() {
            return doc;
        }
        Fragment::call("jsonMergePatch", vec![doc, self.nested_patch(sets)])
    }

    fn remove_paths(&self, _doc: Fragment, _paths: &[Vec<String>]) -> Option<Fragment> {
        None
    }

    fn if_null(&self, mut args: Vec<Fragment>) -> Fragment {
        if args.len() == 1 {
            return args.remove(0);
        }
        Fragment::call("coalesce", args)
    }

    fn function(&self, op: ExprOp, mut args: Vec<Fragment>) -> Option<Fragment> {
        use ExprOp::*;
        let f = match op {
            Add if args.is_empty() => Fragment::raw("0"),
            Multiply if args.is_empty() => Fragment::raw("1"),
            Concat if args.is_empty() => Fragment::raw("''"),
            Concat if args.len() == 1 => args.remove(0),
            Add => binary(args, " + "),
            Subtract => binary(args, " - "),
            Multiply => binary(args, " * "),
            Divide => binary(args, " / "),
            Mod => Fragment::call("modulo", args),
            Abs => Fragment::call("abs", args),
            Ceil => Fragment::call("ceil", args),
            Floor => Fragment::call("floor", args),
            Round => Fragment::call("round", args),
            Trunc => Fragment::call("trunc", args),
            Sqrt => Fragment::call("sqrt", args),
            Pow => Fragment::call("pow", args),
            Concat => Fragment::call("concat", args),
            ToUpper => Fragment::call("upperUTF8", args),
            ToLower => Fragment::call("lowerUTF8", args),
            Substr => {
                let length = args.pop()?;
                let start = args.pop()?;
                let string = args.pop()?;
                Fragment::call(
                    "substringUTF8",
                    vec![string, Fragment::paren(start.text(" + 1")), length],
                )
            }
            StrLen => Fragment::call("lengthUTF8", args),
            Trim => Fragment::call("trimBoth", args),
            Split => {
                let separator = args.pop()?;
                let string = args.pop()?;
                Fragment::call(
                    "toJSONString",
                    vec![Fragment::call("splitByString", vec![separator, string])],
                )
            }
            ToInt | ToLong => Fragment::call("toInt64OrNull", vec![unquote(args.pop()?)]),
            ToDouble | ToDecimal => Fragment::call("toFloat64OrNull", vec![unquote(args.pop()?)]),
            ToString => unquote(args.pop()?),
            ToBool => {
                let value = args.pop()?;
                Fragment::raw("multiIf(")
                    .append(value.clone())
                    .text(" IS NULL, NULL, ")
                    .append(value)
                    .text(" IN ('false', '0', '0.0'), false, true)")
            }
            _ => return None,
        };
        Some(f)
    }

    fn like(&self, subject: Fragment, pattern: &SimplePattern, case_insensitive: bool) -> Fragment {
        let op = if case_insensitive { " ILIKE " } else { " LIKE " };
        Fragment::paren(
            subject
                .text(op)
                .append(Fragment::param(SqlParam::Text(pattern.to_like()))),
        )
    }

    fn regex(&self, subject: Fragment, pattern: &str, flags: &str) -> Option<Fragment> {
        let flags: String = flags.chars().filter(|c| matches!(c, 'i' | 'm' | 's')).collect();
        let pattern = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{}){}", flags, pattern)
        };
        Some(Fragment::call(
            "match",
            vec![subject, Fragment::param(SqlParam::Text(pattern))],
        ))
    }

    fn date_part(&self, part: DatePart, date: Fragment) -> Fragment {
        let date = parse_date(date);
        match part {
            DatePart::Year => Fragment::call("toYear", vec![date]),
            DatePart::Month => Fragment::call("toMonth", vec![date]),
            DatePart::DayOfMonth => Fragment::call("toDayOfMonth", vec![date]),
            DatePart::Hour => Fragment::call("toHour", vec![date]),
            DatePart::Minute => Fragment::call("toMinute", vec![date]),
            DatePart::Second => Fragment::call("toSecond", vec![date]),
            DatePart::DayOfYear => Fragment::call("toDayOfYear", vec![date]),
            // toDayOfWeek counts Monday as 1, $dayOfWeek counts Sunday as 1
            DatePart::DayOfWeek => {
                Fragment::paren(Fragment::call("toDayOfWeek", vec![date]).text(" % 7 + 1"))
            }
        }
    }

    fn date_format(&self, date: Fragment, format: &str) -> Result<Fragment, String> {
        let date = parse_date(date);
        let mut parts: Vec<Fragment> = format_pieces(format)?
            .into_iter()
            .map(|piece| match piece {
                FormatPiece::Spec(spec) => Fragment::call(
                    "formatDateTime",
                    vec![date.clone(), Fragment::param(SqlParam::Text(spec))],
                ),
                FormatPiece::Millis => Fragment::raw("leftPad(toString(toUnixTimestamp64Milli(")
                    .append(date.clone())
                    .text(") % 1000), 3, '0')"),
            })
            .collect();
        Ok(match parts.len() {
            0 => Fragment::raw("''"),
            1 => parts.remove(0),
            _ => Fragment::call("concat", parts),
        })
    }

    fn date_parse(&self, text: Fragment) -> Fragment {
        Fragment::call("toString", vec![parse_date(text)])
    }

    fn date_diff(&self, start: Fragment, end: Fragment, unit: DateUnit) -> Fragment {
        Fragment::call(
            "dateDiff",
            vec![
                Fragment::raw(quote_literal(unit.name())),
                parse_date(start),
                parse_date(end),
            ],
        )
    }

    fn date_add(&self, date: Fragment, unit: DateUnit, amount: Fragment) -> Fragment {
        let interval = match unit {
            DateUnit::Millisecond => "toIntervalMillisecond",
            DateUnit::Second => "toIntervalSecond",
            DateUnit::Minute => "toIntervalMinute",
            DateUnit::Hour => "toIntervalHour",
            DateUnit::Day => "toIntervalDay",
            DateUnit::Week => "toIntervalWeek",
            DateUnit::Month => "toIntervalMonth",
            DateUnit::Quarter => "toIntervalQuarter",
            DateUnit::Year => "toIntervalYear",
        };
        let interval = Fragment::call(interval, vec![Fragment::call("toInt64", vec![amount])]);
        Fragment::call(
            "toString",
            vec![parse_date(date).text(" + ").append(interval)],
        )
    }

    fn array_length(&self, array: Fragment) -> Fragment {
        Fragment::call("length", vec![raw_array(array)])
    }

    fn array_element(&self, array: Fragment, index: Fragment) -> Fragment {
        let position = Fragment::raw("if(")
            .append(index.clone())
            .text(" < 0, ")
            .append(index.clone())
            .text(", ")
            .append(index)
            .text(" + 1)");
        Fragment::call(
            "nullIf",
            vec![
                Fragment::call("arrayElement", vec![raw_array(array), position]),
                Fragment::raw("''"),
            ],
        )
    }

    fn array_concat(&self, arrays: Vec<Fragment>) -> Fragment {
        match arrays.len() {
            0 => Fragment::raw("'[]'"),
            1 => to_json_array(raw_array(arrays.into_iter().next().unwrap_or_default())),
            _ => to_json_array(Fragment::call(
                "arrayConcat",
                arrays.into_iter().map(raw_array).collect(),
            )),
        }
    }

    fn array_slice(&self, array: Fragment, position: Option<Fragment>, count: Fragment) -> Fragment {
        let (offset, length) = match position {
            None => (
                Fragment::raw("if(")
                    .append(count.clone())
                    .text(" < 0, ")
                    .append(count.clone())
                    .text(", 1)"),
                Fragment::call("abs", vec![count]),
            ),
            Some(position) => (
                Fragment::raw("if(")
                    .append(position.clone())
                    .text(" < 0, ")
                    .append(position.clone())
                    .text(", ")
                    .append(position)
                    .text(" + 1)"),
                count,
            ),
        };
        to_json_array(Fragment::call("arraySlice", vec![raw_array(array), offset, length]))
    }

    fn array_contains(&self, array: Fragment, value: Fragment) -> Fragment {
        Fragment::call("has", vec![raw_array(array), value])
    }

    fn array_any(&self, array: Fragment, alias: &str, predicate: Fragment) -> Fragment {
        Fragment::raw(format!("arrayExists({} -> ", alias))
            .append(predicate)
            .text(", ")
            .append(raw_array(array))
            .text(")")
    }

    fn array_filter(&self, array: Fragment, alias: &str, predicate: Fragment) -> Fragment {
        to_json_array(
            Fragment::raw(format!("arrayFilter({} -> ", alias))
                .append(predicate)
                .text(", ")
                .append(raw_array(array))
                .text(")"),
        )
    }

    fn array_map(&self, array: Fragment, alias: &str, value: Fragment) -> Fragment {
        to_json_array(
            Fragment::raw(format!("arrayMap({} -> ", alias))
                .append(json_or_null(value))
                .text(", ")
                .append(raw_array(array))
                .text(")"),
        )
    }

    fn array_reduce(
        &self,
        array: Fragment,
        alias: &str,
        accumulator: &str,
        initial: Fragment,
        step: Fragment,
    ) -> Option<Fragment> {
        let fold = Fragment::raw(format!("arrayFold(({}, {}) -> ", accumulator, alias))
            .append(json_or_null(step))
            .text(", ")
            .append(raw_array(array))
            .text(", ")
            .append(json_or_null(initial))
            .text(")");
        Some(Fragment::call("nullIf", vec![fold, Fragment::raw("'null'")]))
    }

    fn aggregate_arg_kind(&self, op: AccumulatorOp) -> ExtractKind {
        match op {
            AccumulatorOp::Sum
            | AccumulatorOp::Avg
            | AccumulatorOp::Min
            | AccumulatorOp::Max
            | AccumulatorOp::StdDevPop
            | AccumulatorOp::StdDevSamp => ExtractKind::Number,
            _ => ExtractKind::Json,
        }
    }

    fn aggregate(&self, op: AccumulatorOp, arg: Fragment) -> Option<(Fragment, ExtractKind)> {
        let number = |name: &str, arg: Fragment| (Fragment::call(name, vec![arg]), ExtractKind::Number);
        Some(match op {
            AccumulatorOp::Sum => number("sum", arg),
            AccumulatorOp::Avg => number("avg", arg),
            AccumulatorOp::Min => number("min", arg),
            AccumulatorOp::Max => number("max", arg),
            AccumulatorOp::StdDevPop => number("stddevPop", arg),
            AccumulatorOp::StdDevSamp => number("stddevSamp", arg),
            AccumulatorOp::First => (Fragment::call("any", vec![arg]), ExtractKind::Json),
            AccumulatorOp::Last => (Fragment::call("anyLast", vec![arg]), ExtractKind::Json),
            AccumulatorOp::Push => (
                to_json_array(Fragment::call("groupArray", vec![json_or_null(arg)])),
                ExtractKind::Json,
            ),
            AccumulatorOp::AddToSet => (
                to_json_array(Fragment::call("groupUniqArray", vec![json_or_null(arg)])),
                ExtractKind::Json,
            ),
            AccumulatorOp::Count => (Fragment::raw("count()"), ExtractKind::Integer),
        })
    }

    fn collect_documents(&self, doc: Fragment) -> Fragment {
        to_json_array(Fragment::call("groupArray", vec![doc]))
    }

    fn count_all(&self) -> &'static str {
        "count()"
    }

    fn group_key(&self, key: Fragment) -> Fragment {
        // typed placeholders are numbered, so a repeated key expression
        // would no longer match its GROUP BY twin
        Fragment::call("any", vec![key])
    }

    fn lookup_strategy(&self) -> LookupStrategy {
        LookupStrategy::GroupedJoin
    }

    fn unwind_join(
        &self,
        source: &Source,
        path: &[String],
        alias: &str,
        preserve_empty: bool,
        with_index: bool,
    ) -> Fragment {
        let join = if preserve_empty { "LEFT ARRAY JOIN " } else { "ARRAY JOIN " };
        let array = self.path_call("JSONExtractArrayRaw", source, path);
        let mut clause = Fragment::raw(join)
            .append(array.clone())
            .text(&format!(" AS {}", alias));
        if with_index {
            clause = clause
                .text(", ")
                .append(Fragment::call("arrayEnumerate", vec![array]))
                .text(&format!(" AS {}_i", alias));
        }
        clause
    }

    fn unwind_index(&self, alias: &str) -> Fragment {
        Fragment::raw(format!("(nullIf({}_i, 0) - 1)", alias))
    }

    fn random(&self) -> &'static str {
        "rand()"
    }

    fn order_term(&self, key: Fragment, descending: bool) -> Fragment {
        // ClickHouse sorts NULLs last in both directions
        key.text(if descending { " DESC" } else { " ASC NULLS FIRST" })
    }

    fn joined_documents(&self, column: Fragment) -> Fragment {
        Fragment::raw("if(empty(ifNull(")
            .append(column.clone())
            .text(", '')), '[]', ")
            .append(column)
            .text(")")
    }

    fn limit_offset(&self, limit: Option<Fragment>, offset: Option<Fragment>) -> Fragment {
        match (limit, offset) {
            (None, None) => Fragment::new(),
            (Some(limit), None) => Fragment::raw("LIMIT ").append(limit),
            (Some(limit), Some(offset)) => Fragment::raw("LIMIT ")
                .append(limit)
                .text(" OFFSET ")
                .append(offset),
            (None, Some(offset)) => Fragment::raw("OFFSET ").append(offset).text(" ROWS"),
        }
    }

    fn sort_kinds(&self) -> &'static [ExtractKind] {
        &[ExtractKind::Number, ExtractKind::Text]
    }
}

impl ClickHouseProfile {
    /// Nested patch document for `jsonMergePatch` from dotted assignments
    fn nested_patch(&self, sets: Vec<(Vec<String>, Fragment)>) -> Fragment {
        let mut fields: Vec<(String, Vec<(Vec<String>, Fragment)>)> = Vec::new();
        let mut leaves: Vec<(String, Fragment)> = Vec::new();
        for (mut path, value) in sets {
            if path.is_empty() {
                continue;
            }
            let head = path.remove(0);
            if path.is_empty() {
                leaves.push((head, value));
            } else if let Some((_, nested)) = fields.iter_mut().find(|(key, _)| *key == head) {
                nested.push((path, value));
            } else {
                fields.push((head, vec![(path, value)]));
            }
        }

        let mut object = leaves;
        for (key, nested) in fields {
            object.push((key, self.nested_patch(nested)));
        }
        self.build_object(object)
    }
}
