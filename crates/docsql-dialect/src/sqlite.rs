//! SQLite JSON1 profile
//!
//! Documents are TEXT columns read with `json_extract`. SQLite values are
//! dynamically typed, so extraction ignores the requested kind except for
//! `Json`, which keeps booleans and containers as JSON when embedded into
//! `json_object`/`json_set`.

use docsql_ir::{AccumulatorOp, BsonType, ExprOp};
use serde_json::Value;

use crate::{
    quote_literal, DatePart, DateUnit, Dialect, DialectProfile, ExtractKind, Fragment,
    LookupStrategy, ParamStyle, SimplePattern, Source, SqlParam,
};

const ISO_FORMAT: &str = "'%Y-%m-%dT%H:%M:%fZ'";

#[derive(Debug, Clone, Default)]
pub struct SqliteProfile;

impl SqliteProfile {
    pub fn new() -> Self {
        Self
    }

    /// JSON text of the whole source
    fn doc_text(&self, source: &Source) -> Fragment {
        match source {
            Source::Column(column) => Fragment::raw(column.as_str()),
            Source::Json(json) => json.clone(),
            Source::Element(alias) => Fragment::raw(format!(
                "CASE WHEN {a}.type IN ('object', 'array') THEN {a}.value \
                 WHEN {a}.type IN ('true', 'false', 'null') THEN {a}.type \
                 ELSE json_quote({a}.value) END",
                a = alias
            )),
        }
    }

    /// JSON text usable as the first argument of a path function
    fn container(&self, source: &Source) -> Fragment {
        match source {
            Source::Element(alias) => Fragment::raw(format!(
                "CASE WHEN {a}.type = 'object' THEN {a}.value END",
                a = alias
            )),
            other => self.doc_text(other),
        }
    }

    fn path_call(&self, function: &str, source: &Source, path: &[String]) -> Fragment {
        Fragment::call(function, vec![self.container(source), Fragment::raw(json_path(path))])
    }
}

/// `'$."a"."b"'`
fn json_path(path: &[String]) -> String {
    let mut out = String::from("$");
    for segment in path {
        out.push_str(&format!(".\"{}\"", segment));
    }
    quote_literal(&out)
}

fn binary(args: Vec<Fragment>, op: &str) -> Fragment {
    Fragment::paren(Fragment::join(args, op))
}

fn strftime_int(spec: &str, date: Fragment) -> Fragment {
    Fragment::raw(format!("CAST(strftime('{}', ", spec))
        .append(date)
        .text(") AS INTEGER)")
}

fn cast(value: Fragment, ty: &str) -> Fragment {
    Fragment::raw("CAST(")
        .append(value)
        .text(&format!(" AS {})", ty))
}

/// Translate a `$dateToString` format into strftime syntax
fn strftime_format(format: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let spec = chars.next().ok_or_else(|| "%".to_string())?;
        match spec {
            'Y' | 'm' | 'd' | 'H' | 'M' | 'j' | '%' => {
                out.push('%');
                out.push(spec);
            }
            'S' => {
                // %S.%L is strftime's fractional-seconds %f
                let rest: String = chars.clone().take(3).collect();
                if rest == ".%L" {
                    chars.nth(2);
                    out.push_str("%f");
                } else {
                    out.push_str("%S");
                }
            }
            other => return Err(format!("%{}", other)),
        }
    }
    Ok(out)
}

impl DialectProfile for SqliteProfile {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn param_style(&self) -> ParamStyle {
        ParamStyle::Positional
    }

    fn typed_extraction(&self) -> bool {
        false
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn param(&self, value: SqlParam) -> Fragment {
        match value {
            SqlParam::Json(_) => Fragment::call("json", vec![Fragment::param(value)]),
            other => Fragment::param(other),
        }
    }

    fn bool_literal(&self, value: bool) -> Fragment {
        Fragment::raw(if value { "TRUE" } else { "FALSE" })
    }

    fn json_literal(&self, value: &Value) -> Fragment {
        match value {
            Value::Null => self.null(),
            Value::String(_) | Value::Number(_) => Fragment::param(SqlParam::from_json(value)),
            other => self.param(SqlParam::Json(other.to_string())),
        }
    }

    fn extract(&self, source: &Source, path: &[String], kind: ExtractKind) -> Fragment {
        if path.is_empty() {
            return match (source, kind) {
                (Source::Element(alias), ExtractKind::Json) => Fragment::raw(format!(
                    "CASE WHEN {a}.type IN ('object', 'array') THEN json({a}.value) \
                     WHEN {a}.type = 'true' THEN json('true') \
                     WHEN {a}.type = 'false' THEN json('false') ELSE {a}.value END",
                    a = alias
                )),
                (Source::Element(alias), _) => Fragment::raw(format!("{}.value", alias)),
                (other, ExtractKind::Json) => Fragment::call("json", vec![self.doc_text(other)]),
                (other, _) => Fragment::call(
                    "json_extract",
                    vec![self.doc_text(other), Fragment::raw("'$'")],
                ),
            };
        }

        let value = self.path_call("json_extract", source, path);
        match kind {
            ExtractKind::Json => {
                let ty = self.path_call("json_type", source, path);
                Fragment::raw("CASE ")
                    .append(ty)
                    .text(" WHEN 'true' THEN json('true') WHEN 'false' THEN json('false') ELSE ")
                    .append(value)
                    .text(" END")
            }
            _ => value,
        }
    }

    fn exists(&self, source: &Source, path: &[String]) -> Fragment {
        let ty = self.json_type(source, path);
        Fragment::paren(ty.text(" IS NOT NULL"))
    }

    fn json_type(&self, source: &Source, path: &[String]) -> Fragment {
        match (source, path.is_empty()) {
            (Source::Element(alias), true) => Fragment::raw(format!("{}.type", alias)),
            (other, true) => Fragment::call("json_type", vec![self.doc_text(other)]),
            (other, false) => self.path_call("json_type", other, path),
        }
    }

    fn type_names(&self, ty: BsonType) -> &'static [&'static str] {
        match ty {
            BsonType::Double | BsonType::Decimal => &["real"],
            BsonType::String => &["text"],
            BsonType::Object => &["object"],
            BsonType::Array => &["array"],
            BsonType::Bool => &["true", "false"],
            BsonType::Null => &["null"],
            BsonType::Int | BsonType::Long => &["integer"],
            BsonType::Number => &["integer", "real"],
        }
    }

    fn json_text(&self, source: &Source, path: &[String]) -> Fragment {
        if path.is_empty() {
            return self.doc_text(source);
        }
        Fragment::paren(
            self.container(source)
                .text(" -> ")
                .text(&json_path(path)),
        )
    }

    fn to_json_text(&self, value: Fragment) -> Fragment {
        Fragment::call("json_quote", vec![value])
    }

    fn coerce(&self, value: Fragment, from: ExtractKind, to: ExtractKind) -> Fragment {
        use ExtractKind::*;
        let bool_case = |value: Fragment, yes: &str, no: &str| {
            Fragment::raw("CASE WHEN ")
                .append(value.clone())
                .text(&format!(" THEN {} WHEN NOT ", yes))
                .append(value)
                .text(&format!(" THEN {} END", no))
        };
        match (from, to) {
            (a, b) if a == b => value,
            (Bool, Json) => bool_case(value, "json('true')", "json('false')"),
            (Bool, Text) => bool_case(value, "'true'", "'false'"),
            (Json, Integer) | (Text, Integer) | (Number, Integer) => cast(value, "INTEGER"),
            (Text, Number) => cast(value, "REAL"),
            (Number, Text) | (Integer, Text) => cast(value, "TEXT"),
            (Text, Bool) => Fragment::paren(value.text(" <> ''")),
            (Number, Bool) | (Integer, Bool) => Fragment::paren(value.text(" <> 0")),
            _ => value,
        }
    }

    fn build_object(&self, fields: Vec<(String, Fragment)>) -> Fragment {
        let args = fields
            .into_iter()
            .flat_map(|(key, value)| [Fragment::raw(quote_literal(&key)), value])
            .collect();
        Fragment::call("json_object", args)
    }

    fn build_array(&self, items: Vec<Fragment>) -> Fragment {
        Fragment::call("json_array", items)
    }

    fn set_paths(&self, doc: Fragment, sets: Vec<(Vec<String>, Fragment)>) -> Fragment {
        if sets.is_empty() {
            return doc;
        }
        let mut args = vec![doc];
        for (path, value) in sets {
            args.push(Fragment::raw(json_path(&path)));
            args.push(value);
        }
        Fragment::call("json_set", args)
    }

    fn remove_paths(&self, doc: Fragment, paths: &[Vec<String>]) -> Option<Fragment> {
        let mut args = vec![doc];
        args.extend(paths.iter().map(|p| Fragment::raw(json_path(p))));
        Some(Fragment::call("json_remove", args))
    }

    fn if_null(&self, mut args: Vec<Fragment>) -> Fragment {
        if args.len() == 1 {
            return args.remove(0);
        }
        Fragment::call("COALESCE", args)
    }

    fn function(&self, op: ExprOp, mut args: Vec<Fragment>) -> Option<Fragment> {
        use ExprOp::*;
        let f = match op {
            Add if args.is_empty() => Fragment::raw("0"),
            Multiply if args.is_empty() => Fragment::raw("1"),
            Concat if args.is_empty() => Fragment::raw("''"),
            Add => binary(args, " + "),
            Subtract => binary(args, " - "),
            Multiply => binary(args, " * "),
            Divide => {
                let divisor = args.pop()?;
                let dividend = args.pop()?;
                Fragment::paren(cast(dividend, "REAL").text(" / ").append(divisor))
            }
            Mod => binary(args, " % "),
            Abs => Fragment::call("abs", args),
            Ceil => Fragment::call("ceil", args),
            Floor => Fragment::call("floor", args),
            Round => Fragment::call("round", args),
            Trunc if args.len() == 1 => cast(args.pop()?, "INTEGER"),
            Trunc => {
                let places = args.pop()?;
                let value = args.pop()?;
                let scale = Fragment::call("pow", vec![Fragment::raw("10"), places]);
                Fragment::paren(
                    cast(Fragment::paren(value.text(" * ").append(scale.clone())), "INTEGER")
                        .text(" / ")
                        .append(scale),
                )
            }
            Sqrt => Fragment::call("sqrt", args),
            Pow => Fragment::call("pow", args),
            Concat => binary(args, " || "),
            ToUpper => Fragment::call("upper", args),
            ToLower => Fragment::call("lower", args),
            Substr => {
                let length = args.pop()?;
                let start = args.pop()?;
                let string = args.pop()?;
                Fragment::call("substr", vec![string, Fragment::paren(start.text(" + 1")), length])
            }
            StrLen => Fragment::call("length", args),
            Trim => Fragment::call("trim", args),
            ToInt | ToLong => cast(args.pop()?, "INTEGER"),
            ToDouble | ToDecimal => cast(args.pop()?, "REAL"),
            ToString => cast(args.pop()?, "TEXT"),
            ToBool => {
                let value = args.pop()?;
                Fragment::raw("CASE WHEN ")
                    .append(value.clone())
                    .text(" IS NULL THEN NULL WHEN ")
                    .append(value)
                    .text(" = 0 THEN 0 ELSE 1 END")
            }
            _ => return None,
        };
        Some(f)
    }

    fn like(&self, subject: Fragment, pattern: &SimplePattern, case_insensitive: bool) -> Fragment {
        // LIKE is ASCII case-insensitive in sqlite; GLOB is case-sensitive
        if case_insensitive {
            Fragment::paren(
                subject
                    .text(" LIKE ")
                    .append(Fragment::param(SqlParam::Text(pattern.to_like())))
                    .text(" ESCAPE '\\'"),
            )
        } else {
            Fragment::paren(
                subject
                    .text(" GLOB ")
                    .append(Fragment::param(SqlParam::Text(pattern.to_glob()))),
            )
        }
    }

    fn regex(&self, _subject: Fragment, _pattern: &str, _flags: &str) -> Option<Fragment> {
        None
    }

    fn date_part(&self, part: DatePart, date: Fragment) -> Fragment {
        match part {
            DatePart::Year => strftime_int("%Y", date),
            DatePart::Month => strftime_int("%m", date),
            DatePart::DayOfMonth => strftime_int("%d", date),
            DatePart::Hour => strftime_int("%H", date),
            DatePart::Minute => strftime_int("%M", date),
            DatePart::Second => strftime_int("%S", date),
            DatePart::DayOfYear => strftime_int("%j", date),
            // strftime counts Sunday as 0, $dayOfWeek as 1
            DatePart::DayOfWeek => Fragment::paren(strftime_int("%w", date).text(" + 1")),
        }
    }

    fn date_format(&self, date: Fragment, format: &str) -> Result<Fragment, String> {
        let format = strftime_format(format)?;
        Ok(Fragment::call(
            "strftime",
            vec![Fragment::param(SqlParam::Text(format)), date],
        ))
    }

    fn date_parse(&self, text: Fragment) -> Fragment {
        Fragment::call("strftime", vec![Fragment::raw(ISO_FORMAT), text])
    }

    fn date_diff(&self, start: Fragment, end: Fragment, unit: DateUnit) -> Fragment {
        let julian = || {
            Fragment::paren(
                Fragment::call("julianday", vec![end.clone()])
                    .text(" - ")
                    .append(Fragment::call("julianday", vec![start.clone()])),
            )
        };
        let days = || {
            cast(
                Fragment::call("julianday", vec![Fragment::call("date", vec![end.clone()])])
                    .text(" - ")
                    .append(Fragment::call(
                        "julianday",
                        vec![Fragment::call("date", vec![start.clone()])],
                    )),
                "INTEGER",
            )
        };
        let years = || {
            strftime_int("%Y", end.clone())
                .text(" - ")
                .append(strftime_int("%Y", start.clone()))
        };
        let scaled = |factor: &str| cast(julian().text(&format!(" * {}", factor)), "INTEGER");

        match unit {
            DateUnit::Millisecond => scaled("86400000"),
            DateUnit::Second => scaled("86400"),
            DateUnit::Minute => scaled("1440"),
            DateUnit::Hour => scaled("24"),
            DateUnit::Day => days(),
            DateUnit::Week => Fragment::paren(days().text(" / 7")),
            DateUnit::Month => Fragment::paren(
                Fragment::paren(years())
                    .text(" * 12 + ")
                    .append(strftime_int("%m", end.clone()))
                    .text(" - ")
                    .append(strftime_int("%m", start.clone())),
            ),
            DateUnit::Quarter => Fragment::paren(
                Fragment::paren(years())
                    .text(" * 4 + (")
                    .append(strftime_int("%m", end.clone()))
                    .text(" - 1) / 3 - (")
                    .append(strftime_int("%m", start.clone()))
                    .text(" - 1) / 3"),
            ),
            DateUnit::Year => Fragment::paren(years()),
        }
    }

    fn date_add(&self, date: Fragment, unit: DateUnit, amount: Fragment) -> Fragment {
        let (amount, modifier) = match unit {
            DateUnit::Millisecond => (amount.text(" / 1000.0"), "seconds"),
            DateUnit::Second => (amount, "seconds"),
            DateUnit::Minute => (amount, "minutes"),
            DateUnit::Hour => (amount, "hours"),
            DateUnit::Day => (amount, "days"),
            DateUnit::Week => (amount.text(" * 7"), "days"),
            DateUnit::Month => (amount, "months"),
            DateUnit::Quarter => (amount.text(" * 3"), "months"),
            DateUnit::Year => (amount, "years"),
        };
        let modifier = cast(Fragment::paren(amount), "TEXT").text(&format!(" || ' {}'", modifier));
        Fragment::call("strftime", vec![Fragment::raw(ISO_FORMAT), date, modifier])
    }

    fn array_length(&self, array: Fragment) -> Fragment {
        Fragment::call("json_array_length", vec![array])
    }

    fn array_element(&self, array: Fragment, index: Fragment) -> Fragment {
        let path = Fragment::raw("CASE WHEN ")
            .append(index.clone())
            .text(" < 0 THEN '$[#' || ")
            .append(index.clone())
            .text(" || ']' ELSE '$[' || ")
            .append(index)
            .text(" || ']' END");
        Fragment::call("json_extract", vec![array, path])
    }

    fn array_concat(&self, arrays: Vec<Fragment>) -> Fragment {
        if arrays.is_empty() {
            return Fragment::raw("json_array()");
        }
        let parts = arrays.into_iter().enumerate().map(|(i, array)| {
            Fragment::raw(format!("SELECT {} AS part, key, value, type FROM json_each(", i))
                .append(array)
                .text(")")
        });
        Fragment::raw("(SELECT json_group_array(")
            .append(self.extract(&Source::Element("_c".to_string()), &[], ExtractKind::Json))
            .text(") FROM (SELECT * FROM (")
            .append(Fragment::join(parts, " UNION ALL "))
            .text(") ORDER BY part, key) AS _c)")
    }

    fn array_slice(&self, array: Fragment, position: Option<Fragment>, count: Fragment) -> Fragment {
        let length = self.array_length(array.clone());
        let (start, count) = match position {
            None => (
                Fragment::raw("CASE WHEN ")
                    .append(count.clone())
                    .text(" < 0 THEN ")
                    .append(length)
                    .text(" + ")
                    .append(count.clone())
                    .text(" ELSE 0 END"),
                Fragment::call("abs", vec![count]),
            ),
            Some(position) => (
                Fragment::raw("CASE WHEN ")
                    .append(position.clone())
                    .text(" < 0 THEN max(")
                    .append(length)
                    .text(" + ")
                    .append(position.clone())
                    .text(", 0) ELSE ")
                    .append(position)
                    .text(" END"),
                count,
            ),
        };
        Fragment::raw("(SELECT json_group_array(")
            .append(self.extract(&Source::Element("_s".to_string()), &[], ExtractKind::Json))
            .text(") FROM json_each(")
            .append(array)
            .text(") AS _s WHERE _s.key >= ")
            .append(Fragment::paren(start.clone()))
            .text(" AND _s.key < ")
            .append(Fragment::paren(start))
            .text(" + ")
            .append(Fragment::paren(count))
            .text(")")
    }

    fn array_contains(&self, array: Fragment, value: Fragment) -> Fragment {
        Fragment::raw("EXISTS (SELECT 1 FROM json_each(")
            .append(array)
            .text(") AS _i WHERE _i.value = ")
            .append(value)
            .text(")")
    }

    fn array_any(&self, array: Fragment, alias: &str, predicate: Fragment) -> Fragment {
        Fragment::raw("EXISTS (SELECT 1 FROM json_each(")
            .append(array)
            .text(&format!(") AS {} WHERE ", alias))
            .append(predicate)
            .text(")")
    }

    fn array_filter(&self, array: Fragment, alias: &str, predicate: Fragment) -> Fragment {
        Fragment::raw("(SELECT json_group_array(")
            .append(self.extract(&Source::Element(alias.to_string()), &[], ExtractKind::Json))
            .text(") FROM json_each(")
            .append(array)
            .text(&format!(") AS {} WHERE ", alias))
            .append(predicate)
            .text(")")
    }

    fn array_map(&self, array: Fragment, alias: &str, value: Fragment) -> Fragment {
        Fragment::raw("(SELECT json_group_array(")
            .append(value)
            .text(") FROM json_each(")
            .append(array)
            .text(&format!(") AS {})", alias))
    }

    fn array_reduce(
        &self,
        _array: Fragment,
        _alias: &str,
        _accumulator: &str,
        _initial: Fragment,
        _step: Fragment,
    ) -> Option<Fragment> {
        None
    }

    fn aggregate_arg_kind(&self, op: AccumulatorOp) -> ExtractKind {
        match op {
            AccumulatorOp::Sum | AccumulatorOp::Avg => ExtractKind::Number,
            _ => ExtractKind::Json,
        }
    }

    fn aggregate(&self, op: AccumulatorOp, arg: Fragment) -> Option<(Fragment, ExtractKind)> {
        let group_array = |arg: Fragment| Fragment::call("json_group_array", vec![arg]);
        Some(match op {
            AccumulatorOp::Sum => (
                Fragment::call("COALESCE", vec![Fragment::call("SUM", vec![arg]), Fragment::raw("0")]),
                ExtractKind::Number,
            ),
            AccumulatorOp::Avg => (Fragment::call("AVG", vec![arg]), ExtractKind::Number),
            AccumulatorOp::Min => (Fragment::call("MIN", vec![arg]), ExtractKind::Json),
            AccumulatorOp::Max => (Fragment::call("MAX", vec![arg]), ExtractKind::Json),
            AccumulatorOp::First => (
                Fragment::call("json_extract", vec![group_array(arg), Fragment::raw("'$[0]'")]),
                ExtractKind::Json,
            ),
            AccumulatorOp::Last => (
                Fragment::call("json_extract", vec![group_array(arg), Fragment::raw("'$[#-1]'")]),
                ExtractKind::Json,
            ),
            AccumulatorOp::Push => (group_array(arg), ExtractKind::Json),
            AccumulatorOp::AddToSet => (
                Fragment::raw("json_group_array(DISTINCT ").append(arg).text(")"),
                ExtractKind::Json,
            ),
            AccumulatorOp::Count => (Fragment::raw("COUNT(*)"), ExtractKind::Integer),
            AccumulatorOp::StdDevPop | AccumulatorOp::StdDevSamp => return None,
        })
    }

    fn collect_documents(&self, doc: Fragment) -> Fragment {
        Fragment::call("json_group_array", vec![Fragment::call("json", vec![doc])])
    }

    fn count_all(&self) -> &'static str {
        "COUNT(*)"
    }

    fn lookup_strategy(&self) -> LookupStrategy {
        LookupStrategy::CorrelatedSubquery
    }

    fn unwind_join(
        &self,
        source: &Source,
        path: &[String],
        alias: &str,
        preserve_empty: bool,
        _with_index: bool,
    ) -> Fragment {
        let join = if preserve_empty { "LEFT JOIN" } else { "JOIN" };
        Fragment::raw(format!("{} json_each(", join))
            .append(self.container(source))
            .text(&format!(", {}) AS {} ON ", json_path(path), alias))
            .append(self.json_type(source, path))
            .text(" <> 'null'")
    }

    fn unwind_index(&self, alias: &str) -> Fragment {
        Fragment::raw(format!("{}.key", alias))
    }

    fn random(&self) -> &'static str {
        "RANDOM()"
    }

    fn limit_offset(&self, limit: Option<Fragment>, offset: Option<Fragment>) -> Fragment {
        match (limit, offset) {
            (None, None) => Fragment::new(),
            (Some(limit), None) => Fragment::raw("LIMIT ").append(limit),
            (Some(limit), Some(offset)) => Fragment::raw("LIMIT ")
                .append(limit)
                .text(" OFFSET ")
                .append(offset),
            (None, Some(offset)) => Fragment::raw("LIMIT -1 OFFSET ").append(offset),
        }
    }

    fn sort_kinds(&self) -> &'static [ExtractKind] {
        &[ExtractKind::Json]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    fn sql(fragment: Fragment) -> String {
        fragment.render(ParamStyle::Positional).0
    }

    #[test]
    fn test_extract() {
        let profile = SqliteProfile::new();
        let data = Source::Column("t.\"data\"".to_string());

        assert_eq!(
            sql(profile.extract(&data, &path(&["items", "price"]), ExtractKind::Number)),
            "json_extract(t.\"data\", '$.\"items\".\"price\"')"
        );
        assert_eq!(sql(profile.extract(&data, &[], ExtractKind::Json)), "json(t.\"data\")");
        assert_eq!(
            sql(profile.extract(&Source::Element("u0".to_string()), &[], ExtractKind::Number)),
            "u0.value"
        );
    }

    #[test]
    fn test_unwind_join() {
        let profile = SqliteProfile::new();
        let data = Source::Column("t.\"data\"".to_string());

        let join = sql(profile.unwind_join(&data, &path(&["items"]), "u0", false, false));
        assert!(join.starts_with("JOIN json_each(t.\"data\", '$.\"items\"') AS u0 ON "));

        let join = sql(profile.unwind_join(&data, &path(&["items"]), "u0", true, true));
        assert!(join.starts_with("LEFT JOIN json_each("));
        assert_eq!(sql(profile.unwind_index("u0")), "u0.key");
    }

    #[test]
    fn test_aggregates() {
        let profile = SqliteProfile::new();
        let (sum, kind) = profile.aggregate(AccumulatorOp::Sum, Fragment::raw("x")).unwrap();
        assert_eq!(sql(sum), "COALESCE(SUM(x), 0)");
        assert_eq!(kind, ExtractKind::Number);

        let (last, _) = profile.aggregate(AccumulatorOp::Last, Fragment::raw("x")).unwrap();
        assert_eq!(sql(last), "json_extract(json_group_array(x), '$[#-1]')");

        assert!(profile.aggregate(AccumulatorOp::StdDevPop, Fragment::raw("x")).is_none());
    }

    #[test]
    fn test_date_format() {
        assert_eq!(strftime_format("%Y-%m-%dT%H:%M:%S.%LZ").unwrap(), "%Y-%m-%dT%H:%M:%fZ");
        assert_eq!(strftime_format("%d/%m/%Y").unwrap(), "%d/%m/%Y");
        assert_eq!(strftime_format("%L"), Err("%L".to_string()));
        assert_eq!(strftime_format("%G"), Err("%G".to_string()));
    }

    #[test]
    fn test_json_param() {
        let profile = SqliteProfile::new();
        let (text, params) = profile
            .param(SqlParam::Json("[1,2]".to_string()))
            .render(ParamStyle::Positional);
        assert_eq!(text, "json(?)");
        assert_eq!(params.len(), 1);
    }
}
