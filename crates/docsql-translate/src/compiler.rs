//! Expression Compiler
//!
//! Compiles filter documents and aggregation expressions into SQL fragments.
//! Field references are resolved against a [`Scope`]: the document the
//! current SELECT level reads, plus the overrides earlier stages of the same
//! level introduced (computed fields, unwound elements, lookup results).
//! Every user value becomes a bound parameter inside the returned fragment.

use std::cell::Cell;

use docsql_dialect::{
    DatePart, DateUnit, DialectProfile, ExtractKind, Fragment, OperatorRegistry, SimplePattern,
    Source, SqlParam,
};
use docsql_ir::{BsonType, Clause, ElemMatch, ExprOp, Expression, FieldPath, Filter, Predicate};
use serde_json::Value;

use crate::TranslateError;

type Result<T> = std::result::Result<T, TranslateError>;

/// What a field path or variable is bound to inside a scope
#[derive(Debug, Clone)]
pub enum Binding {
    /// A whole document: an unwound element or a `$lookup` result array
    Source(Source),
    /// A computed value of the given kind
    Value(Fragment, ExtractKind),
    /// A `$function` marker literal (`Json` kind)
    Function(Fragment),
}

/// A field reference after override resolution
#[derive(Debug, Clone)]
pub enum Resolved {
    Path(Source, Vec<String>),
    Value(Fragment, ExtractKind),
}

#[derive(Debug, Clone)]
pub struct Scope {
    root: Source,
    overrides: Vec<(FieldPath, Binding)>,
    variables: Vec<(String, Binding)>,
    functions: Vec<FieldPath>,
}

impl Scope {
    pub fn new(root: Source) -> Self {
        Self {
            root,
            overrides: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn root(&self) -> &Source {
        &self.root
    }

    pub fn has_overrides(&self) -> bool {
        !self.overrides.is_empty()
    }

    pub fn bind_field(&mut self, path: FieldPath, binding: Binding) {
        self.functions.retain(|field| !field.starts_with(&path));
        if matches!(binding, Binding::Function(_)) {
            self.functions.push(path.clone());
        }
        self.overrides.push((path, binding));
    }

    pub fn bind_variable(&mut self, name: impl Into<String>, binding: Binding) {
        self.variables.push((name.into(), binding));
    }

    /// Fields holding `$function` markers
    pub fn function_fields(&self) -> &[FieldPath] {
        &self.functions
    }

    /// Record a field holding a `$function` marker below a computed value
    pub fn mark_function(&mut self, path: FieldPath) {
        if !self.functions.contains(&path) {
            self.functions.push(path);
        }
    }

    pub fn set_function_fields(&mut self, fields: Vec<FieldPath>) {
        self.functions = fields;
    }

    /// Fresh scope over `root`, keeping variables and `$function` fields
    pub fn rebase(&self, root: Source) -> Scope {
        Scope {
            root,
            overrides: Vec::new(),
            variables: self.variables.clone(),
            functions: self.functions.clone(),
        }
    }
}

pub struct Compiler<'a> {
    profile: &'a dyn DialectProfile,
    registry: &'a OperatorRegistry,
    aliases: Cell<usize>,
}

impl<'a> Compiler<'a> {
    pub fn new(profile: &'a dyn DialectProfile, registry: &'a OperatorRegistry) -> Self {
        Self {
            profile,
            registry,
            aliases: Cell::new(0),
        }
    }

    pub fn profile(&self) -> &'a dyn DialectProfile {
        self.profile
    }

    /// Statement-unique SQL alias
    pub fn next_alias(&self, prefix: &str) -> String {
        let n = self.aliases.get();
        self.aliases.set(n + 1);
        format!("{}{}", prefix, n)
    }

    pub fn check_operator(&self, operator: &str) -> Result<()> {
        Ok(self.registry.check(self.profile.dialect(), operator)?)
    }

    /// Check a stage form (`$project:exclude`) and report it as `stage`
    pub fn check_stage(&self, form: &str, stage: &str) -> Result<()> {
        if self.registry.supports(self.profile.dialect(), form) {
            Ok(())
        } else {
            Err(TranslateError::UnsupportedStage {
                dialect: self.profile.dialect(),
                stage: stage.to_string(),
            })
        }
    }

    pub(crate) fn unsupported(&self, operator: impl Into<String>) -> TranslateError {
        TranslateError::UnsupportedOperator {
            dialect: self.profile.dialect(),
            operator: operator.into(),
        }
    }

    // ---- resolution ----

    pub fn resolve(&self, path: &FieldPath, scope: &Scope) -> Result<Resolved> {
        // the field itself, anything below it, or a document containing it
        if let Some(field) = scope
            .functions
            .iter()
            .find(|field| path.starts_with(field) || field.starts_with(path))
        {
            return Err(TranslateError::InvalidPipeline(format!(
                "field '{}' is computed by $function and cannot be read by a later stage",
                field
            )));
        }
        Ok(self.lookup(path, scope))
    }

    /// Resolve without the `$function` check, for fields copied through as-is
    pub fn resolve_keep(&self, path: &FieldPath, scope: &Scope) -> Resolved {
        self.lookup(path, scope)
    }

    fn lookup(&self, path: &FieldPath, scope: &Scope) -> Resolved {
        for (field, binding) in scope.overrides.iter().rev() {
            if let Some(rest) = path.strip_prefix(field) {
                return self.bound(binding, rest.to_vec());
            }
            if field.starts_with(path) {
                // a later stage changed something below this path
                return Resolved::Path(self.current_document(scope), path.segments().to_vec());
            }
        }
        Resolved::Path(scope.root.clone(), path.segments().to_vec())
    }

    fn bound(&self, binding: &Binding, rest: Vec<String>) -> Resolved {
        match binding {
            Binding::Source(source) => Resolved::Path(source.clone(), rest),
            Binding::Value(value, kind) if rest.is_empty() => Resolved::Value(value.clone(), *kind),
            Binding::Function(marker) if rest.is_empty() => {
                Resolved::Value(marker.clone(), ExtractKind::Json)
            }
            Binding::Value(value, kind) => {
                let json = self.profile.coerce(value.clone(), *kind, ExtractKind::Json);
                Resolved::Path(Source::Json(self.profile.to_json_text(json)), rest)
            }
            Binding::Function(marker) => {
                Resolved::Path(Source::Json(self.profile.to_json_text(marker.clone())), rest)
            }
        }
    }

    fn resolve_variable(
        &self,
        name: &str,
        path: Option<&FieldPath>,
        scope: &Scope,
    ) -> Result<Resolved> {
        if name == "ROOT" || name == "CURRENT" {
            return match path {
                Some(path) => self.resolve(path, scope),
                None => Ok(Resolved::Path(self.current_document(scope), Vec::new())),
            };
        }
        let binding = scope
            .variables
            .iter()
            .rev()
            .find(|(bound, _)| bound == name)
            .map(|(_, binding)| binding)
            .ok_or_else(|| TranslateError::InvalidPipeline(format!("undefined variable $${}", name)))?;
        let rest = path.map(|p| p.segments().to_vec()).unwrap_or_default();
        Ok(self.bound(binding, rest))
    }

    /// The whole current document with every override applied
    pub fn current_document(&self, scope: &Scope) -> Source {
        if scope.overrides.is_empty() {
            scope.root.clone()
        } else {
            Source::Json(self.materialize(scope))
        }
    }

    /// JSON text of the current document
    pub fn materialize(&self, scope: &Scope) -> Fragment {
        let base = self.profile.json_text(&scope.root, &[]);
        let sets = scope
            .overrides
            .iter()
            .map(|(path, binding)| (path.segments().to_vec(), self.binding_json(binding)))
            .collect();
        self.profile.set_paths(base, sets)
    }

    fn binding_json(&self, binding: &Binding) -> Fragment {
        match binding {
            Binding::Source(source) => self.profile.extract(source, &[], ExtractKind::Json),
            Binding::Value(value, kind) => self.profile.coerce(value.clone(), *kind, ExtractKind::Json),
            Binding::Function(marker) => marker.clone(),
        }
    }

    pub fn value_of(&self, operand: &Resolved, kind: ExtractKind) -> Fragment {
        match operand {
            Resolved::Path(source, path) => self.profile.extract(source, path, kind),
            Resolved::Value(value, from) => self.profile.coerce(value.clone(), *from, kind),
        }
    }

    pub fn json_text_of(&self, operand: &Resolved) -> Fragment {
        match operand {
            Resolved::Path(source, path) => self.profile.json_text(source, path),
            Resolved::Value(value, kind) => self
                .profile
                .to_json_text(self.profile.coerce(value.clone(), *kind, ExtractKind::Json)),
        }
    }

    fn type_of(&self, operand: &Resolved) -> Fragment {
        match operand {
            Resolved::Path(source, path) => self.profile.json_type(source, path),
            value => self
                .profile
                .json_type(&Source::Json(self.json_text_of(value)), &[]),
        }
    }

    fn exists_of(&self, operand: &Resolved) -> Fragment {
        match operand {
            Resolved::Path(source, path) => self.profile.exists(source, path),
            Resolved::Value(value, kind) => Fragment::paren(
                self.profile
                    .coerce(value.clone(), *kind, ExtractKind::Json)
                    .text(" IS NOT NULL"),
            ),
        }
    }

    // ---- values ----

    /// Bind a JSON literal as `kind`
    pub fn literal(&self, value: &Value, kind: ExtractKind) -> Fragment {
        let natural = ExtractKind::of_value(value);
        match value {
            Value::Null => self.profile.null(),
            _ if kind == ExtractKind::Json || natural == ExtractKind::Json => {
                let json = self.profile.json_literal(value);
                self.profile.coerce(json, ExtractKind::Json, kind)
            }
            _ => {
                let param = self.profile.param(SqlParam::from_json(value));
                self.profile.coerce(param, natural, kind)
            }
        }
    }

    pub fn compile_value(&self, expr: &Expression, scope: &Scope, kind: ExtractKind) -> Result<Fragment> {
        match expr {
            Expression::FieldRef(path) => Ok(self.value_of(&self.resolve(path, scope)?, kind)),
            Expression::Variable { name, path } => {
                Ok(self.value_of(&self.resolve_variable(name, path.as_ref(), scope)?, kind))
            }
            Expression::Literal(value) => Ok(self.literal(value, kind)),
            other => {
                let (value, from) = self.compile_expr(other, scope)?;
                Ok(self.profile.coerce(value, from, kind))
            }
        }
    }

    /// JSON text of an expression's value, for array and type operators
    pub fn compile_json_text(&self, expr: &Expression, scope: &Scope) -> Result<Fragment> {
        match expr {
            Expression::FieldRef(path) => Ok(self.json_text_of(&self.resolve(path, scope)?)),
            Expression::Variable { name, path } => {
                Ok(self.json_text_of(&self.resolve_variable(name, path.as_ref(), scope)?))
            }
            other => {
                let value = self.compile_value(other, scope, ExtractKind::Json)?;
                Ok(self.profile.to_json_text(value))
            }
        }
    }

    pub fn compile_condition(&self, expr: &Expression, scope: &Scope) -> Result<Fragment> {
        self.compile_value(expr, scope, ExtractKind::Bool)
    }

    /// Compile to the expression's natural kind
    pub fn compile_expr(&self, expr: &Expression, scope: &Scope) -> Result<(Fragment, ExtractKind)> {
        let json = ExtractKind::Json;
        match expr {
            Expression::FieldRef(_) | Expression::Variable { .. } => {
                Ok((self.compile_value(expr, scope, json)?, json))
            }
            Expression::Literal(value) => {
                let kind = match value {
                    Value::String(_) | Value::Number(_) | Value::Bool(_) => ExtractKind::of_value(value),
                    _ => json,
                };
                Ok((self.literal(value, kind), kind))
            }
            Expression::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.compile_value(item, scope, json))
                    .collect::<Result<Vec<_>>>()?;
                Ok((self.profile.build_array(items), json))
            }
            Expression::Object(fields) => {
                let fields = fields
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), self.compile_value(value, scope, json)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok((self.profile.build_object(fields), json))
            }
            Expression::Operator { op, args } => self.compile_operator(*op, args, scope),
            Expression::Cond {
                condition,
                then,
                otherwise,
            } => {
                self.check_operator("$cond")?;
                let condition = self.compile_condition(condition, scope)?;
                let (then, otherwise, kind) =
                    self.unify(self.compile_expr(then, scope)?, self.compile_expr(otherwise, scope)?);
                Ok((case_when(vec![(condition, then)], Some(otherwise)), kind))
            }
            Expression::Switch { branches, default } => {
                self.check_operator("$switch")?;
                let mut compiled = Vec::with_capacity(branches.len());
                for (case, value) in branches {
                    compiled.push((self.compile_condition(case, scope)?, self.compile_expr(value, scope)?));
                }
                let default = default
                    .as_ref()
                    .map(|value| self.compile_expr(value, scope))
                    .transpose()?;

                let mut kinds = compiled
                    .iter()
                    .map(|(_, (_, kind))| *kind)
                    .chain(default.iter().map(|(_, kind)| *kind));
                let first = kinds.next().unwrap_or(json);
                let kind = if kinds.all(|k| k == first) { first } else { json };

                let whens = compiled
                    .into_iter()
                    .map(|(case, (value, from))| (case, self.profile.coerce(value, from, kind)))
                    .collect();
                let default = default.map(|(value, from)| self.profile.coerce(value, from, kind));
                Ok((case_when(whens, default), kind))
            }
            Expression::Filter { input, var, cond } => {
                self.check_operator("$filter")?;
                let array = self.compile_json_text(input, scope)?;
                let alias = self.next_alias("x");
                let mut inner = scope.clone();
                inner.bind_variable(var.clone(), Binding::Source(Source::Element(alias.clone())));
                let predicate = self.compile_condition(cond, &inner)?;
                Ok((self.profile.array_filter(array, &alias, predicate), json))
            }
            Expression::Map { input, var, expr } => {
                self.check_operator("$map")?;
                let array = self.compile_json_text(input, scope)?;
                let alias = self.next_alias("x");
                let mut inner = scope.clone();
                inner.bind_variable(var.clone(), Binding::Source(Source::Element(alias.clone())));
                let value = self.compile_value(expr, &inner, json)?;
                Ok((self.profile.array_map(array, &alias, value), json))
            }
            Expression::Reduce { input, initial, expr } => {
                self.check_operator("$reduce")?;
                let array = self.compile_json_text(input, scope)?;
                let initial = self.compile_value(initial, scope, json)?;
                let element = self.next_alias("x");
                let accumulator = self.next_alias("acc");
                let mut inner = scope.clone();
                inner.bind_variable("this", Binding::Source(Source::Element(element.clone())));
                inner.bind_variable("value", Binding::Source(Source::Element(accumulator.clone())));
                let step = self.compile_value(expr, &inner, json)?;
                let folded = self
                    .profile
                    .array_reduce(array, &element, &accumulator, initial, step)
                    .ok_or_else(|| self.unsupported("$reduce"))?;
                Ok((folded, json))
            }
            Expression::DateToString { date, format } => {
                self.check_operator("$dateToString")?;
                let date = self.compile_value(date, scope, ExtractKind::Text)?;
                let formatted = self
                    .profile
                    .date_format(date, format)
                    .map_err(|spec| self.unsupported(format!("$dateToString {}", spec)))?;
                Ok((formatted, ExtractKind::Text))
            }
            Expression::Function(_) => Err(TranslateError::InvalidPipeline(
                "$function may only be used as the whole value of a field in $addFields or $project"
                    .to_string(),
            )),
        }
    }

    fn unify(
        &self,
        a: (Fragment, ExtractKind),
        b: (Fragment, ExtractKind),
    ) -> (Fragment, Fragment, ExtractKind) {
        if a.1 == b.1 {
            return (a.0, b.0, a.1);
        }
        let json = ExtractKind::Json;
        (
            self.profile.coerce(a.0, a.1, json),
            self.profile.coerce(b.0, b.1, json),
            json,
        )
    }

    fn compile_operator(
        &self,
        op: ExprOp,
        args: &[Expression],
        scope: &Scope,
    ) -> Result<(Fragment, ExtractKind)> {
        use ExprOp::*;
        use ExtractKind::{Bool, Integer, Json, Number, Text};

        self.check_operator(op.name())?;

        let nth = |i: usize| -> Result<&Expression> {
            args.get(i).ok_or_else(|| {
                TranslateError::InvalidPipeline(format!("{} is missing argument {}", op, i + 1))
            })
        };
        let each = |kind: ExtractKind| -> Result<Vec<Fragment>> {
            args.iter().map(|arg| self.compile_value(arg, scope, kind)).collect()
        };
        let arg = |i: usize, kind: ExtractKind| -> Result<Fragment> {
            self.compile_value(nth(i)?, scope, kind)
        };
        let array = |i: usize| -> Result<Fragment> { self.compile_json_text(nth(i)?, scope) };
        let call = |compiled: Vec<Fragment>, kind: ExtractKind| -> Result<(Fragment, ExtractKind)> {
            self.profile
                .function(op, compiled)
                .map(|f| (f, kind))
                .ok_or_else(|| self.unsupported(op.name()))
        };

        match op {
            Add | Subtract | Multiply | Divide | Mod | Abs | Ceil | Floor | Sqrt | Pow => {
                call(each(Number)?, Number)
            }
            Round | Trunc => {
                let mut compiled = vec![arg(0, Number)?];
                if args.len() > 1 {
                    compiled.push(arg(1, Integer)?);
                }
                call(compiled, Number)
            }
            Eq | Ne | Gt | Gte | Lt | Lte => self.compare(op, nth(0)?, nth(1)?, scope),
            Cmp => {
                let (a, b) = self.comparison_operands(op, nth(0)?, nth(1)?, scope)?;
                let cmp = case_when(
                    vec![
                        (a.clone().text(" < ").append(b.clone()), Fragment::raw("-1")),
                        (a.text(" > ").append(b), Fragment::raw("1")),
                    ],
                    Some(Fragment::raw("0")),
                );
                Ok((cmp, Integer))
            }
            And | Or => {
                if args.is_empty() {
                    return Ok((self.profile.bool_literal(op == And), Bool));
                }
                let separator = if op == And { " AND " } else { " OR " };
                let conditions = each(Bool)?.into_iter().map(Fragment::paren);
                Ok((Fragment::paren(Fragment::join(conditions, separator)), Bool))
            }
            Not => Ok((self.not_true(arg(0, Bool)?), Bool)),
            IfNull => Ok((self.profile.if_null(each(Json)?), Json)),
            Concat | ToUpper | ToLower | Trim => call(each(Text)?, Text),
            Substr => call(vec![arg(0, Text)?, arg(1, Integer)?, arg(2, Integer)?], Text),
            StrLen => call(each(Text)?, Integer),
            Split => call(each(Text)?, Json),
            RegexMatch => {
                let pattern = constant_string(nth(1)?, op, "regex")?;
                let options = constant_string(nth(2)?, op, "options")?;
                let matched = self.compile_pattern(arg(0, Text)?, &pattern, &options, op.name())?;
                Ok((matched, Bool))
            }
            ToInt | ToLong => call(each(Json)?, Integer),
            ToDouble | ToDecimal => call(each(Json)?, Number),
            ToString => call(each(Json)?, Text),
            ToBool => call(each(Json)?, Bool),
            Year => Ok((self.profile.date_part(DatePart::Year, arg(0, Text)?), Integer)),
            Month => Ok((self.profile.date_part(DatePart::Month, arg(0, Text)?), Integer)),
            DayOfMonth => Ok((self.profile.date_part(DatePart::DayOfMonth, arg(0, Text)?), Integer)),
            Hour => Ok((self.profile.date_part(DatePart::Hour, arg(0, Text)?), Integer)),
            Minute => Ok((self.profile.date_part(DatePart::Minute, arg(0, Text)?), Integer)),
            Second => Ok((self.profile.date_part(DatePart::Second, arg(0, Text)?), Integer)),
            DayOfWeek => Ok((self.profile.date_part(DatePart::DayOfWeek, arg(0, Text)?), Integer)),
            DayOfYear => Ok((self.profile.date_part(DatePart::DayOfYear, arg(0, Text)?), Integer)),
            DateFromString => Ok((self.profile.date_parse(arg(0, Text)?), Text)),
            DateDiff => {
                let unit = date_unit(nth(2)?, op)?;
                Ok((self.profile.date_diff(arg(0, Text)?, arg(1, Text)?, unit), Integer))
            }
            DateAdd | DateSubtract => {
                let unit = date_unit(nth(1)?, op)?;
                let mut amount = arg(2, Number)?;
                if op == DateSubtract {
                    amount = Fragment::paren(Fragment::raw("-").append(amount));
                }
                Ok((self.profile.date_add(arg(0, Text)?, unit, amount), Text))
            }
            Size => Ok((self.profile.array_length(array(0)?), Integer)),
            ArrayElemAt => Ok((self.profile.array_element(array(0)?, arg(1, Integer)?), Json)),
            First => Ok((self.profile.array_element(array(0)?, Fragment::raw("0")), Json)),
            Last => Ok((self.profile.array_element(array(0)?, Fragment::raw("-1")), Json)),
            ConcatArrays => {
                let arrays = (0..args.len()).map(|i| array(i)).collect::<Result<Vec<_>>>()?;
                Ok((self.profile.array_concat(arrays), Json))
            }
            Slice => {
                let sliced = if args.len() == 3 {
                    self.profile
                        .array_slice(array(0)?, Some(arg(1, Integer)?), arg(2, Integer)?)
                } else {
                    self.profile.array_slice(array(0)?, None, arg(1, Integer)?)
                };
                Ok((sliced, Json))
            }
            In => Ok((self.profile.array_contains(array(1)?, arg(0, Json)?), Bool)),
            IsArray => {
                let ty = self.expression_type(nth(0)?, scope)?;
                Ok((self.type_in(ty, self.profile.type_names(BsonType::Array)), Bool))
            }
        }
    }

    /// Operands of an expression comparison, compiled to a common kind
    fn comparison_operands(
        &self,
        op: ExprOp,
        left: &Expression,
        right: &Expression,
        scope: &Scope,
    ) -> Result<(Fragment, Fragment)> {
        let constant = [left, right].into_iter().find_map(|e| match e {
            Expression::Literal(value) if !value.is_null() => Some(value),
            _ => None,
        });
        let kind = match constant {
            Some(value) => literal_kind(value),
            None if op == ExprOp::Eq || op == ExprOp::Ne => ExtractKind::Json,
            None if self.profile.typed_extraction() => ExtractKind::Number,
            None => ExtractKind::Json,
        };
        Ok((
            self.compile_value(left, scope, kind)?,
            self.compile_value(right, scope, kind)?,
        ))
    }

    fn compare(
        &self,
        op: ExprOp,
        left: &Expression,
        right: &Expression,
        scope: &Scope,
    ) -> Result<(Fragment, ExtractKind)> {
        let null_side = match (left.is_null_literal(), right.is_null_literal()) {
            (true, false) => Some(right),
            (false, true) => Some(left),
            _ => None,
        };
        if let (Some(other), ExprOp::Eq | ExprOp::Ne) = (null_side, op) {
            let value = self.compile_value(other, scope, ExtractKind::Json)?;
            let test = if op == ExprOp::Eq { " IS NULL" } else { " IS NOT NULL" };
            return Ok((Fragment::paren(value.text(test)), ExtractKind::Bool));
        }

        let (a, b) = self.comparison_operands(op, left, right, scope)?;
        let sql_op = match op {
            ExprOp::Eq => " = ",
            ExprOp::Ne => " <> ",
            ExprOp::Gt => " > ",
            ExprOp::Gte => " >= ",
            ExprOp::Lt => " < ",
            _ => " <= ",
        };
        Ok((Fragment::paren(a.text(sql_op).append(b)), ExtractKind::Bool))
    }

    fn expression_type(&self, expr: &Expression, scope: &Scope) -> Result<Fragment> {
        match expr {
            Expression::FieldRef(path) => Ok(self.type_of(&self.resolve(path, scope)?)),
            Expression::Variable { name, path } => {
                Ok(self.type_of(&self.resolve_variable(name, path.as_ref(), scope)?))
            }
            other => {
                let text = self.compile_json_text(other, scope)?;
                Ok(self.profile.json_type(&Source::Json(text), &[]))
            }
        }
    }

    /// `(ty IN ('a', 'b'))`
    fn type_in(&self, ty: Fragment, names: &[&str]) -> Fragment {
        let names: Vec<String> = names.iter().map(|name| format!("'{}'", name)).collect();
        Fragment::paren(ty.text(&format!(" IN ({})", names.join(", "))))
    }

    /// True unless `condition` holds; NULL counts as false
    fn not_true(&self, condition: Fragment) -> Fragment {
        Fragment::paren(
            Fragment::raw("NOT ").append(
                self.profile
                    .if_null(vec![Fragment::paren(condition), self.profile.bool_literal(false)]),
            ),
        )
    }

    /// Regex match, as LIKE/GLOB when the pattern is simple enough
    pub fn compile_pattern(
        &self,
        subject: Fragment,
        pattern: &str,
        options: &str,
        operator: &str,
    ) -> Result<Fragment> {
        if options.chars().all(|c| c == 'i') {
            if let Some(simple) = SimplePattern::parse(pattern) {
                return Ok(self.profile.like(subject, &simple, options.contains('i')));
            }
        }
        self.profile
            .regex(subject, pattern, options)
            .ok_or_else(|| self.unsupported(operator))
    }

    // ---- filters ----

    pub fn compile_filter(&self, filter: &Filter, scope: &Scope) -> Result<Fragment> {
        if filter.is_empty() {
            return Ok(Fragment::raw("1=1"));
        }
        let clauses = filter
            .clauses
            .iter()
            .map(|clause| self.compile_clause(clause, scope))
            .collect::<Result<Vec<_>>>()?;
        Ok(all_of(clauses))
    }

    fn compile_clause(&self, clause: &Clause, scope: &Scope) -> Result<Fragment> {
        match clause {
            Clause::Field { path, predicates } => {
                let operand = self.resolve(path, scope)?;
                let compiled = predicates
                    .iter()
                    .map(|predicate| self.compile_predicate(&operand, predicate))
                    .collect::<Result<Vec<_>>>()?;
                Ok(all_of(compiled))
            }
            Clause::And(filters) => self.combine(filters, scope, " AND "),
            Clause::Or(filters) => self.combine(filters, scope, " OR "),
            Clause::Nor(filters) => Ok(self.not_true(self.combine(filters, scope, " OR ")?)),
            Clause::Expr(expr) => self.compile_condition(expr, scope),
        }
    }

    fn combine(&self, filters: &[Filter], scope: &Scope, separator: &str) -> Result<Fragment> {
        let parts = filters
            .iter()
            .map(|filter| self.compile_filter(filter, scope).map(Fragment::paren))
            .collect::<Result<Vec<_>>>()?;
        Ok(Fragment::paren(Fragment::join(parts, separator)))
    }

    fn compile_predicate(&self, operand: &Resolved, predicate: &Predicate) -> Result<Fragment> {
        let profile = self.profile;
        let fragment = match predicate {
            Predicate::Eq(value) => self.equals(operand, value),
            Predicate::Ne(Value::Null) => Fragment::paren(
                self.value_of(operand, ExtractKind::Json).text(" IS NOT NULL"),
            ),
            Predicate::Ne(value) => self.not_true(self.equals(operand, value)),
            Predicate::Gt(value) => self.ordering(operand, " > ", value),
            Predicate::Gte(value) => self.ordering(operand, " >= ", value),
            Predicate::Lt(value) => self.ordering(operand, " < ", value),
            Predicate::Lte(value) => self.ordering(operand, " <= ", value),
            Predicate::In(values) => self.membership(operand, values),
            Predicate::Nin(values) if values.is_empty() => Fragment::raw("1=1"),
            Predicate::Nin(values) => self.not_true(self.membership(operand, values)),
            Predicate::Exists(true) => self.exists_of(operand),
            Predicate::Exists(false) => {
                Fragment::paren(Fragment::raw("NOT ").append(self.exists_of(operand)))
            }
            Predicate::Regex { pattern, options } => {
                let subject = self.value_of(operand, ExtractKind::Text);
                let matched = self.compile_pattern(subject, pattern, options, "$regex")?;
                self.type_guarded(operand, BsonType::String, matched)
            }
            Predicate::Type(types) => {
                let mut names: Vec<&str> = Vec::new();
                for ty in types {
                    for name in profile.type_names(*ty) {
                        if !names.contains(name) {
                            names.push(*name);
                        }
                    }
                }
                self.type_in(self.type_of(operand), &names)
            }
            Predicate::Size(size) => {
                let is_array = self.type_in(self.type_of(operand), profile.type_names(BsonType::Array));
                let size = i64::try_from(*size).unwrap_or(i64::MAX);
                let length = profile
                    .array_length(self.json_text_of(operand))
                    .text(" = ")
                    .append(profile.param(SqlParam::Int(size)));
                Fragment::paren(is_array.text(" AND ").append(length))
            }
            Predicate::Not(predicates) => {
                let inner = predicates
                    .iter()
                    .map(|p| self.compile_predicate(operand, p))
                    .collect::<Result<Vec<_>>>()?;
                self.not_true(all_of(inner))
            }
            Predicate::All(values) if values.is_empty() => Fragment::raw("1=0"),
            Predicate::All(values) => {
                let array = self.json_text_of(operand);
                let contains = values
                    .iter()
                    .map(|v| profile.array_contains(array.clone(), self.literal(v, ExtractKind::Json)))
                    .collect();
                all_of(contains)
            }
            Predicate::ElemMatch(elem_match) => {
                let alias = self.next_alias("e");
                let element = Source::Element(alias.clone());
                let condition = match elem_match.as_ref() {
                    ElemMatch::Scalar(predicates) => {
                        let element = Resolved::Path(element, Vec::new());
                        let compiled = predicates
                            .iter()
                            .map(|p| self.compile_predicate(&element, p))
                            .collect::<Result<Vec<_>>>()?;
                        all_of(compiled)
                    }
                    ElemMatch::Document(filter) => self.compile_filter(filter, &Scope::new(element))?,
                };
                profile.array_any(self.json_text_of(operand), &alias, condition)
            }
            Predicate::Mod { divisor, remainder } => {
                let modulo = Fragment::raw("(")
                    .append(self.value_of(operand, ExtractKind::Integer))
                    .text(" % ")
                    .append(profile.param(SqlParam::Int(*divisor)))
                    .text(") = ")
                    .append(profile.param(SqlParam::Int(*remainder)));
                self.type_guarded(operand, BsonType::Number, modulo)
            }
        };
        Ok(fragment)
    }

    /// Equality with Mongo null semantics (null matches missing)
    fn equals(&self, operand: &Resolved, value: &Value) -> Fragment {
        let json = ExtractKind::Json;
        match value {
            Value::Null => Fragment::paren(self.value_of(operand, json).text(" IS NULL")),
            Value::Array(_) | Value::Object(_) => Fragment::paren(
                self.value_of(operand, json)
                    .text(" = ")
                    .append(self.literal(value, json)),
            ),
            scalar => {
                let kind = self.operand_kind(operand, scalar);
                Fragment::paren(
                    self.value_of(operand, kind)
                        .text(" = ")
                        .append(self.literal(scalar, kind)),
                )
            }
        }
    }

    /// Range comparison; dynamically typed dialects get a type bracket so
    /// strings never compare against numbers
    fn ordering(&self, operand: &Resolved, op: &str, value: &Value) -> Fragment {
        let json = ExtractKind::Json;
        match value {
            Value::Null if op.contains('=') => {
                Fragment::paren(self.value_of(operand, json).text(" IS NULL"))
            }
            Value::Null => Fragment::raw("1=0"),
            Value::Array(_) | Value::Object(_) => Fragment::paren(
                self.value_of(operand, json)
                    .text(op)
                    .append(self.literal(value, json)),
            ),
            scalar => {
                let kind = self.operand_kind(operand, scalar);
                let comparison = self
                    .value_of(operand, kind)
                    .text(op)
                    .append(self.literal(scalar, kind));
                let ty = match scalar {
                    Value::String(_) => BsonType::String,
                    Value::Bool(_) => BsonType::Bool,
                    _ => BsonType::Number,
                };
                self.type_guarded(operand, ty, comparison)
            }
        }
    }

    /// `$in`: one `IN` list per extraction kind, exactly one placeholder per
    /// scalar value
    fn membership(&self, operand: &Resolved, values: &[Value]) -> Fragment {
        if values.is_empty() {
            return Fragment::raw("1=0");
        }
        let json = ExtractKind::Json;
        let mut groups: Vec<(ExtractKind, Vec<Fragment>)> = Vec::new();
        let mut alternatives = Vec::new();
        let mut matches_null = false;

        for value in values {
            match value {
                Value::Null => matches_null = true,
                Value::Array(_) | Value::Object(_) => alternatives.push(Fragment::paren(
                    self.value_of(operand, json)
                        .text(" = ")
                        .append(self.literal(value, json)),
                )),
                scalar => {
                    let kind = if self.profile.typed_extraction() {
                        literal_kind(scalar)
                    } else {
                        // one list, compared natively
                        self.operand_kind(operand, &Value::Null)
                    };
                    let param = self.profile.param(SqlParam::from_json(scalar));
                    match groups.iter_mut().find(|(k, _)| *k == kind) {
                        Some((_, params)) => params.push(param),
                        None => groups.push((kind, vec![param])),
                    }
                }
            }
        }

        let mut clauses: Vec<Fragment> = groups
            .into_iter()
            .map(|(kind, params)| {
                Fragment::paren(
                    self.value_of(operand, kind)
                        .text(" IN (")
                        .append(Fragment::join(params, ", "))
                        .text(")"),
                )
            })
            .collect();
        clauses.extend(alternatives);
        if matches_null {
            clauses.push(Fragment::paren(self.value_of(operand, json).text(" IS NULL")));
        }

        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Fragment::paren(Fragment::join(clauses, " OR "))
        }
    }

    /// Extraction kind for comparing against `literal`. Untyped dialects
    /// compare values natively, so computed values keep their own kind and
    /// paths take the literal's.
    fn operand_kind(&self, operand: &Resolved, literal: &Value) -> ExtractKind {
        if self.profile.typed_extraction() {
            return literal_kind(literal);
        }
        match operand {
            Resolved::Value(_, kind) => *kind,
            Resolved::Path(..) => match ExtractKind::of_value(literal) {
                ExtractKind::Json => ExtractKind::Text,
                kind => kind,
            },
        }
    }

    fn type_guarded(&self, operand: &Resolved, ty: BsonType, condition: Fragment) -> Fragment {
        if self.profile.typed_extraction() {
            return Fragment::paren(condition);
        }
        let guard = self.type_in(self.type_of(operand), self.profile.type_names(ty));
        Fragment::paren(guard.text(" AND ").append(condition))
    }

    // ---- documents ----

    /// Object built from dotted paths, nesting shared prefixes
    pub fn nested_object(&self, entries: Vec<(Vec<String>, Fragment)>) -> Fragment {
        enum Entry {
            Leaf(Fragment),
            Nested(Vec<(Vec<String>, Fragment)>),
        }

        let mut fields: Vec<(String, Entry)> = Vec::new();
        for (mut path, value) in entries {
            if path.is_empty() {
                continue;
            }
            let head = path.remove(0);
            let existing = fields.iter_mut().find(|(key, _)| *key == head);
            match (existing, path.is_empty()) {
                (Some((_, Entry::Nested(children))), false) => children.push((path, value)),
                (Some((_, entry)), true) => *entry = Entry::Leaf(value),
                (Some((_, entry)), false) => *entry = Entry::Nested(vec![(path, value)]),
                (None, true) => fields.push((head, Entry::Leaf(value))),
                (None, false) => fields.push((head, Entry::Nested(vec![(path, value)]))),
            }
        }

        let built = fields
            .into_iter()
            .map(|(key, entry)| match entry {
                Entry::Leaf(value) => (key, value),
                Entry::Nested(children) => (key, self.nested_object(children)),
            })
            .collect();
        self.profile.build_object(built)
    }
}

/// Kind used to compare against a literal; integers compare as numbers so
/// `1` matches `1.0`
fn literal_kind(value: &Value) -> ExtractKind {
    match ExtractKind::of_value(value) {
        ExtractKind::Integer => ExtractKind::Number,
        other => other,
    }
}

fn all_of(mut parts: Vec<Fragment>) -> Fragment {
    match parts.len() {
        0 => Fragment::raw("1=1"),
        1 => parts.remove(0),
        _ => Fragment::join(parts.into_iter().map(Fragment::paren), " AND "),
    }
}

fn case_when(branches: Vec<(Fragment, Fragment)>, otherwise: Option<Fragment>) -> Fragment {
    let mut case = Fragment::raw("CASE");
    for (condition, value) in branches {
        case = case.text(" WHEN ").append(condition).text(" THEN ").append(value);
    }
    if let Some(otherwise) = otherwise {
        case = case.text(" ELSE ").append(otherwise);
    }
    case.text(" END")
}

fn constant_string(expr: &Expression, op: ExprOp, what: &str) -> Result<String> {
    match expr {
        Expression::Literal(Value::String(s)) => Ok(s.clone()),
        _ => Err(TranslateError::InvalidPipeline(format!(
            "{} '{}' must be a constant string",
            op, what
        ))),
    }
}

fn date_unit(expr: &Expression, op: ExprOp) -> Result<DateUnit> {
    match expr {
        Expression::Literal(Value::String(unit)) => DateUnit::from_name(unit).ok_or_else(|| {
            TranslateError::InvalidPipeline(format!("{} has unknown unit '{}'", op, unit))
        }),
        _ => Err(TranslateError::InvalidPipeline(format!(
            "{} unit must be a constant unit name",
            op
        ))),
    }
}
