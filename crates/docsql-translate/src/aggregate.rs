//! Aggregation Translator
//!
//! Stages are folded left to right into a [`SelectLevel`]: one SELECT with
//! its FROM source, joins, WHERE, GROUP BY, ORDER BY and LIMIT/OFFSET. When
//! a stage cannot be expressed in the current level without changing its
//! meaning (a `$match` after a `$limit`, a `$sort` after a `$group`), the
//! level is sealed into a CTE and a new level starts over it. Every level
//! exposes the document as a single `data` column, plus an `ord` column when
//! it was sorted so the order survives the seal.

use docsql_dialect::{
    Dialect, DialectProfile, ExtractKind, Fragment, LookupStrategy, OperatorRegistry, Source,
    SqlParam,
};
use docsql_ir::{
    AccumulatorOp, Expression, FieldPath, FunctionMarker, Group, Lookup, Pipeline, ProjectField,
    Projection, SortKey, Stage, Unwind,
};
use serde_json::Value;
use tracing::debug;

use crate::compiler::{Binding, Compiler, Resolved, Scope};
use crate::optimizer::Optimizer;
use crate::{TranslateError, TranslatedAggregate, TranslatedQuery, TranslatorOptions};

type Result<T> = std::result::Result<T, TranslateError>;

pub struct AggregationTranslator {
    profile: Box<dyn DialectProfile>,
    registry: OperatorRegistry,
    optimizer: Optimizer,
    options: TranslatorOptions,
}

impl AggregationTranslator {
    pub fn new(dialect: Dialect, options: TranslatorOptions) -> Self {
        Self {
            profile: dialect.profile(options.typed_params),
            registry: OperatorRegistry::default(),
            optimizer: Optimizer::with_defaults(),
            options,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.profile.dialect()
    }

    pub fn options(&self) -> &TranslatorOptions {
        &self.options
    }

    /// Mark an operator or stage form as unavailable, for engines older
    /// than the profile assumes
    pub fn register_gap(&mut self, operator: &'static str) {
        self.registry.register_gap(self.profile.dialect(), operator);
    }

    /// Translate a pipeline given as its JSON array form
    pub fn translate(&self, collection: &str, pipeline: &Value) -> Result<TranslatedAggregate> {
        let pipeline = Pipeline::from_json(pipeline)
            .map_err(|err| TranslateError::from_parse(self.dialect(), err))?;
        self.translate_pipeline(collection, pipeline)
    }

    pub fn translate_pipeline(
        &self,
        collection: &str,
        pipeline: Pipeline,
    ) -> Result<TranslatedAggregate> {
        let fingerprint = pipeline.fingerprint();
        let mut stages = self.optimizer.optimize(pipeline).stages;

        if let Some(position) = stages.iter().position(|s| matches!(s, Stage::Facet(_))) {
            if position + 1 != stages.len() {
                return Err(TranslateError::InvalidPipeline(
                    "$facet must be the last stage of a pipeline".to_string(),
                ));
            }
        }

        let translated = match stages.pop() {
            Some(Stage::Facet(facets)) => {
                let mut queries = Vec::with_capacity(facets.len());
                for (name, facet) in facets {
                    let mut facet_stages = stages.clone();
                    facet_stages.extend(facet.stages);
                    queries.push((name, self.translate_stages(collection, &facet_stages)?));
                }
                TranslatedAggregate::Facet(queries)
            }
            last => {
                stages.extend(last);
                TranslatedAggregate::Single(self.translate_stages(collection, &stages)?)
            }
        };

        for query in translated.queries() {
            debug!(
                "Translated pipeline {} on {} ({}): {} [{} params]",
                &fingerprint[..12],
                collection,
                self.dialect(),
                query.sql,
                query.params.len()
            );
        }
        Ok(translated)
    }

    fn translate_stages(&self, collection: &str, stages: &[Stage]) -> Result<TranslatedQuery> {
        let compiler = Compiler::new(self.profile.as_ref(), &self.registry);
        let builder = StatementBuilder::new(self, &compiler, false);
        let base = builder.base_level(collection);
        let statement = builder.build(base, stages)?;
        Ok(TranslatedQuery::from_fragment(&statement, self.profile.param_style()))
    }

    fn table(&self, collection: &str) -> String {
        self.profile
            .quote_ident(&format!("{}{}", self.options.table_prefix, collection))
    }
}

/// One SELECT under construction
struct SelectLevel {
    from: Fragment,
    scope: Scope,
    joins: Vec<Fragment>,
    filters: Vec<Fragment>,
    group_by: Vec<Fragment>,
    order_by: Vec<Fragment>,
    /// ORDER BY only replays the `ord` column of the sealed level below
    order_inherited: bool,
    /// Last `$limit` and last `$skip` seen in this level
    limit: Option<u64>,
    skip: u64,
    /// The last `$skip` came after the last `$limit` and eats into it
    skip_after_limit: bool,
    /// Fixed output document; `None` means the scope's current document
    output: Option<Fragment>,
    aggregated: bool,
    has_lookup: bool,
}

impl SelectLevel {
    fn new(from: Fragment, scope: Scope) -> Self {
        Self {
            from,
            scope,
            joins: Vec::new(),
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            order_inherited: false,
            limit: None,
            skip: 0,
            skip_after_limit: false,
            output: None,
            aggregated: false,
            has_lookup: false,
        }
    }

    /// Output is fixed: later stages read fields only after a seal
    fn closed(&self) -> bool {
        self.output.is_some()
    }

    fn windowed(&self) -> bool {
        self.limit.is_some() || self.skip > 0
    }

    /// Row count for the LIMIT clause
    fn effective_limit(&self) -> Option<u64> {
        match self.limit {
            Some(limit) if self.skip_after_limit => Some(limit.saturating_sub(self.skip)),
            limit => limit,
        }
    }

    fn sorted(&self) -> bool {
        !self.order_by.is_empty() && !self.order_inherited
    }

    fn clear_order(&mut self) {
        self.order_by.clear();
        self.order_inherited = false;
    }
}

struct StatementBuilder<'c, 'a> {
    translator: &'c AggregationTranslator,
    compiler: &'c Compiler<'a>,
    /// Sealed levels become derived tables instead of CTEs, so correlated
    /// references stay inside the enclosing subquery
    nested: bool,
    ctes: Vec<Fragment>,
}

impl<'c, 'a> StatementBuilder<'c, 'a> {
    fn new(translator: &'c AggregationTranslator, compiler: &'c Compiler<'a>, nested: bool) -> Self {
        Self {
            translator,
            compiler,
            nested,
            ctes: Vec::new(),
        }
    }

    fn profile(&self) -> &'a dyn DialectProfile {
        self.compiler.profile()
    }

    fn base_level(&self, collection: &str) -> SelectLevel {
        let alias = self.compiler.next_alias("t");
        let column = format!(
            "{}.{}",
            alias,
            self.profile().quote_ident(&self.translator.options.document_column)
        );
        SelectLevel::new(
            Fragment::raw(format!("{} AS {}", self.translator.table(collection), alias)),
            Scope::new(Source::Column(column)),
        )
    }

    fn build(mut self, mut level: SelectLevel, stages: &[Stage]) -> Result<Fragment> {
        for stage in stages {
            level = self.apply(level, stage)?;
        }
        let select = self.render(level, false);
        if self.ctes.is_empty() {
            return Ok(select);
        }
        Ok(Fragment::raw("WITH ")
            .append(Fragment::join(self.ctes, ", "))
            .text(" ")
            .append(select))
    }

    fn apply(&mut self, level: SelectLevel, stage: &Stage) -> Result<SelectLevel> {
        match stage {
            Stage::Match(filter) => {
                let seal = level.closed() || level.windowed() || level.aggregated;
                let mut level = self.seal_if(level, seal);
                let condition = self.compiler.compile_filter(filter, &level.scope)?;
                level.filters.push(condition);
                Ok(level)
            }
            Stage::AddFields(fields) => self.add_fields(level, fields),
            Stage::Project(Projection::Include { fields, include_id }) => {
                self.project(level, fields, *include_id)
            }
            Stage::Project(Projection::Exclude { fields }) => {
                self.remove_fields(level, fields, "$project:exclude", "$project")
            }
            Stage::Unset(fields) => self.remove_fields(level, fields, "$unset", "$unset"),
            Stage::ReplaceRoot(expr) => {
                let seal = level.closed();
                let mut level = self.seal_if(level, seal);
                let output = self.compiler.compile_value(expr, &level.scope, ExtractKind::Json)?;
                level.output = Some(output);
                level.scope.set_function_fields(Vec::new());
                Ok(level)
            }
            Stage::Group(group) => self.group(level, group),
            Stage::Sort(keys) => self.sort(level, keys),
            // repeated $limit or $skip: the last one wins
            Stage::Limit(n) => {
                let mut level = level;
                level.limit = Some(*n);
                level.skip_after_limit = false;
                Ok(level)
            }
            Stage::Skip(n) => {
                let mut level = level;
                level.skip = *n;
                level.skip_after_limit = level.limit.is_some();
                Ok(level)
            }
            Stage::Sample(size) => {
                let seal = level.windowed() || level.sorted();
                let mut level = self.seal_if(level, seal);
                level.order_by = vec![Fragment::raw(self.profile().random())];
                level.order_inherited = false;
                level.limit = Some(*size);
                Ok(level)
            }
            Stage::Count(field) => {
                let seal = level.closed() || level.windowed();
                let mut level = self.seal_if(level, seal);
                let profile = self.profile();
                let count = profile.coerce(
                    Fragment::raw(profile.count_all()),
                    ExtractKind::Integer,
                    ExtractKind::Json,
                );
                level.clear_order();
                level.output = Some(profile.build_object(vec![(field.clone(), count)]));
                level.aggregated = true;
                level.scope.set_function_fields(Vec::new());
                Ok(level)
            }
            Stage::Unwind(unwind) => self.unwind(level, unwind),
            Stage::Lookup(lookup) => self.lookup(level, lookup),
            Stage::Facet(_) => Err(TranslateError::InvalidPipeline(
                "$facet is only allowed as the last stage of the outer pipeline".to_string(),
            )),
        }
    }

    fn seal_if(&mut self, level: SelectLevel, condition: bool) -> SelectLevel {
        if condition {
            self.seal(level)
        } else {
            level
        }
    }

    fn seal(&mut self, level: SelectLevel) -> SelectLevel {
        let alias = self.compiler.next_alias("s");
        let ordered = !level.order_by.is_empty();
        let scope = level.scope.rebase(Source::Column(format!("{}.data", alias)));
        let select = self.render(level, true);

        let from = if self.nested {
            Fragment::paren(select).text(&format!(" AS {}", alias))
        } else {
            self.ctes
                .push(Fragment::raw(format!("{} AS (", alias)).append(select).text(")"));
            Fragment::raw(alias.clone())
        };

        let mut next = SelectLevel::new(from, scope);
        if ordered {
            let ord = Fragment::raw(format!("{}.ord", alias));
            next.order_by.push(self.profile().order_term(ord, false));
            next.order_inherited = true;
        }
        next
    }

    fn render(&self, level: SelectLevel, with_ord: bool) -> Fragment {
        let profile = self.profile();
        let effective_limit = level.effective_limit();
        let document = match level.output {
            Some(output) => output,
            None => self.compiler.materialize(&level.scope),
        };

        let mut sql = Fragment::raw("SELECT ").append(document).text(" AS data");
        if with_ord && !level.order_by.is_empty() {
            sql = sql
                .text(", row_number() OVER (ORDER BY ")
                .append(Fragment::join(level.order_by.iter().cloned(), ", "))
                .text(") AS ord");
        }
        sql = sql.text(" FROM ").append(level.from);
        for join in level.joins {
            sql = sql.text(" ").append(join);
        }
        if !level.filters.is_empty() {
            let filters = if level.filters.len() == 1 {
                level.filters
            } else {
                level.filters.into_iter().map(Fragment::paren).collect()
            };
            sql = sql.text(" WHERE ").append(Fragment::join(filters, " AND "));
        }
        if !level.group_by.is_empty() {
            sql = sql.text(" GROUP BY ").append(Fragment::join(level.group_by, ", "));
        }
        if !level.order_by.is_empty() {
            sql = sql.text(" ORDER BY ").append(Fragment::join(level.order_by, ", "));
        }

        let count = |n: u64| profile.param(SqlParam::Int(i64::try_from(n).unwrap_or(i64::MAX)));
        let limit = effective_limit.map(count);
        let offset = (level.skip > 0).then(|| count(level.skip));
        let tail = profile.limit_offset(limit, offset);
        if !tail.is_empty() {
            sql = sql.text(" ").append(tail);
        }
        sql
    }

    /// Binding for the computed field at `path`
    ///
    /// `$function` is only accepted as the whole value or as a value nested
    /// in object literals. Every marker's field path is added to `functions`.
    fn field_binding(
        &self,
        path: &FieldPath,
        expr: &Expression,
        scope: &Scope,
        functions: &mut Vec<FieldPath>,
    ) -> Result<Binding> {
        match expr {
            Expression::Function(call) => {
                let marker = FunctionMarker::from_call(call)
                    .map_err(|err| TranslateError::InvalidPipeline(err.to_string()))?;
                let literal = self.profile().json_literal(&Value::String(marker.encode()));
                functions.push(path.clone());
                Ok(Binding::Function(literal))
            }
            Expression::Object(entries) if expr.contains_function() => {
                let profile = self.profile();
                let mut members = Vec::with_capacity(entries.len());
                for (name, value) in entries {
                    let child = path.child(name)?;
                    let json = match self.field_binding(&child, value, scope, functions)? {
                        Binding::Function(marker) => marker,
                        Binding::Value(value, kind) => profile.coerce(value, kind, ExtractKind::Json),
                        Binding::Source(source) => profile.extract(&source, &[], ExtractKind::Json),
                    };
                    members.push((name.clone(), json));
                }
                Ok(Binding::Value(profile.build_object(members), ExtractKind::Json))
            }
            other => {
                let (value, kind) = self.compiler.compile_expr(other, scope)?;
                Ok(Binding::Value(value, kind))
            }
        }
    }

    fn add_fields(&mut self, level: SelectLevel, fields: &[(FieldPath, Expression)]) -> Result<SelectLevel> {
        let seal = level.closed();
        let mut level = self.seal_if(level, seal);

        // every expression sees the document as it was before the stage
        let mut functions = Vec::new();
        let mut bindings = Vec::with_capacity(fields.len());
        for (path, expr) in fields {
            let binding = self.field_binding(path, expr, &level.scope, &mut functions)?;
            bindings.push((path.clone(), binding));
        }
        for (path, binding) in bindings {
            level.scope.bind_field(path, binding);
        }
        for function in functions {
            level.scope.mark_function(function);
        }
        Ok(level)
    }

    fn project(
        &mut self,
        level: SelectLevel,
        fields: &[(FieldPath, ProjectField)],
        include_id: bool,
    ) -> Result<SelectLevel> {
        let seal = level.closed();
        let mut level = self.seal_if(level, seal);
        let profile = self.profile();
        let scope = &level.scope;

        let mut entries = Vec::with_capacity(fields.len() + 1);
        let mut functions = Vec::new();
        if include_id {
            let id = FieldPath::parse("_id")?;
            let value = self.compiler.value_of(&self.compiler.resolve_keep(&id, scope), ExtractKind::Json);
            entries.push((id.segments().to_vec(), value));
        }

        for (path, field) in fields {
            let value = match field {
                ProjectField::Keep => {
                    functions.extend(
                        scope
                            .function_fields()
                            .iter()
                            .filter(|function| function.starts_with(path))
                            .cloned(),
                    );
                    let resolved = self.compiler.resolve_keep(path, scope);
                    self.compiler.value_of(&resolved, ExtractKind::Json)
                }
                ProjectField::Computed(expr) => match self.field_binding(path, expr, scope, &mut functions)? {
                    Binding::Function(marker) => marker,
                    Binding::Value(value, kind) => profile.coerce(value, kind, ExtractKind::Json),
                    Binding::Source(source) => profile.extract(&source, &[], ExtractKind::Json),
                },
            };
            entries.push((path.segments().to_vec(), value));
        }

        level.output = Some(self.compiler.nested_object(entries));
        level.scope.set_function_fields(functions);
        Ok(level)
    }

    fn remove_fields(
        &mut self,
        level: SelectLevel,
        paths: &[FieldPath],
        form: &str,
        stage: &str,
    ) -> Result<SelectLevel> {
        self.compiler.check_stage(form, stage)?;
        let seal = level.closed();
        let mut level = self.seal_if(level, seal);

        let segments: Vec<Vec<String>> = paths.iter().map(|p| p.segments().to_vec()).collect();
        let document = self.compiler.materialize(&level.scope);
        let output = self.profile().remove_paths(document, &segments).ok_or_else(|| {
            TranslateError::UnsupportedStage {
                dialect: self.profile().dialect(),
                stage: stage.to_string(),
            }
        })?;

        let functions = level
            .scope
            .function_fields()
            .iter()
            .filter(|function| !paths.iter().any(|path| function.starts_with(path)))
            .cloned()
            .collect();
        level.output = Some(output);
        level.scope.set_function_fields(functions);
        Ok(level)
    }

    fn group(&mut self, level: SelectLevel, group: &Group) -> Result<SelectLevel> {
        let seal = level.closed() || level.windowed();
        let mut level = self.seal_if(level, seal);
        // input order cannot change group membership
        level.clear_order();

        let profile = self.profile();
        let json = ExtractKind::Json;
        let scope = &level.scope;

        let (id, keys) = match &group.id {
            Expression::Literal(value) => (self.compiler.literal(value, json), Vec::new()),
            Expression::Object(fields) => {
                let mut id_fields = Vec::with_capacity(fields.len());
                let mut keys = Vec::with_capacity(fields.len());
                for (name, expr) in fields {
                    let key = self.compiler.compile_value(expr, scope, json)?;
                    id_fields.push((name.clone(), profile.group_key(key.clone())));
                    keys.push(key);
                }
                (profile.build_object(id_fields), keys)
            }
            expr => {
                let key = self.compiler.compile_value(expr, scope, json)?;
                (profile.group_key(key.clone()), vec![key])
            }
        };

        let mut fields = vec![("_id".to_string(), id)];
        for (name, accumulator) in &group.accumulators {
            let op = accumulator.op;
            self.compiler.check_operator(op.name())?;
            let arg = match op {
                AccumulatorOp::Count => Fragment::new(),
                _ => self
                    .compiler
                    .compile_value(&accumulator.expr, scope, profile.aggregate_arg_kind(op))?,
            };
            let (value, kind) = profile
                .aggregate(op, arg)
                .ok_or_else(|| self.compiler.unsupported(op.name()))?;
            fields.push((name.clone(), profile.coerce(value, kind, json)));
        }

        level.group_by = keys;
        level.output = Some(profile.build_object(fields));
        level.aggregated = true;
        level.scope.set_function_fields(Vec::new());
        Ok(level)
    }

    fn sort(&mut self, level: SelectLevel, keys: &[SortKey]) -> Result<SelectLevel> {
        let seal = level.closed() || level.windowed();
        let mut level = self.seal_if(level, seal);
        let profile = self.profile();

        let mut terms = Vec::with_capacity(keys.len());
        for key in keys {
            let resolved = self.compiler.resolve(&key.path, &level.scope)?;
            for kind in profile.sort_kinds() {
                let value = self.compiler.value_of(&resolved, *kind);
                terms.push(profile.order_term(value, key.descending));
            }
        }
        // the earlier order only breaks ties
        terms.append(&mut level.order_by);
        level.order_by = terms;
        level.order_inherited = false;
        Ok(level)
    }

    fn unwind(&mut self, level: SelectLevel, unwind: &Unwind) -> Result<SelectLevel> {
        let seal = level.closed() || level.windowed() || level.has_lookup;
        let mut level = self.seal_if(level, seal);
        let profile = self.profile();

        let (source, path) = match self.compiler.resolve(&unwind.path, &level.scope)? {
            Resolved::Path(source, path) => (source, path),
            Resolved::Value(value, kind) => {
                let json = profile.coerce(value, kind, ExtractKind::Json);
                (Source::Json(profile.to_json_text(json)), Vec::new())
            }
        };

        let alias = self.compiler.next_alias("u");
        level.joins.push(profile.unwind_join(
            &source,
            &path,
            &alias,
            unwind.preserve_null_and_empty_arrays,
            unwind.include_array_index.is_some(),
        ));
        level
            .scope
            .bind_field(unwind.path.clone(), Binding::Source(Source::Element(alias.clone())));
        if let Some(index) = &unwind.include_array_index {
            level.scope.bind_field(
                index.clone(),
                Binding::Value(profile.unwind_index(&alias), ExtractKind::Integer),
            );
        }
        Ok(level)
    }

    fn lookup(&mut self, level: SelectLevel, lookup: &Lookup) -> Result<SelectLevel> {
        let seal = level.closed() || level.windowed();
        let mut level = self.seal_if(level, seal);
        if !lookup.let_vars.is_empty() {
            self.compiler.check_stage("$lookup:let", "$lookup")?;
        }

        let documents = match self.profile().lookup_strategy() {
            LookupStrategy::CorrelatedSubquery => self.correlated_lookup(&level.scope, lookup)?,
            LookupStrategy::GroupedJoin => {
                let (join, documents) = self.grouped_lookup(&level.scope, lookup)?;
                level.joins.push(join);
                documents
            }
        };

        level
            .scope
            .bind_field(lookup.as_field.clone(), Binding::Source(Source::Json(documents)));
        level.has_lookup = true;
        Ok(level)
    }

    /// Foreign collection statement; `correlate` adds the equality match
    /// against the local document before the lookup's own pipeline
    fn lookup_statement(&self, outer: &Scope, lookup: &Lookup, correlate: bool) -> Result<Fragment> {
        let sub = StatementBuilder::new(self.translator, self.compiler, true);
        let mut base = sub.base_level(&lookup.from);

        for (name, expr) in &lookup.let_vars {
            let (value, kind) = self.compiler.compile_expr(expr, outer)?;
            base.scope.bind_variable(name.clone(), Binding::Value(value, kind));
        }

        if correlate {
            if let (Some(local), Some(foreign)) = (&lookup.local_field, &lookup.foreign_field) {
                let json = ExtractKind::Json;
                let foreign_value = self.profile().extract(base.scope.root(), foreign.segments(), json);
                let local_value = self.compiler.value_of(&self.compiler.resolve(local, outer)?, json);
                base.filters
                    .push(Fragment::paren(foreign_value.text(" = ").append(local_value)));
            }
        }

        let stages = lookup
            .pipeline
            .as_ref()
            .map(|pipeline| pipeline.stages.as_slice())
            .unwrap_or(&[]);
        sub.build(base, stages)
    }

    fn correlated_lookup(&self, outer: &Scope, lookup: &Lookup) -> Result<Fragment> {
        let statement = self.lookup_statement(outer, lookup, true)?;
        let rows = self.compiler.next_alias("l");
        let collected = self
            .profile()
            .collect_documents(Fragment::raw(format!("{}.data", rows)));
        Ok(Fragment::raw("(SELECT ")
            .append(collected)
            .text(" FROM (")
            .append(statement)
            .text(&format!(") AS {})", rows)))
    }

    fn grouped_lookup(&self, outer: &Scope, lookup: &Lookup) -> Result<(Fragment, Fragment)> {
        let profile = self.profile();
        let statement = self.lookup_statement(outer, lookup, false)?;
        let rows = self.compiler.next_alias("l");
        let joined = self.compiler.next_alias("l");
        let collected = profile.collect_documents(Fragment::raw(format!("{}.data", rows)));

        let join = match (&lookup.local_field, &lookup.foreign_field) {
            (Some(local), Some(foreign)) => {
                let json = ExtractKind::Json;
                // keyed on the lookup pipeline's output documents
                let key = profile.extract(
                    &Source::Column(format!("{}.data", rows)),
                    foreign.segments(),
                    json,
                );
                let local_value = self.compiler.value_of(&self.compiler.resolve(local, outer)?, json);
                Fragment::raw("LEFT JOIN (SELECT ")
                    .append(key)
                    .text(" AS k, ")
                    .append(collected)
                    .text(" AS docs FROM (")
                    .append(statement)
                    .text(&format!(") AS {} GROUP BY k) AS {} ON {}.k = ", rows, joined, joined))
                    .append(local_value)
            }
            _ => Fragment::raw("CROSS JOIN (SELECT ")
                .append(collected)
                .text(" AS docs FROM (")
                .append(statement)
                .text(&format!(") AS {}) AS {}", rows, joined)),
        };

        let documents = profile.joined_documents(Fragment::raw(format!("{}.docs", joined)));
        Ok((join, documents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translate(dialect: Dialect, pipeline: Value) -> Result<TranslatedQuery> {
        match AggregationTranslator::new(dialect, TranslatorOptions::default())
            .translate("orders", &pipeline)?
        {
            TranslatedAggregate::Single(query) => Ok(query),
            other => panic!("expected a single statement, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_pipeline_is_a_scan() {
        let query = translate(Dialect::Sqlite, json!([{"$match": {}}])).unwrap();
        assert_eq!(query.sql, "SELECT t0.\"data\" AS data FROM \"orders\" AS t0");
        assert!(query.params.is_empty());

        let query = translate(Dialect::ClickHouse, json!([])).unwrap();
        assert_eq!(query.sql, "SELECT t0.`data` AS data FROM `orders` AS t0");
    }

    #[test]
    fn test_match_after_limit_seals() {
        let query = translate(
            Dialect::Sqlite,
            json!([{"$limit": 5}, {"$match": {"status": "done"}}]),
        )
        .unwrap();
        assert!(query.sql.starts_with("WITH s1 AS (SELECT t0.\"data\" AS data FROM"), "{}", query.sql);
        assert!(query.sql.contains("FROM s1 WHERE"), "{}", query.sql);
        assert_eq!(query.params, vec![SqlParam::Int(5), SqlParam::Text("done".to_string())]);
    }

    #[test]
    fn test_sorted_level_keeps_order_after_seal() {
        let query = translate(
            Dialect::Sqlite,
            json!([{"$sort": {"n": 1}}, {"$limit": 3}, {"$match": {"a": 1}}]),
        )
        .unwrap();
        assert!(query.sql.contains("row_number() OVER (ORDER BY"), "{}", query.sql);
        assert!(query.sql.ends_with("ORDER BY s1.ord ASC"), "{}", query.sql);
    }

    #[test]
    fn test_limit_skip_window() {
        let query = translate(
            Dialect::Sqlite,
            json!([{"$limit": 10}, {"$skip": 3}]),
        )
        .unwrap();
        assert!(query.sql.ends_with("LIMIT ? OFFSET ?"), "{}", query.sql);
        assert_eq!(query.params, vec![SqlParam::Int(7), SqlParam::Int(3)]);
    }

    #[test]
    fn test_repeated_limit_last_wins() {
        let query = translate(Dialect::Sqlite, json!([{"$limit": 5}, {"$limit": 10}])).unwrap();
        assert!(query.sql.ends_with("LIMIT ?"), "{}", query.sql);
        assert_eq!(query.params, vec![SqlParam::Int(10)]);

        let query = translate(
            Dialect::Sqlite,
            json!([{"$limit": 10}, {"$skip": 3}, {"$limit": 5}]),
        )
        .unwrap();
        assert_eq!(query.params, vec![SqlParam::Int(5), SqlParam::Int(3)]);

        let query = translate(
            Dialect::Sqlite,
            json!([{"$limit": 10}, {"$skip": 3}, {"$skip": 2}]),
        )
        .unwrap();
        assert_eq!(query.params, vec![SqlParam::Int(8), SqlParam::Int(2)]);
    }

    #[test]
    fn test_count() {
        let query = translate(Dialect::Sqlite, json!([{"$count": "total"}])).unwrap();
        assert_eq!(
            query.sql,
            "SELECT json_object('total', COUNT(*)) AS data FROM \"orders\" AS t0"
        );
    }

    #[test]
    fn test_function_marker_is_a_parameter() {
        let query = translate(
            Dialect::Sqlite,
            json!([{"$addFields": {"score": {"$function": {
                "body": "(x, m) => x * m",
                "args": ["$value", 10],
                "lang": "js"
            }}}}]),
        )
        .unwrap();
        assert!(!query.sql.contains("x * m"));
        match &query.params[0] {
            SqlParam::Text(text) => assert!(FunctionMarker::is_marker(text)),
            other => panic!("expected marker text, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_function_is_a_marker() {
        let function = json!({"$function": {"body": "(n) => n + 1", "args": ["$n"], "lang": "js"}});
        let query = translate(
            Dialect::Sqlite,
            json!([{"$addFields": {"meta": {"next": function, "kind": "counter"}}}]),
        )
        .unwrap();
        assert!(query.sql.contains("json_object('next', ?, 'kind', ?)"), "{}", query.sql);
        match &query.params[0] {
            SqlParam::Text(text) => assert!(FunctionMarker::is_marker(text)),
            other => panic!("expected marker text, got {:?}", other),
        }

        // neither the marker field nor the object holding it can be read
        for read in ["$meta.next", "$meta"] {
            let err = translate(
                Dialect::Sqlite,
                json!([
                    {"$addFields": {"meta": {"next": function, "kind": "counter"}}},
                    {"$addFields": {"copy": read}}
                ]),
            )
            .unwrap_err();
            assert!(matches!(err, TranslateError::InvalidPipeline(_)), "{}", read);
        }

        let query = translate(
            Dialect::Sqlite,
            json!([
                {"$addFields": {"meta": {"next": function, "kind": "counter"}}},
                {"$addFields": {"copy": "$meta.kind"}}
            ]),
        );
        assert!(query.is_ok());
    }

    #[test]
    fn test_function_field_cannot_be_read() {
        let err = translate(
            Dialect::Sqlite,
            json!([
                {"$addFields": {"score": {"$function": {"body": "() => 1", "args": [], "lang": "js"}}}},
                {"$match": {"score": {"$gt": 0}}}
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, TranslateError::InvalidPipeline(_)));

        let err = translate(
            Dialect::Sqlite,
            json!([{"$addFields": {"score": {"$add": [1, {"$function": {
                "body": "() => 1", "args": [], "lang": "js"
            }}]}}}]),
        )
        .unwrap_err();
        assert!(matches!(err, TranslateError::InvalidPipeline(_)));
    }

    #[test]
    fn test_dialect_gaps() {
        assert_eq!(
            translate(Dialect::ClickHouse, json!([{"$unset": "secret"}])).unwrap_err(),
            TranslateError::UnsupportedStage {
                dialect: Dialect::ClickHouse,
                stage: "$unset".to_string(),
            }
        );
        assert_eq!(
            translate(
                Dialect::Sqlite,
                json!([{"$group": {"_id": null, "sd": {"$stdDevPop": "$n"}}}])
            )
            .unwrap_err(),
            TranslateError::UnsupportedOperator {
                dialect: Dialect::Sqlite,
                operator: "$stdDevPop".to_string(),
            }
        );
        assert!(translate(Dialect::Sqlite, json!([{"$unset": "secret"}])).is_ok());
    }

    #[test]
    fn test_facet_must_be_last() {
        let translator = AggregationTranslator::new(Dialect::Sqlite, TranslatorOptions::default());
        let err = translator
            .translate("orders", &json!([{"$facet": {"a": [{"$limit": 1}]}}, {"$limit": 1}]))
            .unwrap_err();
        assert!(matches!(err, TranslateError::InvalidPipeline(_)));

        let translated = translator
            .translate(
                "orders",
                &json!([
                    {"$match": {"status": "done"}},
                    {"$facet": {"n": [{"$count": "n"}], "top": [{"$limit": 2}]}}
                ]),
            )
            .unwrap();
        match translated {
            TranslatedAggregate::Facet(facets) => {
                assert_eq!(facets.len(), 2);
                assert_eq!(facets[0].0, "n");
                assert_eq!(facets[1].1.params.len(), 2);
            }
            other => panic!("expected facets, got {:?}", other),
        }
    }

    #[test]
    fn test_table_prefix() {
        let options = TranslatorOptions {
            table_prefix: "app_".to_string(),
            ..TranslatorOptions::default()
        };
        let translated = AggregationTranslator::new(Dialect::Sqlite, options)
            .translate("users", &json!([]))
            .unwrap();
        match translated {
            TranslatedAggregate::Single(query) => assert!(query.sql.contains("FROM \"app_users\" AS t0")),
            other => panic!("expected a single statement, got {:?}", other),
        }
    }
}
