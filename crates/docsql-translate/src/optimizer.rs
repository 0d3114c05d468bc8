//! Pipeline optimization passes
//!
//! Each pass is a pure rewrite of the stage list that preserves results and
//! never reorders stages. Passes are applied to `$facet` and `$lookup`
//! sub-pipelines before the enclosing pipeline, so running the optimizer
//! twice gives the same pipeline as running it once.

use docsql_ir::{Pipeline, Stage};

/// A single rewrite over a pipeline's stages
pub trait OptimizationPass: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn transform(&self, pipeline: Pipeline) -> Pipeline;
}

#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut optimizer = Self::new();
        optimizer.add_pass(Box::new(DropEmptyMatch));
        optimizer.add_pass(Box::new(DropEmptyFieldStages));
        optimizer.add_pass(Box::new(MergeAdjacentMatch));
        optimizer.add_pass(Box::new(MergeAdjacentLimit));
        optimizer.add_pass(Box::new(MergeAdjacentSkip));
        optimizer
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, pipeline: Pipeline) -> Pipeline {
        self.passes
            .iter()
            .fold(pipeline, |current, pass| apply(pass.as_ref(), current))
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }
}

fn apply(pass: &dyn OptimizationPass, pipeline: Pipeline) -> Pipeline {
    let stages = pipeline
        .stages
        .into_iter()
        .map(|stage| match stage {
            Stage::Facet(facets) => Stage::Facet(
                facets
                    .into_iter()
                    .map(|(name, sub)| (name, apply(pass, sub)))
                    .collect(),
            ),
            Stage::Lookup(mut lookup) => {
                lookup.pipeline = lookup.pipeline.map(|sub| apply(pass, sub));
                Stage::Lookup(lookup)
            }
            other => other,
        })
        .collect();
    pass.transform(Pipeline::new(stages))
}

/// Fold each stage into the previous one when `merge` allows
fn merge_adjacent(pipeline: Pipeline, merge: impl Fn(&mut Stage, &Stage) -> bool) -> Pipeline {
    let mut stages: Vec<Stage> = Vec::with_capacity(pipeline.stages.len());
    for stage in pipeline.stages {
        if let Some(previous) = stages.last_mut() {
            if merge(previous, &stage) {
                continue;
            }
        }
        stages.push(stage);
    }
    Pipeline::new(stages)
}

/// `{$match: {}}` passes every document
struct DropEmptyMatch;

impl OptimizationPass for DropEmptyMatch {
    fn name(&self) -> &str {
        "drop_empty_match"
    }

    fn description(&self) -> &str {
        "Removes $match stages with an empty filter"
    }

    fn transform(&self, pipeline: Pipeline) -> Pipeline {
        let stages = pipeline
            .stages
            .into_iter()
            .filter(|stage| !matches!(stage, Stage::Match(filter) if filter.is_empty()))
            .collect();
        Pipeline::new(stages)
    }
}

struct DropEmptyFieldStages;

impl OptimizationPass for DropEmptyFieldStages {
    fn name(&self) -> &str {
        "drop_empty_field_stages"
    }

    fn description(&self) -> &str {
        "Removes $addFields and $unset stages that name no fields"
    }

    fn transform(&self, pipeline: Pipeline) -> Pipeline {
        let stages = pipeline
            .stages
            .into_iter()
            .filter(|stage| match stage {
                Stage::AddFields(fields) => !fields.is_empty(),
                Stage::Unset(fields) => !fields.is_empty(),
                _ => true,
            })
            .collect();
        Pipeline::new(stages)
    }
}

struct MergeAdjacentMatch;

impl OptimizationPass for MergeAdjacentMatch {
    fn name(&self) -> &str {
        "merge_adjacent_match"
    }

    fn description(&self) -> &str {
        "Combines consecutive $match stages into one conjunction"
    }

    fn transform(&self, pipeline: Pipeline) -> Pipeline {
        merge_adjacent(pipeline, |previous, stage| match (previous, stage) {
            (Stage::Match(first), Stage::Match(second)) => {
                let merged = std::mem::take(first).and(second.clone());
                *first = merged;
                true
            }
            _ => false,
        })
    }
}

struct MergeAdjacentLimit;

impl OptimizationPass for MergeAdjacentLimit {
    fn name(&self) -> &str {
        "merge_adjacent_limit"
    }

    fn description(&self) -> &str {
        "Keeps the last of consecutive $limit stages"
    }

    fn transform(&self, pipeline: Pipeline) -> Pipeline {
        merge_adjacent(pipeline, |previous, stage| match (previous, stage) {
            (Stage::Limit(first), Stage::Limit(second)) => {
                *first = *second;
                true
            }
            _ => false,
        })
    }
}

struct MergeAdjacentSkip;

impl OptimizationPass for MergeAdjacentSkip {
    fn name(&self) -> &str {
        "merge_adjacent_skip"
    }

    fn description(&self) -> &str {
        "Keeps the last of consecutive $skip stages"
    }

    fn transform(&self, pipeline: Pipeline) -> Pipeline {
        merge_adjacent(pipeline, |previous, stage| match (previous, stage) {
            (Stage::Skip(first), Stage::Skip(second)) => {
                *first = *second;
                true
            }
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn optimize(value: serde_json::Value) -> Pipeline {
        Optimizer::with_defaults().optimize(Pipeline::from_json(&value).unwrap())
    }

    #[test]
    fn test_pass_order() {
        assert_eq!(
            Optimizer::with_defaults().pass_names(),
            vec![
                "drop_empty_match",
                "drop_empty_field_stages",
                "merge_adjacent_match",
                "merge_adjacent_limit",
                "merge_adjacent_skip",
            ]
        );
    }

    #[test]
    fn test_drop_empty_match() {
        let pipeline = optimize(json!([{"$match": {}}, {"$limit": 5}]));
        assert_eq!(pipeline.stages, vec![Stage::Limit(5)]);

        assert!(optimize(json!([{"$match": {}}])).is_empty());
    }

    #[test]
    fn test_merges() {
        let pipeline = optimize(json!([
            {"$match": {"a": 1}},
            {"$match": {}},
            {"$match": {"b": 2}},
            {"$limit": 10},
            {"$limit": 3},
            {"$skip": 2},
            {"$skip": 5}
        ]));
        assert_eq!(pipeline.len(), 3);
        match &pipeline.stages[0] {
            Stage::Match(filter) => assert_eq!(filter.clauses.len(), 2),
            other => panic!("expected $match, got {:?}", other),
        }
        assert_eq!(pipeline.stages[1], Stage::Limit(3));
        assert_eq!(pipeline.stages[2], Stage::Skip(5));
    }

    #[test]
    fn test_repeated_limit_last_wins() {
        let pipeline = optimize(json!([{"$limit": 5}, {"$limit": 10}]));
        assert_eq!(pipeline.stages, vec![Stage::Limit(10)]);

        let pipeline = optimize(json!([{"$skip": 3}, {"$skip": 2}]));
        assert_eq!(pipeline.stages, vec![Stage::Skip(2)]);
    }

    #[test]
    fn test_limit_skip_not_reordered() {
        let pipeline = optimize(json!([{"$skip": 2}, {"$limit": 3}, {"$skip": 1}]));
        assert_eq!(
            pipeline.stages,
            vec![Stage::Skip(2), Stage::Limit(3), Stage::Skip(1)]
        );
    }

    #[test]
    fn test_sub_pipelines() {
        let pipeline = optimize(json!([
            {"$facet": {
                "top": [{"$match": {}}, {"$limit": 5}, {"$limit": 2}]
            }}
        ]));
        match &pipeline.stages[0] {
            Stage::Facet(facets) => assert_eq!(facets[0].1.stages, vec![Stage::Limit(2)]),
            other => panic!("expected $facet, got {:?}", other),
        }
    }

    #[test]
    fn test_idempotent() {
        let input = json!([
            {"$match": {"a": {"$gt": 1}}},
            {"$match": {"b": 2}},
            {"$addFields": {}},
            {"$skip": 1},
            {"$skip": 1},
            {"$lookup": {
                "from": "orders",
                "pipeline": [{"$match": {}}, {"$limit": 4}, {"$limit": 9}],
                "as": "orders"
            }}
        ]);
        let optimizer = Optimizer::with_defaults();
        let once = optimizer.optimize(Pipeline::from_json(&input).unwrap());
        let twice = optimizer.optimize(once.clone());
        assert_eq!(once, twice);
    }
}
