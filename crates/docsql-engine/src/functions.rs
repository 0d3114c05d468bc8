//! `$function` resolution over result documents
//!
//! Markers found anywhere in the documents are grouped by signature (body
//! plus argument binding shape). Each group becomes one sandbox request per
//! `max_batch_size` calls, and every result replaces its marker in place.

use std::collections::HashMap;
use std::sync::Arc;

use docsql_ir::{FunctionMarker, MarkerSignature};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::sandbox::{worker_name, BatchRequest, BatchResponse, WorkerCode, WorkerLoader, WorkerRequest};
use crate::ExecuteError;

/// One step into a JSON value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A marker and where it sits
#[derive(Debug, Clone)]
pub struct MarkerSite {
    pub document: usize,
    pub path: Vec<PathSegment>,
    pub marker: FunctionMarker,
}

/// Find every marker string in `documents`, in document order and then
/// depth-first within each document
pub fn find_markers(documents: &[Value]) -> Result<Vec<MarkerSite>, ExecuteError> {
    let mut sites = Vec::new();
    for (document, value) in documents.iter().enumerate() {
        let mut path = Vec::new();
        scan(value, document, &mut path, &mut sites)?;
    }
    Ok(sites)
}

fn scan(
    value: &Value,
    document: usize,
    path: &mut Vec<PathSegment>,
    sites: &mut Vec<MarkerSite>,
) -> Result<(), ExecuteError> {
    match value {
        Value::String(text) if FunctionMarker::is_marker(text) => {
            sites.push(MarkerSite {
                document,
                path: path.clone(),
                marker: FunctionMarker::decode(text)?,
            });
        }
        Value::Object(map) => {
            for (key, child) in map {
                path.push(PathSegment::Key(key.clone()));
                scan(child, document, path, sites)?;
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(index));
                scan(child, document, path, sites)?;
                path.pop();
            }
        }
        _ => {}
    }
    Ok(())
}

/// Overwrite the value at `path`; a path that no longer exists is ignored
fn splice(document: &mut Value, path: &[PathSegment], replacement: Value) {
    let mut current = document;
    for segment in path {
        let next = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key),
            (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return,
        }
    }
    *current = replacement;
}

/// Groups in first-seen order so request order is deterministic
fn group_by_signature(sites: Vec<MarkerSite>) -> Vec<(MarkerSignature, Vec<MarkerSite>)> {
    let mut groups: Vec<(MarkerSignature, Vec<MarkerSite>)> = Vec::new();
    let mut positions: HashMap<MarkerSignature, usize> = HashMap::new();
    for site in sites {
        let signature = site.marker.signature();
        match positions.get(&signature) {
            Some(&position) => groups[position].1.push(site),
            None => {
                positions.insert(signature.clone(), groups.len());
                groups.push((signature, vec![site]));
            }
        }
    }
    groups
}

pub struct FunctionResolver<'a> {
    loader: Option<&'a Arc<dyn WorkerLoader>>,
    config: &'a SandboxConfig,
}

impl<'a> FunctionResolver<'a> {
    pub fn new(loader: Option<&'a Arc<dyn WorkerLoader>>, config: &'a SandboxConfig) -> Self {
        Self { loader, config }
    }

    /// Replace every marker in `documents` with its function result
    ///
    /// Documents are only modified once every batch has succeeded.
    pub async fn resolve(&self, documents: &mut [Value]) -> Result<(), ExecuteError> {
        let sites = find_markers(documents)?;
        if sites.is_empty() {
            return Ok(());
        }
        let loader = self.loader.ok_or(ExecuteError::MissingSandboxBinding)?;

        let groups = group_by_signature(sites);
        debug!("Resolving {} $function signature(s)", groups.len());

        let mut replacements = Vec::new();
        for (signature, group) in groups {
            let args: Vec<Vec<Value>> = group
                .iter()
                .map(|site| site.marker.resolve_args(&documents[site.document]))
                .collect();
            let results = self.run_batches(loader.as_ref(), &signature.body, args).await?;
            replacements.extend(group.into_iter().zip(results));
        }

        for (site, result) in replacements {
            splice(&mut documents[site.document], &site.path, result);
        }
        Ok(())
    }

    async fn run_batches(
        &self,
        loader: &dyn WorkerLoader,
        body: &str,
        args: Vec<Vec<Value>>,
    ) -> Result<Vec<Value>, ExecuteError> {
        let name = worker_name(&self.config.worker_name_prefix, body);
        let code = WorkerCode::for_function(body, self.config);
        let entrypoint = loader.get(&name, code).get_entrypoint();

        let mut results = Vec::with_capacity(args.len());
        for chunk in args.chunks(self.config.max_batch_size.max(1)) {
            info!("Executing $function batch on {}: {} call(s)", name, chunk.len());
            let request = BatchRequest {
                args_array: chunk.to_vec(),
            };
            let body = serde_json::to_string(&request)
                .map_err(|e| ExecuteError::BatchExecutionFailed(e.to_string()))?;

            let response = entrypoint.fetch(WorkerRequest::post(body)).await.map_err(|e| {
                warn!("Worker {} request failed: {}", name, e);
                e
            })?;
            let parsed: BatchResponse = serde_json::from_str(&response.body).map_err(|e| {
                ExecuteError::BatchExecutionFailed(format!(
                    "worker {} answered {} with an unreadable body: {}",
                    name, response.status, e
                ))
            })?;
            let batch = parsed.into_results(chunk.len()).map_err(|e| {
                warn!("Worker {} reported a failure: {}", name, e);
                e
            })?;
            results.extend(batch);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsql_ir::FunctionCall;
    use serde_json::json;

    fn marker(body: &str, args: Vec<docsql_ir::Expression>) -> String {
        FunctionMarker::from_call(&FunctionCall {
            body: body.to_string(),
            args,
            lang: "js".to_string(),
        })
        .unwrap()
        .encode()
    }

    #[test]
    fn test_find_nested_markers() {
        let m = marker("() => 1", vec![]);
        let docs = vec![
            json!({"a": 1}),
            json!({"x": {"y": [0, m.clone()]}, "z": m}),
        ];
        let sites = find_markers(&docs).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].document, 1);
        assert_eq!(
            sites[0].path,
            vec![
                PathSegment::Key("x".to_string()),
                PathSegment::Key("y".to_string()),
                PathSegment::Index(1)
            ]
        );
        assert_eq!(sites[1].path, vec![PathSegment::Key("z".to_string())]);
    }

    #[test]
    fn test_malformed_marker() {
        let docs = vec![json!({"f": "__FUNCTION__{not json"})];
        assert!(matches!(
            find_markers(&docs),
            Err(ExecuteError::MalformedFunctionMarker(_))
        ));
    }

    #[test]
    fn test_group_by_signature() {
        let field = docsql_ir::Expression::FieldRef(docsql_ir::FieldPath::parse("v").unwrap());
        let double = marker("(x) => x * 2", vec![field.clone()]);
        let other = marker("(x) => x * 3", vec![field]);
        let docs = vec![
            json!({"f": double.clone()}),
            json!({"f": other}),
            json!({"f": double}),
        ];
        let groups = group_by_signature(find_markers(&docs).unwrap());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.body, "(x) => x * 2");
        let owners: Vec<usize> = groups[0].1.iter().map(|site| site.document).collect();
        assert_eq!(owners, vec![0, 2]);
    }

    #[test]
    fn test_splice() {
        let mut doc = json!({"a": {"b": [1, "m"]}});
        splice(
            &mut doc,
            &[
                PathSegment::Key("a".to_string()),
                PathSegment::Key("b".to_string()),
                PathSegment::Index(1),
            ],
            json!(42),
        );
        assert_eq!(doc, json!({"a": {"b": [1, 42]}}));

        splice(&mut doc, &[PathSegment::Key("missing".to_string()), PathSegment::Index(0)], json!(0));
        assert_eq!(doc, json!({"a": {"b": [1, 42]}}));
    }

    #[tokio::test]
    async fn test_no_markers_needs_no_loader() {
        let config = SandboxConfig::default();
        let mut docs = vec![json!({"a": "plain"})];
        FunctionResolver::new(None, &config)
            .resolve(&mut docs)
            .await
            .unwrap();
        assert_eq!(docs, vec![json!({"a": "plain"})]);
    }

    #[tokio::test]
    async fn test_markers_without_loader_fail() {
        let config = SandboxConfig::default();
        let mut docs = vec![json!({"f": marker("() => 1", vec![])})];
        let err = FunctionResolver::new(None, &config)
            .resolve(&mut docs)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker_loaders binding"));
    }
}
