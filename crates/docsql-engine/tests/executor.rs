//! Executor behavior against in-memory SQL and sandbox fakes

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{FakeLoader, FakeSql};
use docsql_engine::{
    AggregationExecutor, EngineConfig, ExecuteError, FindOptions, Row, RowCursor, SqlExecutor,
    SqlParam, SqlResult,
};
use docsql_ir::{parse_expression, FunctionCall, FunctionMarker};
use serde_json::{json, Value};

fn marker(body: &str, args: Value) -> String {
    let args = args
        .as_array()
        .unwrap()
        .iter()
        .map(|arg| parse_expression(arg).unwrap())
        .collect();
    FunctionMarker::from_call(&FunctionCall {
        body: body.to_string(),
        args,
        lang: "js".to_string(),
    })
    .unwrap()
    .encode()
}

fn executor(sql: Arc<FakeSql>) -> AggregationExecutor {
    AggregationExecutor::new(EngineConfig::default(), sql)
}

#[tokio::test]
async fn test_same_function_is_one_batch() -> anyhow::Result<()> {
    let double = marker("(x) => x * 2", json!(["$n"]));
    let sql = FakeSql::new(&[
        json!({"_id": 1, "n": 1, "d": double}),
        json!({"_id": 2, "n": 2, "d": double}),
        json!({"_id": 3, "n": 3, "d": double}),
    ]);
    let loader = FakeLoader::new(|args| json!(args[0].as_i64().unwrap() * 2));
    let executor = executor(sql).with_worker_loader(loader.clone());

    let docs = executor.execute("items", &json!([])).await?;

    let requests = loader.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].args_array.len(), 3);
    let doubled: Vec<&Value> = docs.iter().map(|d| &d["d"]).collect();
    assert_eq!(doubled, vec![&json!(2), &json!(4), &json!(6)]);
    Ok(())
}

#[tokio::test]
async fn test_literal_argument_order() -> anyhow::Result<()> {
    let sql = FakeSql::new(&[json!({"value": 5, "r": marker("(x,m)=>x*m", json!(["$value", 10]))})]);
    let loader = FakeLoader::new(|args| {
        json!(args[0].as_i64().unwrap() * args[1].as_i64().unwrap())
    });
    let executor = executor(sql).with_worker_loader(loader.clone());

    let docs = executor.execute("items", &json!([])).await?;

    assert_eq!(docs, vec![json!({"value": 5, "r": 50})]);
    assert_eq!(loader.requests()[0].args_array, vec![vec![json!(5), json!(10)]]);
    Ok(())
}

#[tokio::test]
async fn test_missing_paths_resolve_to_null() -> anyhow::Result<()> {
    let sql = FakeSql::new(&[json!({"f": marker("(a) => a", json!(["$deep.missing.path"]))})]);
    let loader = FakeLoader::new(|args| json!(args[0].is_null()));
    let executor = executor(sql).with_worker_loader(loader.clone());

    let docs = executor.execute("items", &json!([])).await?;
    assert_eq!(docs, vec![json!({"f": true})]);
    Ok(())
}

#[tokio::test]
async fn test_missing_sandbox_binding() {
    let sql = FakeSql::new(&[json!({"f": marker("() => 1", json!([]))})]);
    let err = executor(sql).execute("items", &json!([])).await.unwrap_err();
    assert!(matches!(err, ExecuteError::MissingSandboxBinding));
    assert!(err.to_string().contains("worker_loaders binding"));
}

#[tokio::test]
async fn test_batch_failure_fails_the_call() {
    let sql = FakeSql::new(&[
        json!({"f": marker("() => { throw new Error('x') }", json!([]))}),
    ]);
    let loader = FakeLoader::failing("Error: x");
    let err = executor(sql)
        .with_worker_loader(loader)
        .execute("items", &json!([]))
        .await
        .unwrap_err();
    match err {
        ExecuteError::BatchExecutionFailed(message) => assert_eq!(message, "Error: x"),
        other => panic!("expected a batch failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_marker() {
    let sql = FakeSql::new(&[json!({"f": "__FUNCTION__{\"body\": 3}"})]);
    let loader = FakeLoader::new(|_| Value::Null);
    let err = executor(sql)
        .with_worker_loader(loader.clone())
        .execute("items", &json!([]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::MalformedFunctionMarker(_)));
    assert!(loader.requests().is_empty());
}

#[tokio::test]
async fn test_no_markers_no_sandbox_calls() -> anyhow::Result<()> {
    let sql = FakeSql::new(&[json!({"a": 1}), json!({"a": "__FUNCTIONS are fun"})]);
    let loader = FakeLoader::new(|_| Value::Null);
    let executor = executor(sql.clone()).with_worker_loader(loader.clone());

    let docs = executor.execute("items", &json!([{"$match": {"a": {"$exists": true}}}])).await?;

    assert_eq!(docs.len(), 2);
    assert!(loader.requests().is_empty());
    assert!(loader.loads.lock().unwrap().is_empty());
    assert_eq!(sql.statement_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_batches_are_chunked() -> anyhow::Result<()> {
    let inc = marker("(x) => x + 1", json!(["$n"]));
    let documents: Vec<Value> = (0..5).map(|n| json!({"n": n, "f": inc})).collect();
    let loader = FakeLoader::new(|args| json!(args[0].as_i64().unwrap() + 1));

    let mut config = EngineConfig::default();
    config.sandbox.max_batch_size = 2;
    let executor = AggregationExecutor::new(config, FakeSql::new(&documents))
        .with_worker_loader(loader.clone());

    let docs = executor.execute("items", &json!([])).await?;

    let sizes: Vec<usize> = loader.requests().iter().map(|r| r.args_array.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    let results: Vec<i64> = docs.iter().map(|d| d["f"].as_i64().unwrap()).collect();
    assert_eq!(results, vec![1, 2, 3, 4, 5]);
    // one worker per function body
    assert_eq!(loader.loads.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_distinct_functions_get_distinct_workers() -> anyhow::Result<()> {
    let sql = FakeSql::new(&[json!({
        "a": marker("(x) => x", json!(["$v"])),
        "b": marker("(x) => -x", json!(["$v"])),
        "v": 3
    })]);
    let loader = FakeLoader::new(|args| args[0].clone());
    let executor = executor(sql).with_worker_loader(loader.clone());

    executor.execute("items", &json!([])).await?;

    let loads = loader.loads.lock().unwrap();
    assert_eq!(loads.len(), 2);
    assert_ne!(loads[0].0, loads[1].0);
    assert!(loads[0].0.starts_with("fn-"));
    Ok(())
}

#[tokio::test]
async fn test_undecodable_row() {
    let sql = FakeSql::raw(vec![Row::new("{}"), Row::new("not json")]);
    let err = executor(sql).execute("items", &json!([])).await.unwrap_err();
    assert!(matches!(err, ExecuteError::RowDecode { index: 1, .. }));
}

#[tokio::test]
async fn test_translate_errors_surface() {
    let sql = FakeSql::new(&[]);
    let err = executor(sql.clone())
        .execute("items", &json!([{"$group": {"_id": null, "s": {"$stdDevPop": "$n"}}}]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::Translate(_)));
    assert_eq!(sql.statement_count(), 0);
}

#[tokio::test]
async fn test_facets_merge_into_one_document() -> anyhow::Result<()> {
    let sql = FakeSql::new(&[json!({"n": 1})]);
    let docs = executor(sql.clone())
        .execute(
            "items",
            &json!([{"$facet": {"all": [{"$skip": 0}], "first": [{"$limit": 1}]}}]),
        )
        .await?;
    assert_eq!(docs, vec![json!({"all": [{"n": 1}], "first": [{"n": 1}]})]);
    assert_eq!(sql.statement_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_find_translates_options() -> anyhow::Result<()> {
    let sql = FakeSql::new(&[]);
    let options = FindOptions {
        sort: Some(json!({"age": -1})),
        limit: Some(3),
        ..FindOptions::default()
    };
    executor(sql.clone())
        .find("users", &json!({"active": true}), &options)
        .await?;

    let statements = sql.statements.lock().unwrap();
    let (text, params) = &statements[0];
    assert!(text.contains("FROM \"users\""), "{}", text);
    assert!(text.contains("ORDER BY"), "{}", text);
    assert_eq!(params.last(), Some(&SqlParam::Int(3)));
    Ok(())
}

struct CursorSql;

struct Pending(Vec<Row>);

#[async_trait]
impl RowCursor for Pending {
    async fn to_array(self: Box<Self>) -> Result<Vec<Row>, ExecuteError> {
        Ok(self.0)
    }
}

#[async_trait]
impl SqlExecutor for CursorSql {
    async fn exec(&self, _sql: &str, _params: &[SqlParam]) -> Result<SqlResult, ExecuteError> {
        Ok(SqlResult::Cursor(Box::new(Pending(vec![Row::new(r#"{"x":1}"#)]))))
    }
}

#[tokio::test]
async fn test_cursor_results() -> anyhow::Result<()> {
    let executor = AggregationExecutor::new(EngineConfig::default(), Arc::new(CursorSql));
    assert_eq!(executor.execute("items", &json!([])).await?, vec![json!({"x": 1})]);
    Ok(())
}
