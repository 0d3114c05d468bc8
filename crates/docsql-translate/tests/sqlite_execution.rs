//! Runs generated sqlite SQL against an in-memory database
//!
//! Each test loads a small collection into a one-column table and checks the
//! documents the translated statement returns.

use docsql_dialect::SqlParam;
use docsql_translate::{
    AggregationTranslator, Dialect, QueryTranslator, TranslatedAggregate, TranslatedQuery,
    TranslatorOptions,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};

fn setup(collections: &[(&str, Vec<Value>)]) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    for (name, docs) in collections {
        conn.execute(&format!("CREATE TABLE \"{}\" (data TEXT NOT NULL)", name), [])
            .unwrap();
        for doc in docs {
            conn.execute(
                &format!("INSERT INTO \"{}\" (data) VALUES (?1)", name),
                [doc.to_string()],
            )
            .unwrap();
        }
    }
    conn
}

fn bind(param: &SqlParam) -> SqlValue {
    match param {
        SqlParam::Null => SqlValue::Null,
        SqlParam::Bool(b) => SqlValue::Integer(i64::from(*b)),
        SqlParam::Int(i) => SqlValue::Integer(*i),
        SqlParam::Float(f) => SqlValue::Real(*f),
        SqlParam::Text(s) | SqlParam::Json(s) => SqlValue::Text(s.clone()),
    }
}

fn run(conn: &Connection, query: &TranslatedQuery) -> Vec<Value> {
    let mut statement = conn
        .prepare(&query.sql)
        .unwrap_or_else(|e| panic!("{}\n{}", e, query.sql));
    let rows = statement
        .query_map(params_from_iter(query.params.iter().map(bind)), |row| {
            row.get::<_, String>(0)
        })
        .unwrap();
    rows.map(|row| serde_json::from_str(&row.unwrap()).unwrap())
        .collect()
}

fn aggregate(conn: &Connection, collection: &str, pipeline: Value) -> Vec<Value> {
    let translator = AggregationTranslator::new(Dialect::Sqlite, TranslatorOptions::default());
    match translator.translate(collection, &pipeline).unwrap() {
        TranslatedAggregate::Single(query) => run(conn, &query),
        other => panic!("expected a single statement, got {:?}", other),
    }
}

fn orders() -> Vec<Value> {
    vec![
        json!({"_id": 1, "status": "done", "amount": 30, "customer": 10, "tags": ["a", "b"]}),
        json!({"_id": 2, "status": "open", "amount": 5, "customer": 11, "tags": ["b"]}),
        json!({"_id": 3, "status": "done", "amount": 12, "customer": 10, "tags": []}),
        json!({"_id": 4, "status": "done", "amount": 7, "customer": 12}),
    ]
}

fn customers() -> Vec<Value> {
    vec![
        json!({"_id": 10, "name": "Ada"}),
        json!({"_id": 11, "name": "Grace"}),
    ]
}

#[test]
fn test_empty_pipeline_returns_every_document() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(&conn, "orders", json!([{"$match": {}}]));
    assert_eq!(docs, orders());
}

#[test]
fn test_empty_in_matches_nothing() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(&conn, "orders", json!([{"$match": {"status": {"$in": []}}}]));
    assert!(docs.is_empty());
}

#[test]
fn test_match_in() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$match": {"_id": {"$in": [1, 2, 9]}}}]),
    );
    let ids: Vec<&Value> = docs.iter().map(|d| &d["_id"]).collect();
    assert_eq!(ids, vec![&json!(1), &json!(2)]);
}

#[test]
fn test_sort_and_limit() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$sort": {"amount": -1}}, {"$limit": 2}]),
    );
    let amounts: Vec<&Value> = docs.iter().map(|d| &d["amount"]).collect();
    assert_eq!(amounts, vec![&json!(30), &json!(12)]);
}

#[test]
fn test_limit_then_skip() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$sort": {"_id": 1}}, {"$limit": 3}, {"$skip": 1}]),
    );
    let ids: Vec<&Value> = docs.iter().map(|d| &d["_id"]).collect();
    assert_eq!(ids, vec![&json!(2), &json!(3)]);
}

#[test]
fn test_repeated_limit_and_skip_keep_the_last() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(&conn, "orders", json!([{"$limit": 1}, {"$limit": 3}]));
    assert_eq!(docs.len(), 3);

    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$sort": {"_id": 1}}, {"$skip": 3}, {"$skip": 1}]),
    );
    let ids: Vec<&Value> = docs.iter().map(|d| &d["_id"]).collect();
    assert_eq!(ids, vec![&json!(2), &json!(3), &json!(4)]);
}

#[test]
fn test_match_after_limit_filters_the_window() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$sort": {"_id": 1}}, {"$limit": 2}, {"$match": {"status": "done"}}]),
    );
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["_id"], json!(1));
}

#[test]
fn test_group_sum_then_sort() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([
            {"$group": {"_id": "$status", "total": {"$sum": "$amount"}, "n": {"$count": {}}}},
            {"$sort": {"total": -1}}
        ]),
    );
    assert_eq!(
        docs,
        vec![
            json!({"_id": "done", "total": 49, "n": 3}),
            json!({"_id": "open", "total": 5, "n": 1}),
        ]
    );
}

#[test]
fn test_unwind_then_group() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([
            {"$unwind": "$tags"},
            {"$group": {"_id": "$tags", "n": {"$sum": 1}}},
            {"$sort": {"_id": 1}}
        ]),
    );
    assert_eq!(docs, vec![json!({"_id": "a", "n": 1}), json!({"_id": "b", "n": 2})]);
}

#[test]
fn test_unwind_drops_missing_and_empty_arrays() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(&conn, "orders", json!([{"$unwind": "$tags"}]));
    assert_eq!(docs.len(), 3);
    assert!(docs.iter().all(|d| d["tags"].is_string()));
}

#[test]
fn test_lookup_equality() {
    let conn = setup(&[("orders", orders()), ("customers", customers())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([
            {"$match": {"_id": {"$in": [1, 4]}}},
            {"$lookup": {
                "from": "customers",
                "localField": "customer",
                "foreignField": "_id",
                "as": "buyer"
            }},
            {"$sort": {"_id": 1}}
        ]),
    );
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["buyer"], json!([{"_id": 10, "name": "Ada"}]));
    assert_eq!(docs[1]["buyer"], json!([]));
}

#[test]
fn test_count() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$match": {"status": "done"}}, {"$count": "n"}]),
    );
    assert_eq!(docs, vec![json!({"n": 3})]);

    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$match": {"status": "gone"}}, {"$count": "n"}]),
    );
    assert_eq!(docs, vec![json!({"n": 0})]);
}

#[test]
fn test_project_inclusion() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$match": {"_id": 2}}, {"$project": {"status": 1, "_id": 0}}]),
    );
    assert_eq!(docs, vec![json!({"status": "open"})]);
}

#[test]
fn test_unset() {
    let conn = setup(&[("orders", orders())]);
    let docs = aggregate(
        &conn,
        "orders",
        json!([{"$match": {"_id": 2}}, {"$unset": ["tags", "customer"]}]),
    );
    assert_eq!(docs, vec![json!({"_id": 2, "status": "open", "amount": 5})]);
}

#[test]
fn test_query_translator_where_clause() {
    let conn = setup(&[("orders", orders())]);
    let query = QueryTranslator::new(Dialect::Sqlite)
        .translate(&json!({"status": "done", "amount": {"$gte": 10}}))
        .unwrap();
    let select = TranslatedQuery {
        sql: format!("SELECT data FROM \"orders\" WHERE {}", query.sql),
        params: query.params,
    };
    let ids: Vec<Value> = run(&conn, &select).iter().map(|d| d["_id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(3)]);
}
