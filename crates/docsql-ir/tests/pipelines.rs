//! Parsing realistic pipelines end to end

use docsql_ir::*;
use serde_json::json;

fn sales_pipeline() -> serde_json::Value {
    json!([
        {"$match": {"status": {"$in": ["paid", "shipped"]}, "total": {"$gte": 10}}},
        {"$unwind": {"path": "$items", "includeArrayIndex": "pos", "preserveNullAndEmptyArrays": true}},
        {"$lookup": {"from": "products", "localField": "items.sku", "foreignField": "sku", "as": "product"}},
        {"$set": {"line": {"$multiply": ["$items.qty", "$items.price"]}}},
        {"$group": {"_id": "$region", "revenue": {"$sum": "$line"}, "orders": {"$count": {}}}},
        {"$sort": {"revenue": -1, "_id": 1}},
        {"$skip": 5},
        {"$limit": 10}
    ])
}

#[test]
fn test_parse_sales_pipeline() {
    let pipeline = Pipeline::from_json(&sales_pipeline()).unwrap();

    let names: Vec<&str> = pipeline.stages.iter().map(Stage::name).collect();
    assert_eq!(
        names,
        vec!["$match", "$unwind", "$lookup", "$addFields", "$group", "$sort", "$skip", "$limit"]
    );

    match &pipeline.stages[1] {
        Stage::Unwind(unwind) => {
            assert_eq!(unwind.path.dotted(), "items");
            assert_eq!(unwind.include_array_index.as_ref().map(FieldPath::dotted), Some("pos".to_string()));
            assert!(unwind.preserve_null_and_empty_arrays);
        }
        other => panic!("expected $unwind, got {:?}", other),
    }

    match &pipeline.stages[5] {
        Stage::Sort(keys) => {
            assert_eq!(keys.len(), 2);
            assert_eq!(keys[0].path.dotted(), "revenue");
            assert!(keys[0].descending);
            assert!(!keys[1].descending);
        }
        other => panic!("expected $sort, got {:?}", other),
    }
}

#[test]
fn test_fingerprint_is_stable() {
    let a = Pipeline::from_json(&sales_pipeline()).unwrap();
    let b = Pipeline::from_json(&sales_pipeline()).unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_eq!(a.fingerprint().len(), 64);

    let other = Pipeline::from_json(&json!([{"$limit": 11}])).unwrap();
    assert_ne!(a.fingerprint(), other.fingerprint());
}

#[test]
fn test_lookup_requires_both_keys() {
    let err = parse_pipeline(&json!([
        {"$lookup": {"from": "products", "localField": "sku", "as": "p"}}
    ]))
    .unwrap_err();
    assert!(matches!(err, ParseError::InvalidStage { ref stage, .. } if stage == "$lookup"));
}

#[test]
fn test_facet_cannot_nest() {
    let err = parse_pipeline(&json!([
        {"$facet": {"outer": [{"$facet": {"inner": []}}]}}
    ]))
    .unwrap_err();
    assert!(matches!(err, ParseError::InvalidStage { ref stage, .. } if stage == "$facet"));
}

#[test]
fn test_rejects_malformed_stages() {
    assert_eq!(parse_pipeline(&json!({"$limit": 1})), Err(ParseError::NotAnArray));
    assert!(matches!(
        parse_pipeline(&json!([{"$limit": 1, "$skip": 2}])),
        Err(ParseError::MalformedStage(_))
    ));
    assert_eq!(
        parse_pipeline(&json!([{"$merge": "out"}])),
        Err(ParseError::UnknownStage("$merge".to_string()))
    );
    assert!(matches!(
        parse_pipeline(&json!([{"$limit": 0}])),
        Err(ParseError::InvalidStage { .. })
    ));
}

#[test]
fn test_function_marker_from_pipeline() {
    let pipeline = parse_pipeline(&json!([
        {"$addFields": {"score": {"$function": {
            "body": "(a, w) => a * w",
            "args": ["$stats.avg", 3],
            "lang": "js"
        }}}}
    ]))
    .unwrap();

    let call = match &pipeline.stages[0] {
        Stage::AddFields(fields) => match &fields[0].1 {
            Expression::Function(call) => call.clone(),
            other => panic!("expected $function, got {:?}", other),
        },
        other => panic!("expected $addFields, got {:?}", other),
    };

    let marker = FunctionMarker::from_call(&call).unwrap();
    let decoded = FunctionMarker::decode(&marker.encode()).unwrap();
    assert_eq!(decoded.arg_paths, vec!["stats.avg".to_string()]);
    assert_eq!(
        decoded.resolve_args(&json!({"stats": {"avg": 2.5}})),
        vec![json!(2.5), json!(3)]
    );
}
