//! 校验器性质：合法管道无错误、错误定位到具体阶段、重复校验结果一致、序列化保持阶段与键顺序

use docquery::pipeline::{validate, IssueReason, Pipeline};
use docquery::schema::purchase_orders;
use serde_json::{json, Value};

fn pipeline(v: Value) -> Pipeline {
    Pipeline::from_value(&v).unwrap()
}

fn corpus() -> Vec<Value> {
    vec![
        json!([{"$count": "count"}]),
        json!([
            {"$match": {"dates.creation": {"$gte": {"$date": "2013-07-01T00:00:00Z"}}}},
            {"$group": {"_id": "$department.name", "total": {"$sum": {"$ifNull": ["$item.total_price", 0]}}}},
            {"$sort": {"total": -1, "_id": 1}},
            {"$limit": 5}
        ]),
        json!([
            {"$match": {"acquisition.type": {"$in": ["IT Goods", "IT Services"]}}},
            {"$project": {"supplier.name": 1, "quarter": {"$ceil": {"$divide": [{"$month": "$dates.creation"}, 3]}}}},
            {"$sortByCount": "$quarter"}
        ]),
        json!([{"$unwind": "$supplier.qualifications"}, {"$group": {"_id": "$supplier.qualifications", "n": {"$sum": 1}}}]),
        json!([{"$match": {"bogus.field": 1}}, {"$frobnicate": {}}, {"$limit": 5000}]),
        json!([{"$merge": {"into": "x"}}]),
    ]
}

#[test]
fn valid_pipelines_have_no_errors() {
    let schema = purchase_orders();
    for v in corpus().into_iter().take(4) {
        let p = pipeline(v.clone());
        let result = validate(&p, &schema, 10);
        assert!(result.ok, "{} -> {:?}", v, result.errors);
        assert!(result.errors.is_empty());
    }
}

#[test]
fn errors_point_at_offending_stage() {
    let schema = purchase_orders();
    let p = pipeline(corpus()[4].clone());
    let result = validate(&p, &schema, 10);
    assert!(!result.ok);
    let indexed: Vec<(usize, &IssueReason)> =
        result.errors.iter().map(|e| (e.stage_index, &e.reason)).collect();
    assert!(indexed
        .iter()
        .any(|(i, r)| *i == 0 && matches!(r, IssueReason::UnknownField { path } if path == "bogus.field")));
    assert!(indexed
        .iter()
        .any(|(i, r)| *i == 1 && matches!(r, IssueReason::UnknownOperator { operator } if operator == "$frobnicate")));
    assert!(indexed
        .iter()
        .any(|(i, r)| *i == 2 && matches!(r, IssueReason::LimitExceeded { .. })));
}

#[test]
fn validation_is_idempotent() {
    let schema = purchase_orders();
    for v in corpus() {
        let p = pipeline(v);
        assert_eq!(validate(&p, &schema, 10), validate(&p, &schema, 10));
    }
}

#[test]
fn write_stages_never_pass() {
    let schema = purchase_orders();
    let result = validate(&pipeline(corpus()[5].clone()), &schema, 10);
    assert!(!result.ok);
    assert!(matches!(result.errors[0].reason, IssueReason::WriteStage { .. }));
}

#[test]
fn serialized_pipeline_reparses_identically() {
    for v in corpus() {
        let p = pipeline(v);
        let text = serde_json::to_string(&p).unwrap();
        let back: Pipeline = serde_json::from_str(&text).unwrap();
        assert_eq!(p, back);
        assert_eq!(p.operators(), back.operators());
        // 多键 $sort 的键顺序有语义
        assert_eq!(p.to_value().to_string(), back.to_value().to_string());
    }
}
