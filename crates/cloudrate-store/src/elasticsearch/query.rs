//! Translation of storage queries into Elasticsearch query DSL.

use chrono::{DateTime, SecondsFormat, Utc};
use cloudrate_core::{Filters, TYPE_FIELD};
use serde_json::{json, Value};

/// Name of the composite aggregation used for grouped totals.
pub const COMPOSITE_NAME: &str = "sum_and_price";

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Clauses every matching document must satisfy.
///
/// Covers the time range, the type filter, the metric type list and the
/// scope filter, which only ever matches a groupby attribute.
#[must_use]
pub fn build_must(
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    filters: &Filters,
    metric_types: Option<&[String]>,
    scope_key: &str,
) -> Vec<Value> {
    let mut must = vec![
        json!({ "range": { "start": { "gte": timestamp(begin) } } }),
        json!({ "range": { "end": { "lte": timestamp(end) } } }),
    ];
    if let Some(metric_type) = filters.get(TYPE_FIELD) {
        must.push(json!({ "term": { "type": metric_type } }));
    }
    if let Some(types) = metric_types.filter(|t| !t.is_empty()) {
        must.push(json!({ "terms": { "type": types } }));
    }
    if let Some(scope_id) = filters.get(scope_key) {
        must.push(json!({ "term": { format!("groupby.{scope_key}"): scope_id } }));
    }
    must
}

/// One clause per remaining filter.
///
/// A filter matches either a groupby or a metadata attribute, so each clause
/// is a `should` pair of which one term must match. Every clause is required.
#[must_use]
pub fn build_attribute_filters(filters: &Filters, scope_key: &str) -> Vec<Value> {
    filters
        .iter()
        .filter(|(key, _)| key.as_str() != TYPE_FIELD && key.as_str() != scope_key)
        .map(|(key, value)| {
            json!({
                "bool": {
                    "should": [
                        { "term": { format!("groupby.{key}"): value } },
                        { "term": { format!("metadata.{key}"): value } },
                    ],
                    "minimum_should_match": 1,
                }
            })
        })
        .collect()
}

/// Composite aggregation over `groupby`, summing quantity and price.
#[must_use]
pub fn build_composite(groupby: &[String], size: usize, after: Option<&Value>) -> Value {
    let sources: Vec<Value> = groupby
        .iter()
        .map(|field| {
            let target = if field == TYPE_FIELD {
                TYPE_FIELD.to_string()
            } else {
                format!("groupby.{field}")
            };
            json!({ field.as_str(): { "terms": { "field": target } } })
        })
        .collect();

    let mut composite = json!({ "sources": sources, "size": size });
    if let Some(after) = after {
        composite["after"] = after.clone();
    }
    json!({
        COMPOSITE_NAME: {
            "composite": composite,
            "aggregations": sum_aggregations(),
        }
    })
}

/// Plain `sum` aggregations of quantity and price.
#[must_use]
pub fn sum_aggregations() -> Value {
    json!({
        "sum_qty": { "sum": { "field": "qty" } },
        "sum_price": { "sum": { "field": "price" } },
    })
}

/// Assemble the `query` body; every clause must match.
#[must_use]
pub fn build_query(mut must: Vec<Value>, attribute_filters: Vec<Value>) -> Value {
    must.extend(attribute_filters);
    json!({ "bool": { "must": must } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    fn filters(pairs: &[(&str, &str)]) -> Filters {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn must_covers_range_type_and_scope() {
        let (begin, end) = range();
        let types = vec!["compute".to_string(), "image".to_string()];
        let must = build_must(
            begin,
            end,
            &filters(&[("type", "compute"), ("project_id", "p1"), ("flavor", "m1")]),
            Some(&types),
            "project_id",
        );
        assert_eq!(must[0], json!({ "range": { "start": { "gte": "2024-01-01T00:00:00Z" } } }));
        assert_eq!(must[1], json!({ "range": { "end": { "lte": "2024-01-02T00:00:00Z" } } }));
        assert!(must.contains(&json!({ "term": { "type": "compute" } })));
        assert!(must.contains(&json!({ "terms": { "type": ["compute", "image"] } })));
        assert!(must.contains(&json!({ "term": { "groupby.project_id": "p1" } })));
        assert_eq!(must.len(), 5);
    }

    #[test]
    fn attribute_filter_pairs_groupby_and_metadata() {
        let clauses = build_attribute_filters(
            &filters(&[("type", "compute"), ("project_id", "p1"), ("flavor", "m1")]),
            "project_id",
        );
        assert_eq!(
            clauses,
            vec![json!({
                "bool": {
                    "should": [
                        { "term": { "groupby.flavor": "m1" } },
                        { "term": { "metadata.flavor": "m1" } },
                    ],
                    "minimum_should_match": 1,
                }
            })]
        );
    }

    #[test]
    fn every_attribute_filter_is_required() {
        let clauses = build_attribute_filters(&filters(&[("flavor", "m1"), ("user_id", "u1")]), "project_id");
        let query = build_query(vec![json!({ "match_all": {} })], clauses);

        let must = query["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[1]["bool"]["should"][0], json!({ "term": { "groupby.flavor": "m1" } }));
        assert_eq!(must[2]["bool"]["should"][1], json!({ "term": { "metadata.user_id": "u1" } }));
        assert!(must[1..].iter().all(|c| c["bool"]["minimum_should_match"] == 1));
        // Nothing at the top level lets one filter stand in for another.
        assert!(query["bool"].get("should").is_none());
        assert!(query["bool"].get("minimum_should_match").is_none());
    }

    #[test]
    fn composite_maps_type_to_root_field() {
        let groupby = vec!["type".to_string(), "project_id".to_string()];
        let after = json!({ "type": "compute", "project_id": "p1" });
        let aggs = build_composite(&groupby, 10, Some(&after));
        let composite = &aggs[COMPOSITE_NAME]["composite"];
        assert_eq!(composite["sources"][0]["type"]["terms"]["field"], "type");
        assert_eq!(
            composite["sources"][1]["project_id"]["terms"]["field"],
            "groupby.project_id"
        );
        assert_eq!(composite["after"], after);
        assert_eq!(composite["size"], 10);
        assert!(aggs[COMPOSITE_NAME]["aggregations"]["sum_qty"].is_object());
    }
}
