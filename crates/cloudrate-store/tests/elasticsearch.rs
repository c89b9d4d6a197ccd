//! Elasticsearch backend tests against a mock cluster.

mod common;

use common::{assert_scenario_totals, hour, scenario_frame, scenario_records, SCOPE};

use cloudrate_core::{DataFrame, Decimal, Filters, RetrieveQuery, TotalQuery};
use cloudrate_store::{ElasticsearchConfig, ElasticsearchStorage, Storage, StoreError};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storage(server: &MockServer) -> ElasticsearchStorage {
    config_storage(ElasticsearchConfig {
        url: server.uri(),
        ..ElasticsearchConfig::default()
    })
}

fn config_storage(config: ElasticsearchConfig) -> ElasticsearchStorage {
    ElasticsearchStorage::new(config).unwrap()
}

fn hits(records: &[Value], total: u64, scroll_id: Option<&str>) -> Value {
    let hits: Vec<Value> = records.iter().map(|r| json!({ "_source": r })).collect();
    let mut body = json!({
        "took": 3,
        "hits": { "total": { "value": total, "relation": "eq" }, "hits": hits },
    });
    if let Some(id) = scroll_id {
        body["_scroll_id"] = json!(id);
    }
    body
}

fn records() -> Vec<Value> {
    scenario_records()
        .iter()
        .map(|r| serde_json::to_value(r).unwrap())
        .collect()
}

fn bucket(metric_type: &str, project: &str, qty: f64, price: f64) -> Value {
    json!({
        "key": { "type": metric_type, "project_id": project },
        "doc_count": 1,
        "sum_qty": { "value": qty },
        "sum_price": { "value": price },
    })
}

fn composite(buckets: Vec<Value>, after_key: Option<Value>) -> Value {
    let mut aggregation = json!({ "buckets": buckets });
    if let Some(after) = after_key {
        aggregation["after_key"] = after;
    }
    json!({
        "took": 2,
        "hits": { "total": { "value": 4, "relation": "eq" }, "hits": [] },
        "aggregations": { "sum_and_price": aggregation },
    })
}

fn point_count(frames: &[DataFrame]) -> usize {
    frames.iter().map(DataFrame::len).sum()
}

// ============================================================================
// Provisioning
// ============================================================================

#[tokio::test]
async fn init_creates_missing_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cloudkitty"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/cloudkitty"))
        .and(body_partial_json(json!({
            "mappings": { "properties": { "type": { "type": "keyword" }, "qty": { "type": "double" } } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&server)
        .await;

    storage(&server).init().await.unwrap();
}

#[tokio::test]
async fn init_tolerates_concurrent_index_creation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cloudkitty"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/cloudkitty"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "resource_already_exists_exception" },
            "status": 400,
        })))
        .mount(&server)
        .await;

    storage(&server).init().await.unwrap();
}

#[tokio::test]
async fn init_updates_mapping_of_existing_index() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cloudkitty"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "cloudkitty": {} })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/cloudkitty/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&server)
        .await;

    storage(&server).init().await.unwrap();
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn push_bulk_indexes_every_point() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errors": false, "items": [] })))
        .expect(1)
        .mount(&server)
        .await;

    storage(&server).push(&[scenario_frame()], SCOPE).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 8);
    assert_eq!(lines[0], r#"{"index":{}}"#);
    let doc: Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(doc["type"], "compute");
    assert_eq!(doc["groupby"]["project_id"], "p1");
    assert_eq!(doc["start"], "2024-01-01T00:00:00Z");
}

#[tokio::test]
async fn push_sends_full_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errors": false, "items": [] })))
        .expect(2)
        .mount(&server)
        .await;

    let mut storage = config_storage(ElasticsearchConfig {
        url: server.uri(),
        chunk_size: 3,
        ..ElasticsearchConfig::default()
    });
    storage.push(&[scenario_frame()], SCOPE).await.unwrap();
}

#[tokio::test]
async fn rejected_bulk_items_are_typed_and_kept() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [
                { "index": { "status": 201 } },
                { "index": { "status": 400, "error": { "type": "mapper_parsing_exception" } } },
            ],
        })))
        .expect(2)
        .mount(&server)
        .await;

    let mut storage = storage(&server);
    let err = storage.push(&[scenario_frame()], SCOPE).await.unwrap_err();
    assert!(
        matches!(err, StoreError::BulkRejected { failed: 1, total: 4, ref reason } if reason.contains("mapper_parsing_exception")),
        "{err:?}"
    );

    // The documents stay buffered and are sent again.
    assert!(storage.flush().await.is_err());
}

#[tokio::test]
async fn failed_bulk_keeps_the_whole_push_buffered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_bulk"))
        .respond_with(ResponseTemplate::new(500).set_body_string("cluster unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errors": false, "items": [] })))
        .mount(&server)
        .await;

    let mut storage = config_storage(ElasticsearchConfig {
        url: server.uri(),
        chunk_size: 2,
        ..ElasticsearchConfig::default()
    });
    let err = storage.push(&[scenario_frame()], SCOPE).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidStatusCode { actual: 500, .. }), "{err:?}");
    assert_eq!(storage.buffered(), 4);

    storage.flush().await.unwrap();
    assert_eq!(storage.buffered(), 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    // Action and source line per document.
    let resent: usize = requests[1..]
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).lines().count() / 2)
        .sum();
    assert_eq!(resent, 4);
}

// ============================================================================
// Retrieval
// ============================================================================

#[tokio::test]
async fn retrieve_scrolls_and_releases_cursor() {
    let server = MockServer::start().await;
    let records = records();
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .and(query_param("scroll", "60s"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(&records[..2], 4, Some("s1"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({ "scroll_id": "s1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(&records[2..], 4, Some("s1"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({ "scroll_id": ["s1"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true, "num_freed": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let storage = config_storage(ElasticsearchConfig {
        url: server.uri(),
        chunk_size: 2,
        ..ElasticsearchConfig::default()
    });
    let result = storage
        .retrieve(&RetrieveQuery::new(hour(0), hour(1)))
        .await
        .unwrap();

    assert_eq!(result.total, 4);
    assert_eq!(result.dataframes.len(), 1);
    assert_eq!(point_count(&result.dataframes), 4);
    assert_eq!(result.dataframes[0].points("compute").len(), 3);
}

#[tokio::test]
async fn retrieve_limit_reports_full_total() {
    let server = MockServer::start().await;
    let records = records();
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(&records[..2], 4, Some("s1"))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(&records[2..], 4, Some("s1"))))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true, "num_freed": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let storage = config_storage(ElasticsearchConfig {
        url: server.uri(),
        chunk_size: 2,
        ..ElasticsearchConfig::default()
    });
    let result = storage
        .retrieve(&RetrieveQuery::new(hour(0), hour(1)).with_page(1, 1))
        .await
        .unwrap();

    assert_eq!(result.total, 4);
    assert_eq!(point_count(&result.dataframes), 1);
    // Offset 1 skips the first compute point.
    assert_eq!(result.dataframes[0].points("volume").len(), 1);
}

#[tokio::test]
async fn scroll_is_released_when_a_page_fails() {
    let server = MockServer::start().await;
    let records = records();
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(&records[..2], 4, Some("s1"))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(500).set_body_string("search_context_missing_exception"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true, "num_freed": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let storage = config_storage(ElasticsearchConfig {
        url: server.uri(),
        chunk_size: 2,
        ..ElasticsearchConfig::default()
    });
    let err = storage
        .retrieve(&RetrieveQuery::new(hour(0), hour(1)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, StoreError::InvalidStatusCode { expected: 200, actual: 500, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn search_errors_carry_status_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let err = storage(&server)
        .total(&TotalQuery::new(hour(0), hour(1)))
        .await
        .unwrap_err();
    match err {
        StoreError::InvalidStatusCode { expected, actual, body, query } => {
            assert_eq!((expected, actual), (200, 503));
            assert_eq!(body, "unavailable");
            assert!(query.contains("sum_qty"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

// ============================================================================
// Totals
// ============================================================================

#[tokio::test]
async fn grouped_total_walks_composite_pages() {
    let server = MockServer::start().await;
    let after = json!({ "type": "compute", "project_id": "p2" });
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .and(body_partial_json(json!({
            "aggregations": { "sum_and_price": { "composite": { "after": after.clone() } } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(composite(
            vec![bucket("volume", "p1", 5.0, 50.0)],
            None,
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(composite(
            vec![
                bucket("compute", "p1", 18.0, 180.0),
                bucket("compute", "p2", 2.0, 20.0),
            ],
            Some(after),
        )))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    let totals = storage(&server)
        .total(&TotalQuery::new(hour(0), hour(1)).with_groupby(["type", "project_id"]))
        .await
        .unwrap();
    assert_scenario_totals(&totals);
}

#[tokio::test]
async fn composite_walk_stops_at_page_bound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(composite(
            vec![
                bucket("compute", "p1", 18.0, 180.0),
                bucket("compute", "p2", 2.0, 20.0),
            ],
            Some(json!({ "type": "compute", "project_id": "p2" })),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let storage = config_storage(ElasticsearchConfig {
        url: server.uri(),
        max_composite_pages: 1,
        ..ElasticsearchConfig::default()
    });
    let totals = storage
        .total(&TotalQuery::new(hour(0), hour(1)).with_groupby(["type", "project_id"]))
        .await
        .unwrap();
    assert_eq!(totals.total, 2);
    assert_eq!(totals.results.len(), 2);
}

#[tokio::test]
async fn grouped_total_pages_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(composite(
            vec![
                bucket("compute", "p1", 18.0, 180.0),
                bucket("compute", "p2", 2.0, 20.0),
                bucket("volume", "p1", 5.0, 50.0),
            ],
            None,
        )))
        .mount(&server)
        .await;

    let totals = storage(&server)
        .total(
            &TotalQuery::new(hour(0), hour(1))
                .with_groupby(["type", "project_id"])
                .with_page(1, 1),
        )
        .await
        .unwrap();
    assert_eq!(totals.total, 3);
    assert_eq!(totals.results.len(), 1);
    assert_eq!(totals.results[0].groupby["project_id"], "p2");
}

#[tokio::test]
async fn ungrouped_total_uses_sums() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .and(body_partial_json(json!({ "size": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "took": 1,
            "hits": { "total": 4, "hits": [] },
            "aggregations": { "sum_qty": { "value": 25.0 }, "sum_price": { "value": 250.0 } },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let totals = storage(&server)
        .total(&TotalQuery::new(hour(0), hour(1)))
        .await
        .unwrap();
    assert_eq!(totals.total, 1);
    assert_eq!(totals.results[0].qty, Decimal::from(25));
    assert_eq!(totals.results[0].rate, Decimal::from(250));
    assert!(totals.results[0].groupby.is_empty());
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn delete_by_query_targets_scope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_delete_by_query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": 3 })))
        .expect(1)
        .mount(&server)
        .await;

    let filters: Filters = [("project_id".to_string(), "p1".to_string())].into();
    storage(&server).delete(hour(0), hour(1), &filters).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let must = body["query"]["bool"]["must"].as_array().unwrap();
    assert!(must.contains(&json!({ "term": { "groupby.project_id": "p1" } })));
}

#[tokio::test]
async fn delete_then_retrieve_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_delete_by_query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": 4 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cloudkitty/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hits(&[], 0, Some("s1"))))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true, "num_freed": 1 })))
        .mount(&server)
        .await;

    let mut storage = storage(&server);
    storage.delete(hour(0), hour(1), &Filters::new()).await.unwrap();
    let result = storage
        .retrieve(&RetrieveQuery::new(hour(0), hour(1)))
        .await
        .unwrap();
    assert_eq!(result.total, 0);
    assert!(result.dataframes.is_empty());
}
