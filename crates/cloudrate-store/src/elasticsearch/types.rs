//! Elasticsearch mapping and API types.

use std::collections::BTreeMap;

use cloudrate_core::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::record::PointRecord;

/// Mapping of the rating index.
///
/// String attributes under `groupby` and `metadata` are mapped as keywords so
/// they can be filtered on and used in composite sources.
#[must_use]
pub fn index_mapping() -> Value {
    json!({
        "dynamic_templates": [
            {
                "strings_as_keywords": {
                    "match_mapping_type": "string",
                    "mapping": { "type": "keyword" }
                }
            }
        ],
        "dynamic": false,
        "properties": {
            "start": { "type": "date" },
            "end": { "type": "date" },
            "type": { "type": "keyword" },
            "unit": { "type": "keyword" },
            "description": { "type": "text" },
            "qty": { "type": "double" },
            "price": { "type": "double" },
            "groupby": { "dynamic": true, "type": "object" },
            "metadata": { "dynamic": true, "type": "object" }
        }
    })
}

/// `_search` / `_search/scroll` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    /// Scroll cursor, present when a scroll was requested.
    #[serde(rename = "_scroll_id", default)]
    pub scroll_id: Option<String>,
    /// Server-side duration in ms.
    #[serde(default)]
    pub took: u64,
    /// Matching documents.
    pub hits: Hits,
    /// Aggregation results.
    #[serde(default)]
    pub aggregations: Option<Aggregations>,
}

/// Hits section of a search response.
#[derive(Debug, Clone, Deserialize)]
pub struct Hits {
    /// Number of matches.
    pub total: HitsTotal,
    /// Documents of this page.
    #[serde(default)]
    pub hits: Vec<Hit>,
}

/// `hits.total`: a plain count before Elasticsearch 7, an object after.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum HitsTotal {
    /// Legacy count.
    Count(u64),
    /// `{value, relation}` object.
    Object {
        /// Count.
        value: u64,
    },
}

impl HitsTotal {
    /// The count.
    #[must_use]
    pub fn value(self) -> u64 {
        match self {
            Self::Count(value) | Self::Object { value } => value,
        }
    }
}

/// One hit.
#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    /// Indexed document.
    #[serde(rename = "_source")]
    pub source: PointRecord,
}

/// Aggregations requested by `total`.
#[derive(Debug, Clone, Deserialize)]
pub struct Aggregations {
    /// Composite aggregation of grouped totals.
    #[serde(default)]
    pub sum_and_price: Option<CompositeAggregation>,
    /// Ungrouped quantity sum.
    #[serde(default)]
    pub sum_qty: Option<SumValue>,
    /// Ungrouped price sum.
    #[serde(default)]
    pub sum_price: Option<SumValue>,
}

/// One page of a composite aggregation.
#[derive(Debug, Clone, Deserialize)]
pub struct CompositeAggregation {
    /// Cursor of the next page.
    #[serde(default)]
    pub after_key: Option<Value>,
    /// Buckets of this page.
    #[serde(default)]
    pub buckets: Vec<Bucket>,
}

/// One composite bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct Bucket {
    /// Values of the composite sources.
    pub key: BTreeMap<String, Value>,
    /// Quantity sum.
    pub sum_qty: SumValue,
    /// Price sum.
    pub sum_price: SumValue,
}

impl Bucket {
    /// Composite key values as strings.
    #[must_use]
    pub fn key_strings(&self) -> BTreeMap<String, String> {
        self.key
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// `sum` aggregation result.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SumValue {
    /// Sum, absent or null when nothing matched.
    #[serde(default)]
    pub value: Option<Decimal>,
}

impl SumValue {
    /// The sum, zero when absent.
    #[must_use]
    pub fn amount(self) -> Decimal {
        self.value.unwrap_or(Decimal::ZERO)
    }
}

/// `_bulk` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    /// Whether any item failed.
    #[serde(default)]
    pub errors: bool,
    /// Per-document results.
    #[serde(default)]
    pub items: Vec<BTreeMap<String, BulkItem>>,
}

/// Result of one bulk action.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkItem {
    /// HTTP status of the action.
    #[serde(default)]
    pub status: u16,
    /// Error details when the action failed.
    #[serde(default)]
    pub error: Option<Value>,
}

/// `DELETE _search/scroll` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ClearScrollResponse {
    /// Number of released contexts.
    #[serde(default)]
    pub num_freed: u64,
}
