//! Gnocchi API types and naming rules.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use cloudrate_core::{Attributes, DataPoint, Decimal};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Prefix of every resource type created by the backend.
pub const RESOURCE_TYPE_PREFIX: &str = "rating_";
/// Metric holding quantities.
pub const QTY_METRIC: &str = "qty";
/// Metric holding prices.
pub const COST_METRIC: &str = "cost";
/// Attribute holding the metric type.
pub const METRIC_TYPE_ATTR: &str = "metric_type";
/// Attribute holding the unit.
pub const UNIT_ATTR: &str = "unit";
/// Attribute holding the scope.
pub const SCOPE_ATTR: &str = "scope_id";

const GROUPBY_PREFIX: &str = "groupby_";
const META_PREFIX: &str = "meta_";

/// Replace every character Gnocchi rejects in names with `_`.
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Resource type holding the points of `metric_type`.
#[must_use]
pub fn resource_type_name(metric_type: &str) -> String {
    format!("{RESOURCE_TYPE_PREFIX}{}", sanitize(metric_type))
}

/// Attribute holding the groupby value `key`.
#[must_use]
pub fn groupby_attr(key: &str) -> String {
    format!("{GROUPBY_PREFIX}{}", sanitize(key))
}

/// Attribute holding the metadata value `key`.
#[must_use]
pub fn meta_attr(key: &str) -> String {
    format!("{META_PREFIX}{}", sanitize(key))
}

/// Attributes every rating resource type carries.
#[must_use]
pub fn base_attributes() -> BTreeSet<String> {
    [METRIC_TYPE_ATTR, UNIT_ATTR, SCOPE_ATTR]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Attributes a resource holding `point` needs.
#[must_use]
pub fn point_attributes(point: &DataPoint) -> BTreeSet<String> {
    let mut attributes = base_attributes();
    attributes.extend(point.groupby().keys().map(|k| groupby_attr(k)));
    attributes.extend(point.metadata().keys().map(|k| meta_attr(k)));
    attributes
}

/// Schema of one string attribute.
#[must_use]
pub fn attribute_schema() -> Value {
    json!({ "type": "string", "required": false, "options": { "fill": "" } })
}

/// `POST /v1/archive_policy` body.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivePolicy {
    /// Policy name.
    pub name: String,
    /// Retention definition.
    pub definition: Vec<ArchivePolicyRule>,
    /// Aggregation methods computed on write.
    pub aggregation_methods: Vec<String>,
}

/// One retention rule.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivePolicyRule {
    /// Granularity in seconds.
    pub granularity: u64,
    /// Retention span, e.g. `90 days`.
    pub timespan: String,
}

/// Resource type as listed by `GET /v1/resource_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceType {
    /// Type name.
    pub name: String,
    /// Declared attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl ResourceType {
    /// Whether the type declares every attribute in `required`.
    #[must_use]
    pub fn has_attributes<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|a| self.attributes.contains_key(a))
    }
}

/// A resource as returned by search and create.
#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    /// Resource id.
    pub id: String,
    /// Metric name to metric id.
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
    /// Every other field, including the typed attributes.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl Resource {
    /// String value of an attribute; absent, null and filled-empty values
    /// read as `None`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Metric type recorded on the resource.
    #[must_use]
    pub fn metric_type(&self) -> Option<&str> {
        self.attribute(METRIC_TYPE_ATTR)
    }

    /// Groupby values recorded on the resource.
    #[must_use]
    pub fn groupby(&self) -> Attributes {
        self.prefixed(GROUPBY_PREFIX)
    }

    /// Metadata values recorded on the resource.
    #[must_use]
    pub fn metadata(&self) -> Attributes {
        self.prefixed(META_PREFIX)
    }

    fn prefixed(&self, prefix: &str) -> Attributes {
        self.attributes
            .iter()
            .filter_map(|(name, value)| {
                let key = name.strip_prefix(prefix)?;
                let value = value.as_str().filter(|v| !v.is_empty())?;
                Some((key.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Build the point of one measure of this resource.
    #[must_use]
    pub fn point(&self, qty: Decimal, price: Decimal) -> DataPoint {
        DataPoint::new(
            self.attribute(UNIT_ATTR).unwrap_or_default(),
            qty,
            price,
            self.groupby(),
            self.metadata(),
        )
    }
}

/// Body of a resource creation.
#[must_use]
pub fn new_resource_body(
    id: &str,
    metric_type: &str,
    scope_id: &str,
    point: &DataPoint,
    archive_policy: &str,
) -> Value {
    let mut body = resource_attributes(metric_type, scope_id, point);
    body.insert("id".into(), json!(id));
    body.insert(
        "metrics".into(),
        json!({
            QTY_METRIC: { "archive_policy_name": archive_policy },
            COST_METRIC: { "archive_policy_name": archive_policy },
        }),
    );
    Value::Object(body)
}

/// Attribute values of the resource holding `point`.
#[must_use]
pub fn resource_attributes(
    metric_type: &str,
    scope_id: &str,
    point: &DataPoint,
) -> serde_json::Map<String, Value> {
    let mut attributes = serde_json::Map::new();
    attributes.insert(METRIC_TYPE_ATTR.into(), json!(metric_type));
    attributes.insert(UNIT_ATTR.into(), json!(point.unit()));
    attributes.insert(SCOPE_ATTR.into(), json!(scope_id));
    for (key, value) in point.groupby() {
        attributes.insert(groupby_attr(key), json!(value));
    }
    for (key, value) in point.metadata() {
        attributes.insert(meta_attr(key), json!(value));
    }
    attributes
}

/// One measure of the batch API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measure {
    /// Measure timestamp.
    pub timestamp: DateTime<Utc>,
    /// Measure value.
    pub value: f64,
}

impl Measure {
    /// Measure of `value` at `timestamp`.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, value: Decimal) -> Self {
        Self {
            timestamp,
            value: value.to_f64().unwrap_or_default(),
        }
    }
}

/// One aggregated sample: timestamp, granularity in seconds, value.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Sample(pub DateTime<Utc>, pub f64, pub f64);

impl Sample {
    /// Period covered by the sample.
    #[must_use]
    pub fn period(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        #[allow(clippy::cast_possible_truncation)]
        let granularity = Duration::seconds(self.1 as i64);
        (self.0, self.0 + granularity)
    }

    /// Sample value as a decimal.
    #[must_use]
    pub fn amount(&self) -> Decimal {
        Decimal::from_f64(self.2).unwrap_or_default()
    }
}

/// `(metric (qty sum) (cost sum))` answer with details:
/// resource id, then metric name, then aggregation method.
#[derive(Debug, Clone, Deserialize)]
pub struct DetailedMeasures {
    /// Samples per resource.
    #[serde(default)]
    pub measures: BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<Sample>>>>,
}

/// One group of a grouped aggregation.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupedMeasures {
    /// Attribute values of the group.
    pub group: BTreeMap<String, Value>,
    /// Aggregation result.
    pub measures: Value,
}

impl GroupedMeasures {
    /// String value of a group attribute; null reads as empty.
    #[must_use]
    pub fn group_value(&self, attribute: &str) -> String {
        match self.group.get(attribute) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Samples of the `aggregated` series.
    ///
    /// # Errors
    ///
    /// Returns a decoding error if the series is malformed.
    pub fn samples(&self) -> serde_json::Result<Vec<Sample>> {
        let series = self
            .measures
            .get("aggregated")
            .or_else(|| self.measures.pointer("/measures/aggregated"))
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(series)
    }
}
