//! Flat JSON record of a stored point, shared by the document and log
//! backends.

use chrono::{DateTime, Utc};
use cloudrate_core::{Attributes, DataPoint, Decimal, UsageRow};
use serde::{Deserialize, Serialize};

/// One stored point with its period and metric type.
///
/// Serialized as an Elasticsearch document or a Loki log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointRecord {
    /// Frame start.
    pub start: DateTime<Utc>,
    /// Frame end.
    pub end: DateTime<Utc>,
    /// Metric type.
    #[serde(rename = "type")]
    pub metric_type: String,
    /// Display unit.
    pub unit: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Quantity.
    pub qty: Decimal,
    /// Price.
    pub price: Decimal,
    /// Groupby attributes.
    #[serde(default)]
    pub groupby: Attributes,
    /// Metadata attributes.
    #[serde(default)]
    pub metadata: Attributes,
}

impl PointRecord {
    /// Record of a point pushed in the frame `[start, end)`.
    #[must_use]
    pub fn from_point(metric_type: &str, point: &DataPoint, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            metric_type: metric_type.to_string(),
            unit: point.unit().to_string(),
            description: point.description().map(String::from),
            qty: point.qty(),
            price: point.price(),
            groupby: point.groupby().clone(),
            metadata: point.metadata().clone(),
        }
    }

    /// Convert back into a storage row.
    #[must_use]
    pub fn into_row(self) -> UsageRow {
        let mut point = DataPoint::new(self.unit, self.qty, self.price, self.groupby, self.metadata);
        if let Some(description) = self.description {
            point = point.with_description(description);
        }
        UsageRow {
            start: self.start,
            end: self.end,
            metric_type: self.metric_type,
            point,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_row() {
        let start = "2024-01-01T00:00:00Z".parse().unwrap();
        let end = "2024-01-01T01:00:00Z".parse().unwrap();
        let point = DataPoint::new(
            "h",
            Decimal::new(15, 1),
            Decimal::new(3, 0),
            [("project_id".to_string(), "p1".to_string())].into(),
            Attributes::new(),
        )
        .with_description("vm");
        let record = PointRecord::from_point("compute", &point, start, end);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "compute");
        assert_eq!(value["groupby"]["project_id"], "p1");

        let decoded: PointRecord = serde_json::from_value(value).unwrap();
        let row = decoded.into_row();
        assert_eq!(row.point, point);
        assert_eq!(row.metric_type, "compute");
        assert_eq!((row.start, row.end), (start, end));
    }

    #[test]
    fn missing_attribute_maps_default_to_empty() {
        let record: PointRecord = serde_json::from_str(
            r#"{"start":"2024-01-01T00:00:00Z","end":"2024-01-01T01:00:00Z","type":"image","unit":"GiB","qty":"1","price":"0.5"}"#,
        )
        .unwrap();
        assert!(record.groupby.is_empty());
        assert!(record.description.is_none());
        assert_eq!(record.price, Decimal::new(5, 1));
    }
}
