//! Rated usage samples and the billing-period frames that carry them.
//!
//! A [`DataPoint`] is one priced usage sample produced by the rating engine.
//! A [`DataFrame`] collects the points of one billing period, keyed by metric
//! type. Both are handed to the storage layer once and never modified there.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ModelError, Result};

/// Unit reported when a sample does not carry one.
pub const UNDEFINED_UNIT: &str = "undefined";

/// Attribute map used for `groupby` and `metadata`.
///
/// Keys are unique and ordered, so two maps built in a different insertion
/// order compare equal.
pub type Attributes = BTreeMap<String, String>;

/// One priced usage sample.
///
/// Every field is fixed at construction except the price, which can only be
/// replaced through [`DataPoint::with_price`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "StandardPoint", from = "StandardPoint")]
pub struct DataPoint {
    unit: String,
    qty: Decimal,
    price: Decimal,
    groupby: Attributes,
    metadata: Attributes,
    description: Option<String>,
}

impl DataPoint {
    /// Create a new point.
    #[must_use]
    pub fn new(
        unit: impl Into<String>,
        qty: Decimal,
        price: Decimal,
        groupby: Attributes,
        metadata: Attributes,
    ) -> Self {
        let unit = unit.into();
        Self {
            unit: if unit.is_empty() {
                UNDEFINED_UNIT.to_string()
            } else {
                unit
            },
            qty,
            price,
            groupby,
            metadata,
            description: None,
        }
    }

    /// Attach a free-form description while building the point.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Return a copy of this point carrying `price`.
    #[must_use]
    pub fn with_price(&self, price: Decimal) -> Self {
        Self {
            price,
            ..self.clone()
        }
    }

    /// Display unit.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Consumed quantity.
    #[must_use]
    pub fn qty(&self) -> Decimal {
        self.qty
    }

    /// Rated price.
    #[must_use]
    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Dimension values used for grouping and identity.
    #[must_use]
    pub fn groupby(&self) -> &Attributes {
        &self.groupby
    }

    /// Descriptive attributes.
    #[must_use]
    pub fn metadata(&self) -> &Attributes {
        &self.metadata
    }

    /// Optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Look up an attribute in `groupby` first, then in `metadata`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.groupby
            .get(key)
            .or_else(|| self.metadata.get(key))
            .map(String::as_str)
    }

    /// Serialize to the standard shape:
    /// `{vol: {unit, qty}, rating: {price}, groupby, metadata}`.
    #[must_use]
    pub fn to_dict(&self) -> Value {
        let mut output = json!({
            "vol": { "unit": self.unit, "qty": self.qty },
            "rating": { "price": self.price },
            "groupby": self.groupby,
            "metadata": self.metadata,
        });
        if let (Some(description), Some(map)) = (&self.description, output.as_object_mut()) {
            map.insert("description".into(), Value::String(description.clone()));
        }
        output
    }

    /// Serialize to the legacy shape `{vol, rating, desc}`.
    ///
    /// `desc` merges `groupby` and `metadata` (metadata wins on collisions), so
    /// this shape cannot be decoded back into an equal point.
    #[must_use]
    pub fn to_legacy_dict(&self) -> Value {
        let mut desc = self.groupby.clone();
        desc.extend(self.metadata.clone());
        json!({
            "vol": { "unit": self.unit, "qty": self.qty },
            "rating": { "price": self.price },
            "desc": desc,
        })
    }

    /// Decode a point from the standard shape.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidDocument` if the value does not match the
    /// standard shape.
    pub fn from_dict(value: &Value) -> Result<Self> {
        StandardPoint::deserialize(value)
            .map(Self::from)
            .map_err(|e| ModelError::document("datapoint", e))
    }
}

impl Default for DataPoint {
    fn default() -> Self {
        Self::new(
            UNDEFINED_UNIT,
            Decimal::ZERO,
            Decimal::ZERO,
            Attributes::new(),
            Attributes::new(),
        )
    }
}

fn undefined_unit() -> String {
    UNDEFINED_UNIT.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
struct Volume {
    #[serde(default = "undefined_unit")]
    unit: String,
    #[serde(default)]
    qty: Decimal,
}

#[derive(Clone, Serialize, Deserialize)]
struct Rating {
    #[serde(default)]
    price: Decimal,
}

#[derive(Clone, Serialize, Deserialize)]
struct StandardPoint {
    vol: Volume,
    #[serde(default = "zero_rating")]
    rating: Rating,
    #[serde(default)]
    groupby: Attributes,
    #[serde(default)]
    metadata: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn zero_rating() -> Rating {
    Rating {
        price: Decimal::ZERO,
    }
}

impl From<DataPoint> for StandardPoint {
    fn from(point: DataPoint) -> Self {
        Self {
            vol: Volume {
                unit: point.unit,
                qty: point.qty,
            },
            rating: Rating { price: point.price },
            groupby: point.groupby,
            metadata: point.metadata,
            description: point.description,
        }
    }
}

impl From<StandardPoint> for DataPoint {
    fn from(point: StandardPoint) -> Self {
        let mut output = Self::new(
            point.vol.unit,
            point.vol.qty,
            point.rating.price,
            point.groupby,
            point.metadata,
        );
        output.description = point.description;
        output
    }
}

/// One billing period's worth of rated usage, keyed by metric type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    usage: BTreeMap<String, Vec<DataPoint>>,
}

impl DataFrame {
    /// Create an empty frame covering `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidPeriod` unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(ModelError::InvalidPeriod { start, end });
        }
        Ok(Self {
            start,
            end,
            usage: BTreeMap::new(),
        })
    }

    /// Period start.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Period end.
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Append a point under `metric_type`.
    pub fn add_point(&mut self, point: DataPoint, metric_type: &str) {
        self.usage
            .entry(metric_type.to_string())
            .or_default()
            .push(point);
    }

    /// Append several points under `metric_type`, keeping their order.
    pub fn add_points(&mut self, points: impl IntoIterator<Item = DataPoint>, metric_type: &str) {
        self.usage
            .entry(metric_type.to_string())
            .or_default()
            .extend(points);
    }

    /// Iterate `(metric_type, point)` pairs.
    ///
    /// Types come in name order, points in insertion order.
    pub fn iter_points(&self) -> impl Iterator<Item = (&str, &DataPoint)> {
        self.usage.iter().flat_map(|(metric_type, points)| {
            points.iter().map(move |point| (metric_type.as_str(), point))
        })
    }

    /// Metric types present in this frame.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.usage.keys().map(String::as_str)
    }

    /// Points recorded under `metric_type`.
    #[must_use]
    pub fn points(&self, metric_type: &str) -> &[DataPoint] {
        self.usage.get(metric_type).map_or(&[], Vec::as_slice)
    }

    /// Total number of points across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.usage.values().map(Vec::len).sum()
    }

    /// Whether the frame holds no point.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize to `{period: {begin, end}, usage: {type: [point, ...]}}`.
    ///
    /// With `legacy` set, points use the write-only legacy shape.
    #[must_use]
    pub fn to_dict(&self, legacy: bool) -> Value {
        let usage: serde_json::Map<String, Value> = self
            .usage
            .iter()
            .map(|(metric_type, points)| {
                let points = points
                    .iter()
                    .map(|p| if legacy { p.to_legacy_dict() } else { p.to_dict() })
                    .collect();
                (metric_type.clone(), Value::Array(points))
            })
            .collect();
        json!({
            "period": { "begin": self.start, "end": self.end },
            "usage": usage,
        })
    }

    /// Decode a frame whose points use the standard shape.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidDocument` on a malformed value and
    /// `ModelError::InvalidPeriod` on an empty or inverted period.
    pub fn from_dict(value: &Value) -> Result<Self> {
        #[derive(Deserialize)]
        struct Period {
            begin: DateTime<Utc>,
            end: DateTime<Utc>,
        }
        #[derive(Deserialize)]
        struct Frame {
            period: Period,
            #[serde(default)]
            usage: BTreeMap<String, Vec<DataPoint>>,
        }

        let frame = Frame::deserialize(value).map_err(|e| ModelError::document("dataframe", e))?;
        let mut output = Self::new(frame.period.begin, frame.period.end)?;
        for (metric_type, points) in frame.usage {
            output.add_points(points, &metric_type);
        }
        Ok(output)
    }
}
