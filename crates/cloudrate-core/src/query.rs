//! Request and response values of the storage contract.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::dataframe::DataFrame;

/// Reserved groupby/filter name meaning "the metric type".
pub const TYPE_FIELD: &str = "type";

/// Default page size for `retrieve` and `total`.
pub const DEFAULT_LIMIT: usize = 1000;

/// Exact-match filters, attribute name to value.
pub type Filters = BTreeMap<String, String>;

/// Row-level retrieval request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveQuery {
    /// Inclusive range start.
    pub begin: DateTime<Utc>,
    /// Range end.
    pub end: DateTime<Utc>,
    /// Exact-match filters.
    pub filters: Filters,
    /// Restrict to these metric types (`None` means all).
    pub metric_types: Option<Vec<String>>,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows returned.
    pub limit: usize,
    /// When false, `offset`/`limit` are ignored and every match is returned.
    pub paginate: bool,
}

impl RetrieveQuery {
    /// Query every row in `[begin, end)` with default pagination.
    #[must_use]
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            begin,
            end,
            filters: Filters::new(),
            metric_types: None,
            offset: 0,
            limit: DEFAULT_LIMIT,
            paginate: true,
        }
    }

    /// Add an exact-match filter.
    #[must_use]
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Restrict to the given metric types.
    #[must_use]
    pub fn with_metric_types<I, S>(mut self, metric_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metric_types = Some(metric_types.into_iter().map(Into::into).collect());
        self
    }

    /// Set the page window.
    #[must_use]
    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self.paginate = true;
        self
    }

    /// Return every match regardless of `offset`/`limit`.
    #[must_use]
    pub fn without_pagination(mut self) -> Self {
        self.paginate = false;
        self
    }

    /// Metric types selected by both `metric_types` and a `type` filter.
    ///
    /// `None` means no restriction; an empty list means nothing can match.
    #[must_use]
    pub fn effective_metric_types(&self) -> Option<Vec<String>> {
        effective_metric_types(self.metric_types.as_deref(), &self.filters)
    }
}

/// Aggregation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalQuery {
    /// Fields to group by; may include [`TYPE_FIELD`].
    pub groupby: Vec<String>,
    /// Inclusive range start.
    pub begin: DateTime<Utc>,
    /// Range end.
    pub end: DateTime<Utc>,
    /// Restrict to these metric types (`None` means all).
    pub metric_types: Option<Vec<String>>,
    /// Exact-match filters.
    pub filters: Filters,
    /// Extra fields to compute. No backend supports them; they are ignored
    /// with a warning.
    pub custom_fields: Option<Vec<String>>,
    /// Result rows to skip.
    pub offset: usize,
    /// Maximum result rows.
    pub limit: usize,
    /// When false, `offset`/`limit` are ignored.
    pub paginate: bool,
}

impl TotalQuery {
    /// Sum everything in `[begin, end)` into a single row.
    #[must_use]
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            groupby: Vec::new(),
            begin,
            end,
            metric_types: None,
            filters: Filters::new(),
            custom_fields: None,
            offset: 0,
            limit: DEFAULT_LIMIT,
            paginate: true,
        }
    }

    /// Group by the given fields.
    #[must_use]
    pub fn with_groupby<I, S>(mut self, groupby: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groupby = groupby.into_iter().map(Into::into).collect();
        self
    }

    /// Add an exact-match filter.
    #[must_use]
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Restrict to the given metric types.
    #[must_use]
    pub fn with_metric_types<I, S>(mut self, metric_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metric_types = Some(metric_types.into_iter().map(Into::into).collect());
        self
    }

    /// Set the page window.
    #[must_use]
    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self.paginate = true;
        self
    }

    /// Return every group regardless of `offset`/`limit`.
    #[must_use]
    pub fn without_pagination(mut self) -> Self {
        self.paginate = false;
        self
    }

    /// Whether the caller asked to group by metric type.
    #[must_use]
    pub fn groups_by_type(&self) -> bool {
        self.groupby.iter().any(|field| field == TYPE_FIELD)
    }

    /// Metric types selected by both `metric_types` and a `type` filter.
    #[must_use]
    pub fn effective_metric_types(&self) -> Option<Vec<String>> {
        effective_metric_types(self.metric_types.as_deref(), &self.filters)
    }

    /// The row-level query matching the same rows, without pagination.
    #[must_use]
    pub fn to_retrieve(&self) -> RetrieveQuery {
        RetrieveQuery {
            begin: self.begin,
            end: self.end,
            filters: self.filters.clone(),
            metric_types: self.metric_types.clone(),
            offset: 0,
            limit: self.limit,
            paginate: false,
        }
    }
}

fn effective_metric_types(metric_types: Option<&[String]>, filters: &Filters) -> Option<Vec<String>> {
    match (metric_types, filters.get(TYPE_FIELD)) {
        (None, None) => None,
        (Some(types), None) => Some(types.to_vec()),
        (None, Some(filtered)) => Some(vec![filtered.clone()]),
        (Some(types), Some(filtered)) => Some(
            types
                .iter()
                .filter(|t| *t == filtered)
                .cloned()
                .collect(),
        ),
    }
}

/// Result of a row-level retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetrieveResult {
    /// Number of matching rows (capped for some backends).
    pub total: u64,
    /// Rows of the requested page, rebuilt into frames.
    pub dataframes: Vec<DataFrame>,
}

/// Result of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TotalResult {
    /// Number of groups.
    pub total: u64,
    /// Groups of the requested page.
    pub results: Vec<TotalRow>,
}

/// One aggregated group.
///
/// Serializes with the groupby values flattened next to `qty`, `rate`,
/// `begin` and `end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalRow {
    /// Values of the requested groupby fields.
    pub groupby: BTreeMap<String, String>,
    /// Summed quantity.
    pub qty: Decimal,
    /// Summed price.
    pub rate: Decimal,
    /// Range start.
    pub begin: DateTime<Utc>,
    /// Range end.
    pub end: DateTime<Utc>,
}

impl Serialize for TotalRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groupby.len() + 4))?;
        for (key, value) in &self.groupby {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("qty", &self.qty)?;
        map.serialize_entry("rate", &self.rate)?;
        map.serialize_entry("begin", &self.begin)?;
        map.serialize_entry("end", &self.end)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn retrieve_defaults() {
        let (begin, end) = range();
        let query = RetrieveQuery::new(begin, end);
        assert_eq!(query.offset, 0);
        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert!(query.paginate);
        assert!(query.effective_metric_types().is_none());
    }

    #[test]
    fn type_filter_narrows_metric_types() {
        let (begin, end) = range();
        let query = RetrieveQuery::new(begin, end)
            .with_metric_types(["compute", "image"])
            .with_filter(TYPE_FIELD, "image");
        assert_eq!(query.effective_metric_types(), Some(vec!["image".to_string()]));

        let disjoint = query.with_filter(TYPE_FIELD, "network");
        assert_eq!(disjoint.effective_metric_types(), Some(vec![]));
    }

    #[test]
    fn total_row_serializes_flat() {
        let (begin, end) = range();
        let row = TotalRow {
            groupby: [("project_id".to_string(), "p1".to_string())].into(),
            qty: Decimal::new(18, 0),
            rate: Decimal::new(180, 0),
            begin,
            end,
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["project_id"], "p1");
        assert_eq!(value["qty"], "18");
        assert_eq!(value["rate"], "180");
        assert_eq!(value["begin"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn total_to_retrieve_disables_pagination() {
        let (begin, end) = range();
        let query = TotalQuery::new(begin, end)
            .with_groupby([TYPE_FIELD])
            .with_filter("project_id", "p1")
            .with_page(10, 5);
        assert!(query.groups_by_type());
        let retrieve = query.to_retrieve();
        assert!(!retrieve.paginate);
        assert_eq!(retrieve.filters.get("project_id").map(String::as_str), Some("p1"));
    }
}
