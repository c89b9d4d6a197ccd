//! Normalized storage rows and the client-side operations built on them.
//!
//! Every backend reduces its native records to [`UsageRow`]s. Frames are
//! rebuilt from rows for `retrieve`, and backends without native grouping
//! aggregate rows here for `total`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::dataframe::{DataFrame, DataPoint};
use crate::error::Result;
use crate::query::{Filters, TotalRow, TYPE_FIELD};

/// One stored point with its metric type and period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    /// Period start of the frame the point was pushed with.
    pub start: DateTime<Utc>,
    /// Period end of the frame the point was pushed with.
    pub end: DateTime<Utc>,
    /// Metric type.
    pub metric_type: String,
    /// The stored point.
    pub point: DataPoint,
}

impl UsageRow {
    /// Value of a groupby field; [`TYPE_FIELD`] resolves to the metric type.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == TYPE_FIELD {
            Some(&self.metric_type)
        } else {
            self.point.groupby().get(name).map(String::as_str)
        }
    }

    /// Whether the row satisfies every filter.
    ///
    /// A filter matches either the groupby or the metadata value, except the
    /// scope key which only matches groupby.
    #[must_use]
    pub fn matches(&self, filters: &Filters, scope_key: &str) -> bool {
        filters.iter().all(|(key, value)| {
            if key == TYPE_FIELD {
                return &self.metric_type == value;
            }
            let in_groupby = self.point.groupby().get(key) == Some(value);
            if key == scope_key {
                in_groupby
            } else {
                in_groupby || self.point.metadata().get(key) == Some(value)
            }
        })
    }
}

/// Rebuild frames from rows, grouping by `(start, end)`.
///
/// Frames come back sorted by period; points keep row order.
///
/// # Errors
///
/// Returns `ModelError::InvalidPeriod` if a row carries an empty period.
pub fn frames_from_rows(rows: impl IntoIterator<Item = UsageRow>) -> Result<Vec<DataFrame>> {
    let mut frames: BTreeMap<(DateTime<Utc>, DateTime<Utc>), DataFrame> = BTreeMap::new();
    for row in rows {
        let key = (row.start, row.end);
        let frame = match frames.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(DataFrame::new(row.start, row.end)?)
            }
        };
        frame.add_point(row.point, &row.metric_type);
    }
    Ok(frames.into_values().collect())
}

/// Sum rows per groupby tuple.
///
/// Missing groupby values count as the empty string. An empty `groupby`
/// yields exactly one row, even when there is no data.
#[must_use]
pub fn aggregate_rows(
    rows: &[UsageRow],
    groupby: &[String],
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<TotalRow> {
    let mut groups: BTreeMap<Vec<String>, (Decimal, Decimal)> = BTreeMap::new();
    if groupby.is_empty() {
        groups.insert(Vec::new(), (Decimal::ZERO, Decimal::ZERO));
    }
    for row in rows {
        let key = groupby
            .iter()
            .map(|field| row.field(field).unwrap_or_default().to_string())
            .collect();
        let sums = groups.entry(key).or_insert((Decimal::ZERO, Decimal::ZERO));
        sums.0 += row.point.qty();
        sums.1 += row.point.price();
    }
    groups
        .into_iter()
        .map(|(key, (qty, rate))| TotalRow {
            groupby: groupby.iter().cloned().zip(key).collect(),
            qty,
            rate,
            begin,
            end,
        })
        .collect()
}

/// Merge per-metric-type aggregation results.
///
/// Rows sharing the same values for every `groupby` field are summed. This is
/// how grouped totals are produced when a backend can only aggregate one
/// metric type per request and the caller did not group by type.
#[must_use]
pub fn merge_type_totals(per_type: Vec<Vec<TotalRow>>, groupby: &[String]) -> Vec<TotalRow> {
    let mut merged: BTreeMap<Vec<String>, TotalRow> = BTreeMap::new();
    for row in per_type.into_iter().flatten() {
        let key: Vec<String> = groupby
            .iter()
            .map(|field| row.groupby.get(field).cloned().unwrap_or_default())
            .collect();
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.qty += row.qty;
                existing.rate += row.rate;
            }
            None => {
                let groupby_values = groupby.iter().cloned().zip(key.iter().cloned()).collect();
                merged.insert(
                    key,
                    TotalRow {
                        groupby: groupby_values,
                        ..row
                    },
                );
            }
        }
    }
    merged.into_values().collect()
}

/// Apply an `offset`/`limit` window unless pagination is disabled.
#[must_use]
pub fn paginate<T>(items: Vec<T>, offset: usize, limit: usize, paginate: bool) -> Vec<T> {
    if !paginate {
        return items;
    }
    items.into_iter().skip(offset).take(limit).collect()
}
