//! In-memory storage backend.
//!
//! Keeps rows in a vector and answers queries with the same client-side
//! helpers the remote backends use. Selected as `memory` in the registry;
//! mostly useful for tests of code sitting above the storage layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudrate_core::{
    aggregate_rows, frames_from_rows, paginate, DataFrame, Filters, RetrieveQuery, RetrieveResult,
    TotalQuery, TotalResult, UsageRow,
};

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::{warn_custom_fields, Storage};

/// Process-local storage backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    config: MemoryConfig,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    scope_id: String,
    row: UsageRow,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            rows: Vec::new(),
        }
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows pushed under `scope_id`.
    pub fn scope_rows<'a>(&'a self, scope_id: &'a str) -> impl Iterator<Item = &'a UsageRow> {
        self.rows
            .iter()
            .filter(move |stored| stored.scope_id == scope_id)
            .map(|stored| &stored.row)
    }

    fn matching(&self, query: &RetrieveQuery) -> Vec<UsageRow> {
        let metric_types = query.effective_metric_types();
        self.rows
            .iter()
            .map(|stored| &stored.row)
            .filter(|row| in_range(row, query.begin, query.end))
            .filter(|row| {
                metric_types
                    .as_ref()
                    .map_or(true, |types| types.contains(&row.metric_type))
            })
            .filter(|row| row.matches(&query.filters, &self.config.scope_key))
            .cloned()
            .collect()
    }
}

fn in_range(row: &UsageRow, begin: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    row.start >= begin && row.end <= end
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn push(&mut self, frames: &[DataFrame], scope_id: &str) -> Result<()> {
        for frame in frames {
            for (metric_type, point) in frame.iter_points() {
                self.rows.push(StoredRow {
                    scope_id: scope_id.to_string(),
                    row: UsageRow {
                        start: frame.start(),
                        end: frame.end(),
                        metric_type: metric_type.to_string(),
                        point: point.clone(),
                    },
                });
            }
        }
        tracing::debug!(scope_id, rows = self.rows.len(), "Stored frames in memory");
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn retrieve(&self, query: &RetrieveQuery) -> Result<RetrieveResult> {
        let rows = self.matching(query);
        let total = rows.len() as u64;
        let page = paginate(rows, query.offset, query.limit, query.paginate);
        Ok(RetrieveResult {
            total,
            dataframes: frames_from_rows(page)?,
        })
    }

    async fn total(&self, query: &TotalQuery) -> Result<TotalResult> {
        warn_custom_fields(self.name(), query.custom_fields.as_deref());
        let rows = self.matching(&query.to_retrieve());
        let groups = aggregate_rows(&rows, &query.groupby, query.begin, query.end);
        Ok(TotalResult {
            total: groups.len() as u64,
            results: paginate(groups, query.offset, query.limit, query.paginate),
        })
    }

    async fn delete(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>, filters: &Filters) -> Result<()> {
        let scope_key = self.config.scope_key.clone();
        let before = self.rows.len();
        self.rows.retain(|stored| {
            !(in_range(&stored.row, begin, end) && stored.row.matches(filters, &scope_key))
        });
        tracing::debug!(deleted = before - self.rows.len(), "Deleted rows from memory");
        Ok(())
    }
}
