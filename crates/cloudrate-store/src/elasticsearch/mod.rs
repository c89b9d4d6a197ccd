//! Document-search storage backend.
//!
//! One document per point in a single index. Rows are read through scroll
//! cursors, ungrouped totals through `sum` aggregations, and grouped totals
//! by walking a composite aggregation with `after_key`.

pub mod client;
pub mod query;
pub mod types;

pub use client::ElasticsearchClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudrate_core::{
    frames_from_rows, paginate, DataFrame, Filters, RetrieveQuery, RetrieveResult, TotalQuery, TotalResult,
    TotalRow,
};
use serde_json::Value;

use self::query::{build_attribute_filters, build_must, build_query};
use crate::config::ElasticsearchConfig;
use crate::error::Result;
use crate::record::PointRecord;
use crate::{warn_custom_fields, Storage};

/// Storage backend on an Elasticsearch or OpenSearch index.
#[derive(Debug)]
pub struct ElasticsearchStorage {
    client: ElasticsearchClient,
    config: ElasticsearchConfig,
}

impl ElasticsearchStorage {
    /// Create the backend.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        Ok(Self {
            client: ElasticsearchClient::new(&config)?,
            config,
        })
    }

    /// Documents waiting for a bulk request.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.client.buffered()
    }

    fn build_filter_query(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        filters: &Filters,
        metric_types: Option<&[String]>,
    ) -> Value {
        let scope_key = &self.config.scope_key;
        build_query(
            build_must(begin, end, filters, metric_types, scope_key),
            build_attribute_filters(filters, scope_key),
        )
    }

    async fn grouped_totals(&self, query: &TotalQuery, filter: &Value) -> Result<TotalResult> {
        let window = query.paginate.then_some((query.offset, query.limit));
        let mut seen = 0usize;
        let mut results = Vec::new();
        let mut after: Option<Value> = None;
        let mut pages = 0;

        loop {
            let page = self
                .client
                .composite_page(filter, &query.groupby, after.as_ref())
                .await?;
            pages += 1;
            if page.buckets.is_empty() {
                break;
            }
            for bucket in &page.buckets {
                let index = seen;
                seen += 1;
                let keep = window.map_or(true, |(offset, limit)| {
                    index >= offset && index - offset < limit
                });
                if keep {
                    results.push(TotalRow {
                        groupby: bucket.key_strings(),
                        qty: bucket.sum_qty.amount(),
                        rate: bucket.sum_price.amount(),
                        begin: query.begin,
                        end: query.end,
                    });
                }
            }

            match page.after_key {
                None => break,
                Some(_) if pages >= self.config.max_composite_pages => {
                    tracing::warn!(
                        pages,
                        groups = seen,
                        "Composite aggregation page limit reached, total is a lower bound"
                    );
                    break;
                }
                Some(next) => after = Some(next),
            }
        }

        Ok(TotalResult {
            total: seen as u64,
            results,
        })
    }
}

#[async_trait]
impl Storage for ElasticsearchStorage {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn init(&mut self) -> Result<()> {
        if self.client.index_exists().await? {
            self.client.put_mapping().await?;
        } else {
            self.client.create_index().await?;
        }
        self.client.commit().await
    }

    async fn push(&mut self, frames: &[DataFrame], scope_id: &str) -> Result<()> {
        for frame in frames {
            for (metric_type, point) in frame.iter_points() {
                let doc = PointRecord::from_point(metric_type, point, frame.start(), frame.end());
                self.client.add_document(doc);
            }
        }
        tracing::debug!(scope_id, buffered = self.client.buffered(), "Pushing frames");
        self.client.commit().await
    }

    async fn flush(&mut self) -> Result<()> {
        self.client.commit().await
    }

    async fn retrieve(&self, query: &RetrieveQuery) -> Result<RetrieveResult> {
        let metric_types = query.effective_metric_types();
        let filter = self.build_filter_query(query.begin, query.end, &query.filters, metric_types.as_deref());
        let (offset, limit) = if query.paginate {
            (query.offset, Some(query.limit))
        } else {
            (0, None)
        };
        let (total, docs) = self.client.retrieve(filter, offset, limit).await?;
        Ok(RetrieveResult {
            total,
            dataframes: frames_from_rows(docs.into_iter().map(PointRecord::into_row))?,
        })
    }

    async fn total(&self, query: &TotalQuery) -> Result<TotalResult> {
        warn_custom_fields(self.name(), query.custom_fields.as_deref());
        let metric_types = query.effective_metric_types();
        let filter = self.build_filter_query(query.begin, query.end, &query.filters, metric_types.as_deref());

        if !query.groupby.is_empty() {
            return self.grouped_totals(query, &filter).await;
        }

        let (qty, price) = self.client.sums(filter).await?;
        let row = TotalRow {
            groupby: BTreeMap::new(),
            qty: qty.amount(),
            rate: price.amount(),
            begin: query.begin,
            end: query.end,
        };
        Ok(TotalResult {
            total: 1,
            results: paginate(vec![row], query.offset, query.limit, query.paginate),
        })
    }

    async fn delete(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>, filters: &Filters) -> Result<()> {
        let filter = self.build_filter_query(begin, end, filters, None);
        let deleted = self.client.delete_by_query(filter).await?;
        tracing::info!(deleted, "Deleted documents");
        Ok(())
    }
}
