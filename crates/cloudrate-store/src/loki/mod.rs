//! Log-stream storage backend.
//!
//! Every point is one JSON log line, stamped with its frame end, in a stream
//! labelled with the static labels and the scope. Loki cannot aggregate
//! these lines, so `total` fetches rows and sums them here.

pub mod client;
pub mod query;
pub mod types;

pub use client::LokiClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cloudrate_core::{
    aggregate_rows, frames_from_rows, paginate, DataFrame, Filters, RetrieveQuery, RetrieveResult,
    TotalQuery, TotalResult, UsageRow,
};

use self::client::to_nanos;
use self::query::{build_delete_query, build_query, stream_labels};
use self::types::{PushRequest, PushStream};
use crate::config::LokiConfig;
use crate::error::{Result, StoreError};
use crate::record::PointRecord;
use crate::{warn_custom_fields, Storage};

const BACKEND: &str = "loki";

/// Storage backend on a Loki tenant.
#[derive(Debug)]
pub struct LokiStorage {
    client: LokiClient,
    config: LokiConfig,
    /// Buffered `[timestamp, line]` pairs per scope.
    buffer: BTreeMap<String, Vec<[String; 2]>>,
}

impl LokiStorage {
    /// Create the backend.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnsupportedContentType` for any content type
    /// other than `application/json`, or a configuration error if the HTTP
    /// client cannot be built.
    pub fn new(config: LokiConfig) -> Result<Self> {
        Ok(Self {
            client: LokiClient::new(&config)?,
            config,
            buffer: BTreeMap::new(),
        })
    }

    /// Number of buffered lines across scopes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.values().map(Vec::len).sum()
    }

    async fn send_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let request = PushRequest {
            streams: self
                .buffer
                .iter()
                .map(|(scope_id, values)| PushStream {
                    stream: stream_labels(&self.config.stream_labels, &self.config.scope_key, scope_id),
                    values: values.clone(),
                })
                .collect(),
        };
        let lines = self.buffered();
        if let Err(err) = self.client.push(&request).await {
            tracing::error!(lines, error = %err, "Failed to push lines, keeping them buffered");
            return Err(err);
        }
        self.buffer.clear();
        tracing::debug!(lines, streams = request.streams.len(), "Pushed lines");
        Ok(())
    }

    /// Split `[begin, end]` into consecutive ranges of at most `shard_days`.
    fn shards(&self, begin: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let width = Duration::days(i64::from(self.config.shard_days.max(1)));
        let mut shards = Vec::new();
        let mut start = begin;
        while start < end {
            let stop = (start + width).min(end);
            shards.push((start, stop));
            start = stop;
        }
        shards
    }

    /// Every `(timestamp, line)` in `[start, stop)`, paging past the query limit.
    ///
    /// A full page may cut a timestamp short, so the next page restarts at the
    /// newest timestamp seen and lines at that timestamp are only kept from
    /// the page that holds all of them.
    async fn fetch_shard(&self, logql: &str, start: i64, stop: i64) -> Result<Vec<(i64, String)>> {
        let limit = self.client.query_limit();
        let mut from = start;
        let mut lines = Vec::new();
        loop {
            let mut page = Vec::new();
            for stream in self.client.query_range(logql, from, stop).await? {
                for (timestamp, line) in stream.values {
                    let timestamp = timestamp.parse::<i64>().map_err(|err| {
                        StoreError::unexpected(BACKEND, format!("bad line timestamp {timestamp}: {err}"))
                    })?;
                    page.push((timestamp, line));
                }
            }
            if page.len() < limit {
                lines.extend(page);
                return Ok(lines);
            }

            let newest = page.iter().map(|(timestamp, _)| *timestamp).max().unwrap_or(from);
            if newest <= from {
                return Err(StoreError::QueryLimitExceeded { limit, timestamp: from });
            }
            lines.extend(page.into_iter().filter(|(timestamp, _)| *timestamp < newest));
            tracing::debug!(from, next = newest, limit, "Query limit reached, fetching next page");
            from = newest;
        }
    }

    /// Fetch and normalize every row matching `query`, oldest first.
    async fn fetch_rows(&self, query: &RetrieveQuery) -> Result<Vec<UsageRow>> {
        let metric_types = query.effective_metric_types();
        let logql = build_query(
            &self.config.stream_labels,
            &self.config.scope_key,
            &query.filters,
            metric_types.as_deref(),
        );

        let shards = self.shards(query.begin, query.end);
        let last = shards.len().saturating_sub(1);
        let mut rows = Vec::new();
        for (index, (start, stop)) in shards.into_iter().enumerate() {
            // Lines are stamped with the frame end; the last shard includes it.
            let stop = to_nanos(stop)? + i64::from(index == last);
            let mut lines = self.fetch_shard(&logql, to_nanos(start)?, stop).await?;
            // Streams come back one after the other; restore global time order.
            lines.sort_by_key(|(timestamp, _)| *timestamp);

            for (timestamp, line) in lines {
                match serde_json::from_str::<PointRecord>(&line) {
                    Ok(record) => {
                        let row = record.into_row();
                        if row.start >= query.begin && row.end <= query.end {
                            rows.push(row);
                        }
                    }
                    Err(err) => tracing::warn!(timestamp, error = %err, "Skipping unparsable line"),
                }
            }
        }
        tracing::debug!(query = %logql, rows = rows.len(), "Loki query");
        Ok(rows)
    }
}

#[async_trait]
impl Storage for LokiStorage {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn push(&mut self, frames: &[DataFrame], scope_id: &str) -> Result<()> {
        for frame in frames {
            let timestamp = to_nanos(frame.end())?.to_string();
            for (metric_type, point) in frame.iter_points() {
                let record = PointRecord::from_point(metric_type, point, frame.start(), frame.end());
                let line = serde_json::to_string(&record)?;
                self.buffer
                    .entry(scope_id.to_string())
                    .or_default()
                    .push([timestamp.clone(), line]);
            }
        }
        // Buffer the whole call first so a failed send keeps every line.
        if self.buffered() >= self.config.buffer_size {
            self.send_buffer().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.send_buffer().await
    }

    async fn retrieve(&self, query: &RetrieveQuery) -> Result<RetrieveResult> {
        let rows = self.fetch_rows(query).await?;
        let total = rows.len() as u64;
        let page = paginate(rows, query.offset, query.limit, query.paginate);
        Ok(RetrieveResult {
            total,
            dataframes: frames_from_rows(page)?,
        })
    }

    async fn total(&self, query: &TotalQuery) -> Result<TotalResult> {
        warn_custom_fields(self.name(), query.custom_fields.as_deref());
        let rows = self.fetch_rows(&query.to_retrieve()).await?;
        let groups = aggregate_rows(&rows, &query.groupby, query.begin, query.end);
        Ok(TotalResult {
            total: groups.len() as u64,
            results: paginate(groups, query.offset, query.limit, query.paginate),
        })
    }

    async fn delete(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>, filters: &Filters) -> Result<()> {
        let selector = build_delete_query(&self.config.stream_labels, &self.config.scope_key, filters);
        self.client.delete(&selector, begin, end).await?;
        tracing::info!(query = %selector, %begin, %end, "Requested line deletion");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn long_ranges_are_sharded() {
        let storage = LokiStorage::new(LokiConfig {
            shard_days: 7,
            ..LokiConfig::default()
        })
        .unwrap();
        let begin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap();

        let shards = storage.shards(begin, end);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].0, begin);
        assert_eq!(shards[1].0, shards[0].1);
        assert_eq!(shards[2].1, end);
        assert_eq!((shards[2].1 - shards[2].0).num_days(), 5);
    }

    #[test]
    fn short_range_is_one_shard() {
        let storage = LokiStorage::new(LokiConfig::default()).unwrap();
        let begin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(storage.shards(begin, end), vec![(begin, end)]);
    }
}
