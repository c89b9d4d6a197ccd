//! Elasticsearch HTTP client.

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::query::{build_composite, sum_aggregations, COMPOSITE_NAME};
use super::types::{
    index_mapping, Bucket, BulkResponse, ClearScrollResponse, SearchResponse, SumValue,
};
use crate::config::ElasticsearchConfig;
use crate::error::{Result, StoreError};
use crate::http::{base_url, build_client, check_status, json_body};
use crate::record::PointRecord;

const BACKEND: &str = "elasticsearch";

/// One page of a composite aggregation walk.
#[derive(Debug)]
pub struct CompositePage {
    /// Buckets of the page.
    pub buckets: Vec<Bucket>,
    /// Cursor of the next page, `None` on the last one.
    pub after_key: Option<Value>,
}

/// Client for one rating index.
///
/// Documents are buffered and sent through `_bulk` once `chunk_size` of
/// them are queued or on [`ElasticsearchClient::commit`].
#[derive(Debug)]
pub struct ElasticsearchClient {
    client: Client,
    base_url: String,
    index_name: String,
    chunk_size: usize,
    scroll_duration: u64,
    docs: Vec<PointRecord>,
}

impl ElasticsearchClient {
    /// Create a client for the configured cluster and index.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Configuration` if the URL is empty or the TLS
    /// material cannot be loaded.
    pub fn new(config: &ElasticsearchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(&config.tls, config.timeout_seconds)?,
            base_url: base_url(&config.url)?,
            index_name: config.index_name.clone(),
            chunk_size: config.chunk_size.max(1),
            scroll_duration: config.scroll_duration,
            docs: Vec::new(),
        })
    }

    fn index_url(&self, suffix: &str) -> String {
        format!("{}/{}{}", self.base_url, self.index_name, suffix)
    }

    /// Number of buffered documents.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.docs.len()
    }

    /// Whether the index exists.
    ///
    /// # Errors
    ///
    /// Returns an error on any answer other than 200 or 404.
    pub async fn index_exists(&self) -> Result<bool> {
        let url = self.index_url("");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, 200, &url).await?;
        Ok(true)
    }

    /// Create the index with the rating mapping.
    ///
    /// An index created concurrently by another process is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the creation.
    pub async fn create_index(&self) -> Result<()> {
        let url = self.index_url("");
        let body = json!({ "mappings": index_mapping() });
        let response = self.client.put(&url).json(&body).send().await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            if text.contains("resource_already_exists_exception") {
                tracing::debug!(index = %self.index_name, "Index already exists");
                return Ok(());
            }
            return Err(StoreError::InvalidStatusCode {
                expected: 200,
                actual: 400,
                body: text,
                query: body.to_string(),
            });
        }
        check_status(response, 200, &body.to_string()).await?;
        tracing::info!(index = %self.index_name, "Created index");
        Ok(())
    }

    /// Apply the rating mapping to an existing index.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the mapping.
    pub async fn put_mapping(&self) -> Result<()> {
        let url = self.index_url("/_mapping");
        let body = index_mapping();
        let response = self.client.put(&url).json(&body).send().await?;
        check_status(response, 200, &body.to_string()).await?;
        tracing::debug!(index = %self.index_name, "Updated index mapping");
        Ok(())
    }

    /// Queue a document for the next `commit`.
    pub fn add_document(&mut self, doc: PointRecord) {
        self.docs.push(doc);
    }

    /// Send every buffered document in `chunk_size` batches.
    ///
    /// A failed batch and everything after it stay buffered.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failed batch.
    pub async fn commit(&mut self) -> Result<()> {
        while !self.docs.is_empty() {
            let count = self.docs.len().min(self.chunk_size);
            if let Err(err) = self.bulk_index(&self.docs[..count]).await {
                tracing::error!(buffered = self.docs.len(), error = %err, "Bulk indexing failed");
                return Err(err);
            }
            self.docs.drain(..count);
        }
        Ok(())
    }

    async fn bulk_index(&self, docs: &[PointRecord]) -> Result<()> {
        let mut body = String::new();
        for doc in docs {
            body.push_str("{\"index\":{}}\n");
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
        }

        let url = self.index_url("/_bulk");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let result: BulkResponse = json_body(response, 200, &url).await?;

        if result.errors {
            let failures: Vec<_> = result
                .items
                .iter()
                .flat_map(|item| item.values())
                .filter(|item| item.error.is_some() || item.status >= 300)
                .collect();
            let reason = failures
                .first()
                .and_then(|item| item.error.as_ref())
                .map(Value::to_string)
                .unwrap_or_default();
            return Err(StoreError::BulkRejected {
                failed: failures.len(),
                total: docs.len(),
                reason,
            });
        }
        tracing::debug!(index = %self.index_name, documents = docs.len(), "Bulk indexed documents");
        Ok(())
    }

    /// Run a search, opening a scroll context when `scroll` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails or the answer cannot be decoded.
    pub async fn search(&self, body: &Value, scroll: bool) -> Result<SearchResponse> {
        let url = self.index_url("/_search");
        let mut request = self.client.post(&url).json(body);
        if scroll {
            request = request.query(&[("scroll", self.scroll_param())]);
        }
        let response = request.send().await?;
        let result: SearchResponse = json_body(response, 200, &body.to_string()).await?;
        log_query(body, &result);
        Ok(result)
    }

    /// Fetch the next page of a scroll context.
    ///
    /// # Errors
    ///
    /// Returns an error if the scroll expired or the answer cannot be decoded.
    pub async fn scroll(&self, scroll_id: &str) -> Result<SearchResponse> {
        let url = format!("{}/_search/scroll", self.base_url);
        let body = json!({ "scroll": self.scroll_param(), "scroll_id": scroll_id });
        let response = self.client.post(&url).json(&body).send().await?;
        json_body(response, 200, &url).await
    }

    /// Release scroll contexts.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the request.
    pub async fn close_scrolls(&self, scroll_ids: &[String]) -> Result<()> {
        if scroll_ids.is_empty() {
            return Ok(());
        }
        let url = format!("{}/_search/scroll", self.base_url);
        let body = json!({ "scroll_id": scroll_ids });
        let response = self.client.delete(&url).json(&body).send().await?;
        let result: ClearScrollResponse = json_body(response, 200, &url).await?;
        tracing::debug!(freed = result.num_freed, "Closed scroll contexts");
        Ok(())
    }

    /// Page through every hit of `query`, keeping the `[offset, offset + limit)`
    /// window (or everything when `limit` is `None`).
    ///
    /// Returns the match count and the kept documents. Every scroll context
    /// opened along the way is released before returning, including when a
    /// page fails.
    ///
    /// # Errors
    ///
    /// Returns the first search or scroll error.
    pub async fn retrieve(&self, query: Value, offset: usize, limit: Option<usize>) -> Result<(u64, Vec<PointRecord>)> {
        let mut scroll_ids = Vec::new();
        let result = self.scroll_window(query, offset, limit, &mut scroll_ids).await;

        scroll_ids.dedup();
        if let Err(err) = self.close_scrolls(&scroll_ids).await {
            tracing::warn!(error = %err, "Failed to close scroll contexts");
        }
        result
    }

    async fn scroll_window(
        &self,
        query: Value,
        offset: usize,
        limit: Option<usize>,
        scroll_ids: &mut Vec<String>,
    ) -> Result<(u64, Vec<PointRecord>)> {
        let body = json!({ "query": query, "size": self.chunk_size, "sort": ["_doc"] });
        let mut page = self.search(&body, true).await?;
        let total = page.hits.total.value();

        let mut skip = offset;
        let mut fetched = 0u64;
        let mut docs = Vec::new();
        loop {
            if let Some(id) = page.scroll_id.take() {
                scroll_ids.push(id);
            }
            fetched += page.hits.hits.len() as u64;
            let last_page = page.hits.hits.len() < self.chunk_size || fetched >= total;
            for hit in page.hits.hits {
                if limit.is_some_and(|l| docs.len() >= l) {
                    break;
                }
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                docs.push(hit.source);
            }

            let window_full = limit.is_some_and(|l| docs.len() >= l);
            if last_page || window_full {
                break;
            }
            let Some(scroll_id) = scroll_ids.last() else {
                return Err(StoreError::unexpected(BACKEND, "search response carries no scroll id"));
            };
            page = self.scroll(scroll_id).await?;
            if page.hits.hits.is_empty() {
                break;
            }
        }
        Ok((total, docs))
    }

    /// Sum quantity and price of every hit of `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails or lacks the sums.
    pub async fn sums(&self, query: Value) -> Result<(SumValue, SumValue)> {
        let body = json!({ "query": query, "size": 0, "aggregations": sum_aggregations() });
        let result = self.search(&body, false).await?;
        let aggregations = result
            .aggregations
            .ok_or_else(|| StoreError::unexpected(BACKEND, "search response carries no aggregations"))?;
        match (aggregations.sum_qty, aggregations.sum_price) {
            (Some(qty), Some(price)) => Ok((qty, price)),
            _ => Err(StoreError::unexpected(BACKEND, "missing sum_qty or sum_price aggregation")),
        }
    }

    /// Fetch one page of the composite aggregation over `groupby`.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails or lacks the aggregation.
    pub async fn composite_page(
        &self,
        query: &Value,
        groupby: &[String],
        after: Option<&Value>,
    ) -> Result<CompositePage> {
        let body = json!({
            "query": query,
            "size": 0,
            "aggregations": build_composite(groupby, self.chunk_size, after),
        });
        let result = self.search(&body, false).await?;
        let composite = result
            .aggregations
            .and_then(|a| a.sum_and_price)
            .ok_or_else(|| StoreError::unexpected(BACKEND, format!("missing {COMPOSITE_NAME} aggregation")))?;
        Ok(CompositePage {
            buckets: composite.buckets,
            after_key: composite.after_key,
        })
    }

    /// Delete every document matching `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster rejects the deletion.
    pub async fn delete_by_query(&self, query: Value) -> Result<u64> {
        let url = self.index_url("/_delete_by_query");
        let body = json!({ "query": query });
        let response = self.client.post(&url).json(&body).send().await?;
        let result: Value = json_body(response, 200, &body.to_string()).await?;
        Ok(result.get("deleted").and_then(Value::as_u64).unwrap_or(0))
    }

    fn scroll_param(&self) -> String {
        format!("{}s", self.scroll_duration)
    }
}

fn log_query(body: &Value, result: &SearchResponse) {
    tracing::debug!(
        took_ms = result.took,
        hits = result.hits.total.value(),
        query = %body,
        "Elasticsearch query"
    );
}
