//! Loki HTTP client.

use chrono::{DateTime, Utc};
use reqwest::Client;

use super::types::{PushRequest, QueryResponse, StreamResult};
use crate::config::LokiConfig;
use crate::error::{Result, StoreError};
use crate::http::{base_url, build_client, check_status, json_body};

const BACKEND: &str = "loki";

/// The only push encoding supported.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Nanoseconds since the epoch.
///
/// # Errors
///
/// Returns `StoreError::UnexpectedResponse` for dates past 2262.
pub fn to_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::unexpected(BACKEND, format!("{ts} cannot be expressed in nanoseconds")))
}

/// Client for one Loki tenant.
#[derive(Debug, Clone)]
pub struct LokiClient {
    client: Client,
    base_url: String,
    tenant: String,
    content_type: String,
    query_limit: usize,
}

impl LokiClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnsupportedContentType` unless the configured
    /// content type is JSON, or a configuration error if the HTTP client
    /// cannot be built.
    pub fn new(config: &LokiConfig) -> Result<Self> {
        if config.content_type != JSON_CONTENT_TYPE {
            return Err(StoreError::UnsupportedContentType(config.content_type.clone()));
        }
        Ok(Self {
            client: build_client(&config.tls, config.timeout_seconds)?,
            base_url: base_url(&config.url)?,
            tenant: config.tenant.clone(),
            content_type: config.content_type.clone(),
            query_limit: config.query_limit.max(1),
        })
    }

    /// Lines returned by one query at most.
    #[must_use]
    pub fn query_limit(&self) -> usize {
        self.query_limit
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    /// Append lines to streams.
    ///
    /// # Errors
    ///
    /// Returns an error unless Loki answers 204.
    pub async fn push(&self, request: &PushRequest) -> Result<()> {
        let body = serde_json::to_vec(request)?;
        let response = self
            .client
            .post(self.url("push"))
            .header("X-Scope-OrgID", &self.tenant)
            .header("Content-Type", &self.content_type)
            .body(body)
            .send()
            .await?;
        check_status(response, 204, "push").await?;
        Ok(())
    }

    /// Run a log query over `[start, end)`, bounds in nanoseconds.
    ///
    /// At most `query_limit` lines come back, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the answer is not a stream
    /// result.
    pub async fn query_range(&self, query: &str, start: i64, end: i64) -> Result<Vec<StreamResult>> {
        let params = [
            ("query", query.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("limit", self.query_limit.to_string()),
            ("direction", "forward".to_string()),
        ];
        let response = self
            .client
            .get(self.url("query_range"))
            .header("X-Scope-OrgID", &self.tenant)
            .query(&params)
            .send()
            .await?;
        let result: QueryResponse = json_body(response, 200, query).await?;

        if result.status != "success" {
            return Err(StoreError::unexpected(BACKEND, format!("query status {}", result.status)));
        }
        if result.data.result_type != "streams" {
            return Err(StoreError::unexpected(
                BACKEND,
                format!("expected a streams result, got {}", result.data.result_type),
            ));
        }
        Ok(result.data.result)
    }

    /// Request deletion of the lines matched by `query` in `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns an error if Loki rejects the request.
    pub async fn delete(&self, query: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        let params = [
            ("query", query.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ];
        let response = self
            .client
            .post(self.url("delete"))
            .header("X-Scope-OrgID", &self.tenant)
            .query(&params)
            .send()
            .await?;
        check_status(response, 204, query).await?;
        Ok(())
    }
}
