//! Gnocchi HTTP client.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use super::types::{
    attribute_schema, ArchivePolicy, DetailedMeasures, GroupedMeasures, Measure, Resource,
    ResourceType, COST_METRIC, QTY_METRIC,
};
use crate::config::GnocchiConfig;
use crate::error::{Result, StoreError};
use crate::http::{base_url, build_client, check_status, json_body};

/// Time window and resolution of an aggregation request.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive stop.
    pub stop: DateTime<Utc>,
    /// Granularity in seconds.
    pub granularity: u64,
}

impl Window {
    fn params(&self) -> [(&'static str, String); 3] {
        [
            ("start", self.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("stop", self.stop.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("granularity", self.granularity.to_string()),
        ]
    }
}

/// Thin client over the Gnocchi v1 API.
#[derive(Debug, Clone)]
pub struct GnocchiClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl GnocchiClient {
    /// Create a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Configuration` if the URL is empty or the TLS
    /// material cannot be loaded.
    pub fn new(config: &GnocchiConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(&config.tls, config.timeout_seconds)?,
            base_url: base_url(&config.url)?,
            auth_token: config.auth_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}/v1/{path}", self.base_url));
        match &self.auth_token {
            Some(token) => builder.header("X-Auth-Token", token),
            None => builder,
        }
    }

    /// Whether the archive policy exists.
    ///
    /// # Errors
    ///
    /// Returns an error on any answer other than 200 or 404.
    pub async fn archive_policy_exists(&self, name: &str) -> Result<bool> {
        let path = format!("archive_policy/{name}");
        let response = self.request(Method::GET, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, 200, &path).await?;
        Ok(true)
    }

    /// Create an archive policy; a concurrent creation is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy is rejected.
    pub async fn create_archive_policy(&self, policy: &ArchivePolicy) -> Result<()> {
        let response = self
            .request(Method::POST, "archive_policy")
            .json(policy)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            tracing::debug!(policy = %policy.name, "Archive policy already exists");
            return Ok(());
        }
        check_status(response, 201, "archive_policy").await?;
        tracing::info!(policy = %policy.name, "Created archive policy");
        Ok(())
    }

    /// List every resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn list_resource_types(&self) -> Result<Vec<ResourceType>> {
        let response = self.request(Method::GET, "resource_type").send().await?;
        json_body(response, 200, "resource_type").await
    }

    /// Fetch one resource type, `None` when unknown.
    ///
    /// # Errors
    ///
    /// Returns an error on any answer other than 200 or 404.
    pub async fn get_resource_type(&self, name: &str) -> Result<Option<ResourceType>> {
        let path = format!("resource_type/{name}");
        let response = self.request(Method::GET, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json_body(response, 200, &path).await.map(Some)
    }

    /// Create a resource type with string attributes.
    ///
    /// Returns `false` if the type was created concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if the type is rejected.
    pub async fn create_resource_type(&self, name: &str, attributes: &BTreeSet<String>) -> Result<bool> {
        let schema: BTreeMap<&str, Value> = attributes
            .iter()
            .map(|a| (a.as_str(), attribute_schema()))
            .collect();
        let body = json!({ "name": name, "attributes": schema });
        let response = self
            .request(Method::POST, "resource_type")
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        check_status(response, 201, &body.to_string()).await?;
        tracing::info!(resource_type = name, "Created resource type");
        Ok(true)
    }

    /// Add string attributes to a resource type.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch is rejected.
    pub async fn add_type_attributes(&self, name: &str, attributes: &BTreeSet<String>) -> Result<()> {
        let patch: Vec<Value> = attributes
            .iter()
            .map(|a| json!({ "op": "add", "path": format!("/attributes/{a}"), "value": attribute_schema() }))
            .collect();
        let path = format!("resource_type/{name}");
        let body = serde_json::to_vec(&patch)?;
        let response = self
            .request(Method::PATCH, &path)
            .header("Content-Type", "application/json-patch+json")
            .body(body)
            .send()
            .await?;
        check_status(response, 200, &path).await?;
        tracing::info!(resource_type = name, added = ?attributes, "Extended resource type");
        Ok(())
    }

    /// Search resources of `resource_type`; `None` lists them all.
    ///
    /// An unknown type or attribute matches nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails otherwise.
    pub async fn search_resources(&self, resource_type: &str, filter: Option<&Value>) -> Result<Vec<Resource>> {
        let path = format!("search/resource/{resource_type}");
        let mut request = self.request(Method::POST, &path);
        if let Some(filter) = filter {
            request = request.json(filter);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                tracing::debug!(resource_type, body = %body, "Resource search matched nothing");
                Ok(Vec::new())
            }
            _ => json_body(response, 200, &path).await,
        }
    }

    /// Create a resource.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidStatusCode` with status 400 or 404 when the
    /// resource type lacks an attribute or does not exist.
    pub async fn create_resource(&self, resource_type: &str, body: &Value) -> Result<Resource> {
        let path = format!("resource/{resource_type}");
        let response = self.request(Method::POST, &path).json(body).send().await?;
        json_body(response, 201, &body.to_string()).await
    }

    /// Update resource attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the update is rejected.
    pub async fn update_resource(&self, resource_type: &str, id: &str, attributes: &Value) -> Result<()> {
        let path = format!("resource/{resource_type}/{id}");
        let response = self
            .request(Method::PATCH, &path)
            .json(attributes)
            .send()
            .await?;
        check_status(response, 200, &path).await?;
        Ok(())
    }

    /// Delete a resource and its metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion is rejected; an already deleted
    /// resource is not an error.
    pub async fn delete_resource(&self, resource_type: &str, id: &str) -> Result<()> {
        let path = format!("resource/{resource_type}/{id}");
        let response = self.request(Method::DELETE, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, 204, &path).await?;
        Ok(())
    }

    /// Post measures for several metrics at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is rejected.
    pub async fn batch_measures(&self, measures: &BTreeMap<String, Vec<Measure>>) -> Result<()> {
        let response = self
            .request(Method::POST, "batch/metrics/measures")
            .json(measures)
            .send()
            .await?;
        check_status(response, 202, "batch/metrics/measures").await?;
        Ok(())
    }

    /// Per-resource `qty`/`cost` sums of the resources matched by `search`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the answer cannot be decoded.
    pub async fn detailed_sums(&self, resource_type: &str, search: &Value, window: Window) -> Result<DetailedMeasures> {
        let body = json!({
            "operations": format!("(metric ({QTY_METRIC} sum) ({COST_METRIC} sum))"),
            "resource_type": resource_type,
            "search": search,
        });
        let response = self
            .request(Method::POST, "aggregates")
            .query(&[("details", "true")])
            .query(&window.params())
            .json(&body)
            .send()
            .await?;
        json_body(response, 200, &body.to_string()).await
    }

    /// Sum of `metric` across the resources matched by `search`, grouped by
    /// `groupby` attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the answer cannot be decoded.
    pub async fn grouped_sums(
        &self,
        resource_type: &str,
        metric: &str,
        search: &Value,
        groupby: &[String],
        window: Window,
    ) -> Result<Vec<GroupedMeasures>> {
        let body = json!({
            "operations": format!("(aggregate sum (metric {metric} sum))"),
            "resource_type": resource_type,
            "search": search,
        });
        let groupby: Vec<(&str, &str)> = groupby.iter().map(|g| ("groupby", g.as_str())).collect();
        let response = self
            .request(Method::POST, "aggregates")
            .query(&groupby)
            .query(&window.params())
            .json(&body)
            .send()
            .await?;
        json_body(response, 200, &body.to_string()).await
    }
}

impl StoreError {
    /// Whether a resource creation was refused because of the resource type
    /// schema.
    pub(crate) fn is_schema_rejection(&self) -> bool {
        matches!(self, Self::InvalidStatusCode { actual: 400 | 404, .. })
    }
}
