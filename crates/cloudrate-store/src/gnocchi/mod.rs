//! Metrics-engine storage backend.
//!
//! Every `(metric type, scope, groupby)` combination maps to one Gnocchi
//! resource of type `rating_<metric type>` carrying a `qty` and a `cost`
//! metric. Points become measures on those metrics, stamped with the frame
//! start.
//!
//! Resource types are provisioned on demand: when a point brings a groupby
//! or metadata key its type does not declare yet, the type is patched and
//! the creation retried once.

pub mod client;
pub mod types;

pub use client::{GnocchiClient, Window};

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudrate_core::{
    frames_from_rows, merge_type_totals, paginate, DataFrame, DataPoint, Decimal, Filters,
    RetrieveQuery, RetrieveResult, TotalQuery, TotalResult, TotalRow, UsageRow, TYPE_FIELD,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use self::types::{
    base_attributes, groupby_attr, meta_attr, new_resource_body, point_attributes,
    resource_type_name, sanitize, ArchivePolicy, ArchivePolicyRule, Measure, Resource, ResourceType, Sample,
    COST_METRIC, METRIC_TYPE_ATTR, QTY_METRIC, RESOURCE_TYPE_PREFIX, SCOPE_ATTR, UNIT_ATTR,
};
use crate::cache::{CachedResource, ResourceCache, ResourceKey};
use crate::config::GnocchiConfig;
use crate::error::{Result, StoreError};
use crate::{warn_custom_fields, Storage};

const BACKEND: &str = "gnocchi";

type MetricMeasures = BTreeMap<String, Vec<Measure>>;

/// Storage backend on a Gnocchi metrics engine.
#[derive(Debug)]
pub struct GnocchiStorage {
    client: GnocchiClient,
    config: GnocchiConfig,
    cache: ResourceCache,
    /// Attributes known to be declared, per resource type.
    known_types: BTreeMap<String, BTreeSet<String>>,
    /// Buffered measures per scope.
    measures: BTreeMap<String, MetricMeasures>,
    /// Evicted cache entries whose metadata was never written back.
    evicted_updates: Vec<(ResourceKey, CachedResource)>,
}

impl GnocchiStorage {
    /// Create the backend.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: GnocchiConfig) -> Result<Self> {
        Ok(Self {
            client: GnocchiClient::new(&config)?,
            cache: ResourceCache::new(config.resource_cache_size),
            config,
            known_types: BTreeMap::new(),
            measures: BTreeMap::new(),
            evicted_updates: Vec::new(),
        })
    }

    /// Number of buffered measures across scopes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.measures
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }

    fn window(&self, begin: DateTime<Utc>, end: DateTime<Utc>) -> Window {
        Window {
            start: begin,
            stop: end,
            granularity: self.config.archive_policy_granularity,
        }
    }

    async fn ensure_archive_policy(&self) -> Result<()> {
        let name = &self.config.archive_policy_name;
        if self.client.archive_policy_exists(name).await? {
            return Ok(());
        }
        let policy = ArchivePolicy {
            name: name.clone(),
            definition: vec![ArchivePolicyRule {
                granularity: self.config.archive_policy_granularity,
                timespan: self.config.archive_policy_timespan.clone(),
            }],
            aggregation_methods: vec!["sum".into()],
        };
        self.client.create_archive_policy(&policy).await
    }

    /// Make sure `name` exists and declares every attribute in `attributes`.
    async fn ensure_resource_type(&mut self, name: &str, attributes: &BTreeSet<String>) -> Result<()> {
        if self
            .known_types
            .get(name)
            .is_some_and(|known| known.is_superset(attributes))
        {
            return Ok(());
        }

        let existing = match self.client.get_resource_type(name).await? {
            Some(existing) => existing,
            None => {
                if self.client.create_resource_type(name, attributes).await? {
                    self.known_types.insert(name.to_string(), attributes.clone());
                    return Ok(());
                }
                self.client
                    .get_resource_type(name)
                    .await?
                    .ok_or_else(|| StoreError::UnknownResourceType(name.to_string()))?
            }
        };

        let mut declared: BTreeSet<String> = existing.attributes.keys().cloned().collect();
        let missing: BTreeSet<String> = attributes.difference(&declared).cloned().collect();
        if !missing.is_empty() {
            self.client.add_type_attributes(name, &missing).await?;
            declared.extend(missing);
        }
        self.known_types.insert(name.to_string(), declared);
        Ok(())
    }

    /// Find the resource holding `point`, creating it if needed.
    async fn resolve_resource(&mut self, metric_type: &str, scope_id: &str, point: &DataPoint) -> Result<CachedResource> {
        let key = ResourceKey::new(metric_type, scope_id, point.groupby());
        if let Some(cached) = self.cache.touch(&key, point.unit(), point.metadata()) {
            return Ok(cached.clone());
        }

        let type_name = resource_type_name(metric_type);
        let resource = match self.find_resource(&type_name, &key).await? {
            Some(found) => {
                let mut cached = to_cached(&found)?;
                if cached.unit != point.unit() || cached.metadata != *point.metadata() {
                    cached.unit = point.unit().to_string();
                    cached.metadata.clone_from(point.metadata());
                    cached.needs_update = true;
                }
                cached
            }
            None => self.create_resource(&type_name, metric_type, scope_id, point).await?,
        };

        if let Some((evicted_key, evicted)) = self.cache.insert(key, resource.clone()) {
            if evicted.needs_update {
                self.evicted_updates.push((evicted_key, evicted));
            }
        }
        Ok(resource)
    }

    async fn find_resource(&self, type_name: &str, key: &ResourceKey) -> Result<Option<Resource>> {
        let mut clauses = vec![
            json!({ "=": { METRIC_TYPE_ATTR: key.metric_type() } }),
            json!({ "=": { SCOPE_ATTR: key.scope_id() } }),
        ];
        for (k, v) in key.groupby() {
            clauses.push(json!({ "=": { groupby_attr(k): v } }));
        }
        let filter = json!({ "and": clauses });
        let resources = self.client.search_resources(type_name, Some(&filter)).await?;

        // A resource with extra groupby keys also matches the search.
        let expected: BTreeMap<String, String> = key
            .groupby()
            .iter()
            .map(|(k, v)| (sanitize(k), v.clone()))
            .collect();
        Ok(resources.into_iter().find(|r| r.groupby() == expected))
    }

    async fn create_resource(
        &mut self,
        type_name: &str,
        metric_type: &str,
        scope_id: &str,
        point: &DataPoint,
    ) -> Result<CachedResource> {
        let attributes = point_attributes(point);
        let id = Uuid::new_v4().to_string();
        let body = new_resource_body(&id, metric_type, scope_id, point, &self.config.archive_policy_name);

        let created = match self.client.create_resource(type_name, &body).await {
            Ok(created) => created,
            Err(err) if err.is_schema_rejection() => {
                tracing::debug!(resource_type = type_name, error = %err, "Provisioning resource type");
                self.known_types.remove(type_name);
                self.ensure_resource_type(type_name, &attributes).await?;
                self.client.create_resource(type_name, &body).await?
            }
            Err(err) => return Err(err),
        };
        tracing::debug!(resource_type = type_name, id = %created.id, "Created resource");
        to_cached(&created)
    }

    /// Send the buffered measures of `scope_id`.
    ///
    /// Chunks that fail twice stay buffered.
    async fn flush_scope(&mut self, scope_id: &str) -> Result<()> {
        let Some(buffer) = self.measures.remove(scope_id) else {
            return Ok(());
        };

        let mut pending: Vec<(String, Measure)> = buffer
            .into_iter()
            .flat_map(|(metric, measures)| measures.into_iter().map(move |m| (metric.clone(), m)))
            .collect();
        let chunk_size = self.config.measure_chunk_size.max(1);
        let mut sent = 0;

        while sent < pending.len() {
            let end = (sent + chunk_size).min(pending.len());
            let mut chunk: MetricMeasures = BTreeMap::new();
            for (metric, measure) in &pending[sent..end] {
                chunk.entry(metric.clone()).or_default().push(measure.clone());
            }
            if let Err(err) = self.send_with_retry(&chunk).await {
                tracing::error!(scope_id, unsent = pending.len() - sent, error = %err, "Measure batch failed");
                let unsent = self.measures.entry(scope_id.to_string()).or_default();
                for (metric, measure) in pending.drain(sent..) {
                    unsent.entry(metric).or_default().push(measure);
                }
                return Err(err);
            }
            sent = end;
        }
        tracing::debug!(scope_id, measures = sent, "Flushed measures");
        Ok(())
    }

    async fn send_with_retry(&self, chunk: &MetricMeasures) -> Result<()> {
        match self.client.batch_measures(chunk).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "Measure batch failed, retrying once");
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                self.client.batch_measures(chunk).await
            }
        }
    }

    /// Write back metadata changes recorded in the cache.
    async fn update_resources(&mut self) -> Result<()> {
        let mut evicted = std::mem::take(&mut self.evicted_updates);
        while let Some((key, resource)) = evicted.pop() {
            if let Err(err) = self.update_resource(&key, &resource).await {
                evicted.push((key, resource));
                self.evicted_updates = evicted;
                return Err(err);
            }
        }

        for (key, resource) in self.cache.pending_updates() {
            self.update_resource(&key, &resource).await?;
            self.cache.mark_updated(&key);
        }
        Ok(())
    }

    async fn update_resource(&mut self, key: &ResourceKey, resource: &CachedResource) -> Result<()> {
        let type_name = resource_type_name(key.metric_type());
        let mut attributes = base_attributes();
        let mut patch = Map::new();
        patch.insert(UNIT_ATTR.into(), json!(resource.unit));
        for (k, v) in &resource.metadata {
            let name = meta_attr(k);
            attributes.insert(name.clone());
            patch.insert(name, json!(v));
        }
        self.ensure_resource_type(&type_name, &attributes).await?;
        self.client
            .update_resource(&type_name, &resource.id, &Value::Object(patch))
            .await?;
        tracing::debug!(resource_type = %type_name, id = %resource.id, "Updated resource metadata");
        Ok(())
    }

    /// Resource types queried for `metric_types`, or every rating type.
    async fn query_types(&self, metric_types: Option<&[String]>) -> Result<Vec<ResourceType>> {
        let all = self.client.list_resource_types().await?;
        Ok(match metric_types {
            Some(types) => {
                let wanted: BTreeSet<String> = types.iter().map(|t| resource_type_name(t)).collect();
                all.into_iter().filter(|t| wanted.contains(&t.name)).collect()
            }
            None => all
                .into_iter()
                .filter(|t| t.name.starts_with(RESOURCE_TYPE_PREFIX))
                .collect(),
        })
    }

    /// Search filter of `filters` against `resource_type`.
    ///
    /// `None` when the type lacks the attributes a filter needs, so none of
    /// its resources can match.
    fn search_filter(&self, resource_type: &ResourceType, filters: &Filters) -> Option<Value> {
        let mut clauses = Vec::new();
        for (key, value) in filters {
            if key == TYPE_FIELD {
                continue;
            }
            if *key == self.config.scope_key {
                clauses.push(json!({ "=": { SCOPE_ATTR: value } }));
                continue;
            }
            let candidates: Vec<Value> = [groupby_attr(key), meta_attr(key)]
                .into_iter()
                .filter(|attr| resource_type.attributes.contains_key(attr))
                .map(|attr| json!({ "=": { attr: value } }))
                .collect();
            if candidates.is_empty() {
                return None;
            }
            clauses.push(json!({ "or": candidates }));
        }
        if let Some(metric_type) = filters.get(TYPE_FIELD) {
            clauses.push(json!({ "=": { METRIC_TYPE_ATTR: metric_type } }));
        }
        Some(json!({ "and": clauses }))
    }

    /// Resources of `resource_type` matching `filters`.
    async fn matching_resources(&self, resource_type: &ResourceType, filters: &Filters) -> Result<Vec<Resource>> {
        let Some(filter) = self.search_filter(resource_type, filters) else {
            tracing::debug!(resource_type = %resource_type.name, "Resource type cannot match filters");
            return Ok(Vec::new());
        };
        let filter = if filters.is_empty() { None } else { Some(filter) };
        self.client.search_resources(&resource_type.name, filter.as_ref()).await
    }

    async fn fetch_rows(&self, query: &RetrieveQuery) -> Result<Vec<UsageRow>> {
        let metric_types = query.effective_metric_types();
        let window = self.window(query.begin, query.end);
        let mut rows = Vec::new();

        for resource_type in self.query_types(metric_types.as_deref()).await? {
            let resources = self.matching_resources(&resource_type, &query.filters).await?;
            if resources.is_empty() {
                continue;
            }
            let search = ids_filter(&resources);
            let detailed = self
                .client
                .detailed_sums(&resource_type.name, &search, window)
                .await?;

            for resource in &resources {
                let Some(per_metric) = detailed.measures.get(&resource.id) else {
                    continue;
                };
                let Some(metric_type) = resource.metric_type() else {
                    tracing::warn!(id = %resource.id, "Resource has no metric type, skipping");
                    continue;
                };
                let qty = sum_series(per_metric.get(QTY_METRIC));
                let cost = sum_series(per_metric.get(COST_METRIC));

                let mut periods: BTreeMap<(DateTime<Utc>, DateTime<Utc>), (Decimal, Decimal)> = BTreeMap::new();
                for sample in qty {
                    periods.entry(sample.period()).or_default().0 += sample.amount();
                }
                for sample in cost {
                    periods.entry(sample.period()).or_default().1 += sample.amount();
                }
                for ((start, end), (qty, price)) in periods {
                    if start < query.begin || end > query.end {
                        continue;
                    }
                    rows.push(UsageRow {
                        start,
                        end,
                        metric_type: metric_type.to_string(),
                        point: resource.point(qty, price),
                    });
                }
            }
        }

        rows.sort_by(|a, b| (a.start, &a.metric_type).cmp(&(b.start, &b.metric_type)));
        Ok(rows)
    }

    async fn type_totals(
        &self,
        resource_type: &ResourceType,
        query: &TotalQuery,
        group_attributes: &[String],
    ) -> Result<Vec<TotalRow>> {
        let resources = self.matching_resources(resource_type, &query.filters).await?;
        if resources.is_empty() {
            return Ok(Vec::new());
        }
        let search = ids_filter(&resources);
        let window = self.window(query.begin, query.end);

        let mut groups: BTreeMap<Vec<String>, (Decimal, Decimal)> = BTreeMap::new();
        for (metric, is_qty) in [(QTY_METRIC, true), (COST_METRIC, false)] {
            let answer = self
                .client
                .grouped_sums(&resource_type.name, metric, &search, group_attributes, window)
                .await?;
            for group in answer {
                let key: Vec<String> = group_attributes.iter().map(|a| group.group_value(a)).collect();
                let mut amount = Decimal::ZERO;
                for sample in group.samples()? {
                    let (start, end) = sample.period();
                    if start >= query.begin && end <= query.end {
                        amount += sample.amount();
                    }
                }
                let sums = groups.entry(key).or_default();
                if is_qty {
                    sums.0 += amount;
                } else {
                    sums.1 += amount;
                }
            }
        }

        Ok(groups
            .into_iter()
            .map(|(key, (qty, rate))| {
                let values: BTreeMap<&str, String> = group_attributes
                    .iter()
                    .map(String::as_str)
                    .zip(key)
                    .collect();
                let groupby = query
                    .groupby
                    .iter()
                    .map(|field| {
                        let attribute = if field == TYPE_FIELD {
                            METRIC_TYPE_ATTR.to_string()
                        } else {
                            groupby_attr(field)
                        };
                        (field.clone(), values.get(attribute.as_str()).cloned().unwrap_or_default())
                    })
                    .collect();
                TotalRow {
                    groupby,
                    qty,
                    rate,
                    begin: query.begin,
                    end: query.end,
                }
            })
            .collect())
    }
}

fn to_cached(resource: &Resource) -> Result<CachedResource> {
    let metric = |name: &str| {
        resource.metrics.get(name).cloned().ok_or_else(|| {
            StoreError::unexpected(BACKEND, format!("resource {} has no {name} metric", resource.id))
        })
    };
    Ok(CachedResource {
        id: resource.id.clone(),
        qty_metric: metric(QTY_METRIC)?,
        cost_metric: metric(COST_METRIC)?,
        unit: resource.attribute(UNIT_ATTR).unwrap_or_default().to_string(),
        metadata: resource.metadata(),
        needs_update: false,
    })
}

fn ids_filter(resources: &[Resource]) -> Value {
    let ids: Vec<&str> = resources.iter().map(|r| r.id.as_str()).collect();
    json!({ "in": { "id": ids } })
}

fn sum_series(per_method: Option<&BTreeMap<String, Vec<Sample>>>) -> Vec<Sample> {
    per_method
        .and_then(|methods| methods.get("sum"))
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl Storage for GnocchiStorage {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn init(&mut self) -> Result<()> {
        self.ensure_archive_policy().await?;
        let attributes = base_attributes();
        for metric_type in self.config.metric_types.clone() {
            self.ensure_resource_type(&resource_type_name(&metric_type), &attributes)
                .await?;
        }
        tracing::info!(
            policy = %self.config.archive_policy_name,
            types = self.config.metric_types.len(),
            "Gnocchi storage initialized"
        );
        Ok(())
    }

    async fn push(&mut self, frames: &[DataFrame], scope_id: &str) -> Result<()> {
        for frame in frames {
            for (metric_type, point) in frame.iter_points() {
                let resource = self.resolve_resource(metric_type, scope_id, point).await?;
                let buffer = self.measures.entry(scope_id.to_string()).or_default();
                buffer
                    .entry(resource.qty_metric)
                    .or_default()
                    .push(Measure::new(frame.start(), point.qty()));
                buffer
                    .entry(resource.cost_metric)
                    .or_default()
                    .push(Measure::new(frame.start(), point.price()));
            }
        }
        self.flush_scope(scope_id).await?;
        self.update_resources().await
    }

    async fn flush(&mut self) -> Result<()> {
        let scopes: Vec<String> = self.measures.keys().cloned().collect();
        for scope_id in scopes {
            self.flush_scope(&scope_id).await?;
        }
        self.update_resources().await
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
        let required: Vec<String> = query
            .groupby
            .iter()
            .filter(|field| field.as_str() != TYPE_FIELD)
            .map(|field| groupby_attr(field))
            .collect();
        let mut group_attributes = vec![METRIC_TYPE_ATTR.to_string()];
        group_attributes.extend(required.iter().cloned());

        let metric_types = query.effective_metric_types();
        let mut per_type = Vec::new();
        for resource_type in self.query_types(metric_types.as_deref()).await? {
            if !resource_type.has_attributes(&required) {
                tracing::debug!(
                    resource_type = %resource_type.name,
                    "Resource type lacks groupby attributes, skipping"
                );
                continue;
            }
            per_type.push(self.type_totals(&resource_type, query, &group_attributes).await?);
        }

        let mut results = merge_type_totals(per_type, &query.groupby);
        if query.groupby.is_empty() && results.is_empty() {
            results.push(TotalRow {
                groupby: BTreeMap::new(),
                qty: Decimal::ZERO,
                rate: Decimal::ZERO,
                begin: query.begin,
                end: query.end,
            });
        }
        Ok(TotalResult {
            total: results.len() as u64,
            results: paginate(results, query.offset, query.limit, query.paginate),
        })
    }

    async fn delete(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>, filters: &Filters) -> Result<()> {
        // Measures cannot be removed by range, only with their resource.
        if !self.config.allow_resource_delete {
            return Err(StoreError::Unsupported {
                backend: BACKEND,
                operation: format!("deleting measures in [{begin}, {end}] without their whole resource"),
            });
        }
        tracing::warn!(
            %begin,
            %end,
            "Deleting whole resources; measures outside the range are removed too"
        );
        let metric_types = filters.get(TYPE_FIELD).map(|t| vec![t.clone()]);
        let mut deleted = 0;
        for resource_type in self.query_types(metric_types.as_deref()).await? {
            for resource in self.matching_resources(&resource_type, filters).await? {
                self.client
                    .delete_resource(&resource_type.name, &resource.id)
                    .await?;
                deleted += 1;
            }
        }
        self.cache.clear();
        self.evicted_updates.clear();
        tracing::info!(deleted, "Deleted resources");
        Ok(())
    }
}
