//! Storage backend configuration.
//!
//! Each backend takes an explicit configuration struct at construction. The
//! structs deserialize from JSON (every field has a default) and can be
//! loaded from `CLOUDRATE_*` environment variables.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Groupby key carrying the scope in pushed points.
pub const DEFAULT_SCOPE_KEY: &str = "project_id";

/// TLS settings for backends reached over HTTPS.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Skip server certificate verification.
    pub insecure: bool,
    /// PEM bundle of extra trusted CAs.
    pub cafile: Option<PathBuf>,
    /// PEM client certificate.
    pub client_cert: Option<PathBuf>,
    /// PEM client private key (may live in `client_cert`).
    pub client_key: Option<PathBuf>,
}

impl TlsOptions {
    fn from_env(prefix: &str) -> Self {
        Self {
            insecure: env_parse(&format!("{prefix}_INSECURE"), false),
            cafile: env_opt(&format!("{prefix}_CAFILE")).map(PathBuf::from),
            client_cert: env_opt(&format!("{prefix}_CLIENT_CERT")).map(PathBuf::from),
            client_key: env_opt(&format!("{prefix}_CLIENT_KEY")).map(PathBuf::from),
        }
    }
}

/// Metrics-engine (Gnocchi) backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GnocchiConfig {
    /// API root, e.g. `http://gnocchi:8041`.
    pub url: String,
    /// Keystone token sent as `X-Auth-Token`.
    pub auth_token: Option<String>,
    /// Archive policy attached to every rating metric.
    pub archive_policy_name: String,
    /// Archive policy granularity in seconds; also the row period on retrieval.
    pub archive_policy_granularity: u64,
    /// Archive policy timespan, e.g. `90 days`.
    pub archive_policy_timespan: String,
    /// Maximum measures per batch request.
    pub measure_chunk_size: usize,
    /// Capacity of the resource identity cache.
    pub resource_cache_size: usize,
    /// Delay before the single retry of a failed measure batch, in ms.
    pub retry_delay_ms: u64,
    /// Metric types whose resource types are declared by `init`.
    pub metric_types: Vec<String>,
    /// Groupby key carrying the scope.
    pub scope_key: String,
    /// Let `delete` remove whole resources, including measures outside the
    /// requested range.
    pub allow_resource_delete: bool,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// TLS settings.
    pub tls: TlsOptions,
}

impl Default for GnocchiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8041".into(),
            auth_token: None,
            archive_policy_name: "rating".into(),
            archive_policy_granularity: 3600,
            archive_policy_timespan: "90 days".into(),
            measure_chunk_size: 500,
            resource_cache_size: 5000,
            retry_delay_ms: 1000,
            metric_types: Vec::new(),
            scope_key: DEFAULT_SCOPE_KEY.into(),
            allow_resource_delete: false,
            timeout_seconds: 30,
            tls: TlsOptions::default(),
        }
    }
}

impl GnocchiConfig {
    /// Load from `CLOUDRATE_GNOCCHI_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_or("CLOUDRATE_GNOCCHI_URL", defaults.url),
            auth_token: env_opt("CLOUDRATE_GNOCCHI_AUTH_TOKEN"),
            archive_policy_name: env_or(
                "CLOUDRATE_GNOCCHI_ARCHIVE_POLICY",
                defaults.archive_policy_name,
            ),
            archive_policy_granularity: env_parse(
                "CLOUDRATE_GNOCCHI_GRANULARITY",
                defaults.archive_policy_granularity,
            ),
            archive_policy_timespan: env_or(
                "CLOUDRATE_GNOCCHI_TIMESPAN",
                defaults.archive_policy_timespan,
            ),
            measure_chunk_size: env_parse(
                "CLOUDRATE_GNOCCHI_MEASURE_CHUNK_SIZE",
                defaults.measure_chunk_size,
            ),
            resource_cache_size: env_parse(
                "CLOUDRATE_GNOCCHI_RESOURCE_CACHE_SIZE",
                defaults.resource_cache_size,
            ),
            retry_delay_ms: env_parse("CLOUDRATE_GNOCCHI_RETRY_DELAY_MS", defaults.retry_delay_ms),
            metric_types: env_opt("CLOUDRATE_GNOCCHI_METRIC_TYPES")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            scope_key: env_or("CLOUDRATE_SCOPE_KEY", defaults.scope_key),
            allow_resource_delete: env_parse(
                "CLOUDRATE_GNOCCHI_ALLOW_RESOURCE_DELETE",
                defaults.allow_resource_delete,
            ),
            timeout_seconds: env_parse("CLOUDRATE_GNOCCHI_TIMEOUT_SECONDS", defaults.timeout_seconds),
            tls: TlsOptions::from_env("CLOUDRATE_GNOCCHI"),
        }
    }
}

/// Document-search (Elasticsearch/OpenSearch) backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    /// Cluster URL, e.g. `http://elasticsearch:9200`.
    pub url: String,
    /// Index holding the rated documents.
    pub index_name: String,
    /// Documents per bulk request, and hits/buckets per page.
    pub chunk_size: usize,
    /// Scroll context lifetime in seconds.
    pub scroll_duration: u64,
    /// Upper bound on composite aggregation pages walked by one `total`.
    pub max_composite_pages: usize,
    /// Groupby key carrying the scope.
    pub scope_key: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// TLS settings.
    pub tls: TlsOptions,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".into(),
            index_name: "cloudkitty".into(),
            chunk_size: 5000,
            scroll_duration: 60,
            max_composite_pages: 1000,
            scope_key: DEFAULT_SCOPE_KEY.into(),
            timeout_seconds: 30,
            tls: TlsOptions::default(),
        }
    }
}

impl ElasticsearchConfig {
    /// Load from `CLOUDRATE_ELASTICSEARCH_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_or("CLOUDRATE_ELASTICSEARCH_URL", defaults.url),
            index_name: env_or("CLOUDRATE_ELASTICSEARCH_INDEX", defaults.index_name),
            chunk_size: env_parse("CLOUDRATE_ELASTICSEARCH_CHUNK_SIZE", defaults.chunk_size),
            scroll_duration: env_parse(
                "CLOUDRATE_ELASTICSEARCH_SCROLL_DURATION",
                defaults.scroll_duration,
            ),
            max_composite_pages: env_parse(
                "CLOUDRATE_ELASTICSEARCH_MAX_COMPOSITE_PAGES",
                defaults.max_composite_pages,
            ),
            scope_key: env_or("CLOUDRATE_SCOPE_KEY", defaults.scope_key),
            timeout_seconds: env_parse(
                "CLOUDRATE_ELASTICSEARCH_TIMEOUT_SECONDS",
                defaults.timeout_seconds,
            ),
            tls: TlsOptions::from_env("CLOUDRATE_ELASTICSEARCH"),
        }
    }
}

/// Log-stream (Loki) backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LokiConfig {
    /// API root including the version prefix, e.g. `http://loki:3100/loki/api/v1`.
    pub url: String,
    /// Tenant sent as `X-Scope-OrgID`.
    pub tenant: String,
    /// Static labels of every stream.
    pub stream_labels: BTreeMap<String, String>,
    /// Stream label (and groupby key) carrying the scope.
    pub scope_key: String,
    /// Buffered points that trigger a push.
    pub buffer_size: usize,
    /// Payload content type; only `application/json` is supported.
    pub content_type: String,
    /// Ranges longer than this many days are queried in shards (0 disables).
    pub shard_days: u32,
    /// Maximum entries requested per query.
    pub query_limit: usize,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// TLS settings.
    pub tls: TlsOptions,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3100/loki/api/v1".into(),
            tenant: "tenant1".into(),
            stream_labels: [("service".to_string(), "cloudkitty".to_string())].into(),
            scope_key: DEFAULT_SCOPE_KEY.into(),
            buffer_size: 1,
            content_type: "application/json".into(),
            shard_days: 7,
            query_limit: 5000,
            timeout_seconds: 30,
            tls: TlsOptions::default(),
        }
    }
}

impl LokiConfig {
    /// Load from `CLOUDRATE_LOKI_*` environment variables.
    ///
    /// `CLOUDRATE_LOKI_STREAM_LABELS` uses the `key=value,key=value` format.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_or("CLOUDRATE_LOKI_URL", defaults.url),
            tenant: env_or("CLOUDRATE_LOKI_TENANT", defaults.tenant),
            stream_labels: env_opt("CLOUDRATE_LOKI_STREAM_LABELS")
                .map(|s| parse_labels(&s))
                .unwrap_or(defaults.stream_labels),
            scope_key: env_or("CLOUDRATE_SCOPE_KEY", defaults.scope_key),
            buffer_size: env_parse("CLOUDRATE_LOKI_BUFFER_SIZE", defaults.buffer_size),
            content_type: env_or("CLOUDRATE_LOKI_CONTENT_TYPE", defaults.content_type),
            shard_days: env_parse("CLOUDRATE_LOKI_SHARD_DAYS", defaults.shard_days),
            query_limit: env_parse("CLOUDRATE_LOKI_QUERY_LIMIT", defaults.query_limit),
            timeout_seconds: env_parse("CLOUDRATE_LOKI_TIMEOUT_SECONDS", defaults.timeout_seconds),
            tls: TlsOptions::from_env("CLOUDRATE_LOKI"),
        }
    }
}

/// In-memory backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Groupby key carrying the scope.
    pub scope_key: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            scope_key: DEFAULT_SCOPE_KEY.into(),
        }
    }
}

/// Names of the available storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Metrics/resource time-series engine.
    Gnocchi,
    /// Document-search engine.
    Elasticsearch,
    /// Log-aggregation engine.
    Loki,
    /// Process-local reference store.
    Memory,
}

impl BackendKind {
    /// Every registered backend.
    pub const ALL: [Self; 4] = [Self::Gnocchi, Self::Elasticsearch, Self::Loki, Self::Memory];

    /// Configuration name of the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gnocchi => "gnocchi",
            Self::Elasticsearch => "elasticsearch",
            Self::Loki => "loki",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "gnocchi" => Ok(Self::Gnocchi),
            "elasticsearch" | "opensearch" => Ok(Self::Elasticsearch),
            "loki" => Ok(Self::Loki),
            "memory" => Ok(Self::Memory),
            _ => Err(StoreError::UnknownBackend(s.to_string())),
        }
    }
}

/// Configuration of the selected storage backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Metrics-engine backend.
    Gnocchi(GnocchiConfig),
    /// Document-search backend.
    #[serde(alias = "opensearch")]
    Elasticsearch(ElasticsearchConfig),
    /// Log-stream backend.
    Loki(LokiConfig),
    /// In-memory backend.
    Memory(MemoryConfig),
}

impl StorageConfig {
    /// Load the backend named by `CLOUDRATE_STORAGE_BACKEND` (default
    /// `elasticsearch`) with its settings from the environment.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownBackend` if the backend name is not
    /// registered.
    pub fn from_env() -> Result<Self> {
        let kind: BackendKind = env_or("CLOUDRATE_STORAGE_BACKEND", "elasticsearch".into()).parse()?;
        Ok(Self::from_env_for(kind))
    }

    /// Load the settings of `kind` from the environment.
    #[must_use]
    pub fn from_env_for(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Gnocchi => Self::Gnocchi(GnocchiConfig::from_env()),
            BackendKind::Elasticsearch => Self::Elasticsearch(ElasticsearchConfig::from_env()),
            BackendKind::Loki => Self::Loki(LokiConfig::from_env()),
            BackendKind::Memory => Self::Memory(MemoryConfig {
                scope_key: env_or("CLOUDRATE_SCOPE_KEY", DEFAULT_SCOPE_KEY.into()),
            }),
        }
    }

    /// Which backend this configuration selects.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Gnocchi(_) => BackendKind::Gnocchi,
            Self::Elasticsearch(_) => BackendKind::Elasticsearch,
            Self::Loki(_) => BackendKind::Loki,
            Self::Memory(_) => BackendKind::Memory,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: String) -> String {
    env_opt(name).unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_opt(name)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_labels(value: &str) -> BTreeMap<String, String> {
    split_list(value)
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(GnocchiConfig::default().measure_chunk_size, 500);
        assert_eq!(ElasticsearchConfig::default().chunk_size, 5000);
        assert_eq!(ElasticsearchConfig::default().scroll_duration, 60);
        let loki = LokiConfig::default();
        assert_eq!(loki.buffer_size, 1);
        assert_eq!(loki.content_type, "application/json");
    }

    #[test]
    fn backend_kind_parses_names() {
        assert_eq!("gnocchi".parse::<BackendKind>().unwrap(), BackendKind::Gnocchi);
        assert_eq!(" OpenSearch ".parse::<BackendKind>().unwrap(), BackendKind::Elasticsearch);
        assert_eq!("loki".parse::<BackendKind>().unwrap(), BackendKind::Loki);
        assert!(matches!(
            "influxdb".parse::<BackendKind>(),
            Err(StoreError::UnknownBackend(name)) if name == "influxdb"
        ));
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn storage_config_from_json() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "backend": "loki",
            "url": "http://loki:3100/loki/api/v1",
            "buffer_size": 100,
            "stream_labels": { "service": "rating", "region": "eu" },
        }))
        .unwrap();
        assert_eq!(config.kind(), BackendKind::Loki);
        let StorageConfig::Loki(loki) = config else {
            panic!("expected loki config");
        };
        assert_eq!(loki.buffer_size, 100);
        assert_eq!(loki.shard_days, 7);
        assert_eq!(loki.stream_labels.len(), 2);
    }

    #[test]
    fn parse_labels_skips_malformed_pairs() {
        let labels = parse_labels("service=rating, region = eu,broken");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["region"], "eu");
    }
}
