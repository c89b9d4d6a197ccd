//! Backend registry.
//!
//! This is the single point where configuration becomes a backend instance.
//! Adding a backend means adding a `StorageConfig` variant and a match arm.

use crate::config::{BackendKind, StorageConfig};
use crate::error::Result;
use crate::{ElasticsearchStorage, GnocchiStorage, LokiStorage, MemoryStorage, Storage};

/// Build the backend selected by `config`.
///
/// # Errors
///
/// Returns a configuration error if the backend rejects its settings.
pub fn create_storage(config: StorageConfig) -> Result<Box<dyn Storage>> {
    tracing::debug!(backend = %config.kind(), "Creating storage backend");
    Ok(match config {
        StorageConfig::Gnocchi(config) => Box::new(GnocchiStorage::new(config)?),
        StorageConfig::Elasticsearch(config) => Box::new(ElasticsearchStorage::new(config)?),
        StorageConfig::Loki(config) => Box::new(LokiStorage::new(config)?),
        StorageConfig::Memory(config) => Box::new(MemoryStorage::new(config)),
    })
}

/// Build the backend registered as `name`, reading its settings from the
/// environment.
///
/// # Errors
///
/// Returns `StoreError::UnknownBackend` for an unregistered name, or a
/// configuration error from the backend.
pub fn create_storage_by_name(name: &str) -> Result<Box<dyn Storage>> {
    let kind: BackendKind = name.parse()?;
    create_storage(StorageConfig::from_env_for(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LokiConfig, MemoryConfig};
    use crate::StoreError;

    #[test]
    fn creates_named_backends() {
        let storage = create_storage(StorageConfig::Memory(MemoryConfig::default())).unwrap();
        assert_eq!(storage.name(), "memory");

        let storage = create_storage(StorageConfig::Loki(LokiConfig::default())).unwrap();
        assert_eq!(storage.name(), "loki");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(matches!(
            create_storage_by_name("sqlalchemy"),
            Err(StoreError::UnknownBackend(_))
        ));
    }

    #[test]
    fn unsupported_content_type_fails_at_construction() {
        let config = LokiConfig {
            content_type: "application/x-protobuf".into(),
            ..LokiConfig::default()
        };
        assert!(matches!(
            create_storage(StorageConfig::Loki(config)),
            Err(StoreError::UnsupportedContentType(ct)) if ct == "application/x-protobuf"
        ));
    }
}
