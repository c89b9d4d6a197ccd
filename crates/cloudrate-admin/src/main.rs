//! cloudrate-init - provisions the configured storage backend.
//!
//! Reads `CLOUDRATE_*` variables, builds the backend and runs its `init`
//! step (archive policy and resource types, index and mapping, ...).
//! A backend name given as first argument overrides
//! `CLOUDRATE_STORAGE_BACKEND`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudrate_store::{create_storage, create_storage_by_name, StorageConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cloudrate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut storage = match std::env::args().nth(1) {
        Some(name) => create_storage_by_name(&name)?,
        None => create_storage(StorageConfig::from_env()?)?,
    };
    tracing::info!(backend = storage.name(), "Provisioning storage backend");

    if let Err(err) = storage.init().await {
        tracing::error!(backend = storage.name(), error = %err, "Provisioning failed");
        return Err(err.into());
    }

    tracing::info!(backend = storage.name(), "Storage backend ready");
    Ok(())
}
