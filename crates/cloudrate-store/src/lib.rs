//! Rated usage storage layer for cloudrate.
//!
//! This crate persists priced usage frames and answers the row-level and
//! aggregated queries used by billing reports, against one of several
//! backends behind a single contract:
//!
//! - `gnocchi`: metrics/resource time-series engine. Points become measures
//!   on per-groupby resources; aggregation runs server side per metric type.
//! - `elasticsearch`: document-search engine. One document per point, scroll
//!   cursors for rows, composite aggregations for grouped totals.
//! - `loki`: log-aggregation engine. One JSON line per point in per-scope
//!   streams; totals are aggregated client side.
//! - `memory`: process-local reference store.
//!
//! # Example
//!
//! ```no_run
//! use cloudrate_store::{create_storage, StorageConfig};
//! use cloudrate_core::TotalQuery;
//!
//! # async fn example(frames: Vec<cloudrate_core::DataFrame>) -> cloudrate_store::Result<()> {
//! let mut storage = create_storage(StorageConfig::from_env()?)?;
//! storage.init().await?;
//! storage.push(&frames, "project-a").await?;
//!
//! let begin = frames[0].start();
//! let end = frames[0].end();
//! let totals = storage
//!     .total(&TotalQuery::new(begin, end).with_groupby(["type", "project_id"]))
//!     .await?;
//! println!("{} groups", totals.total);
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! A backend instance belongs to one caller. Write buffers and the resource
//! cache are not synchronized and are lost if the process dies before a
//! flush.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod elasticsearch;
pub mod error;
pub mod gnocchi;
mod http;
pub mod loki;
pub mod memory;
pub mod record;
pub mod registry;

pub use config::{
    BackendKind, ElasticsearchConfig, GnocchiConfig, LokiConfig, MemoryConfig, StorageConfig,
    TlsOptions,
};
pub use elasticsearch::ElasticsearchStorage;
pub use error::{Result, StoreError};
pub use gnocchi::GnocchiStorage;
pub use loki::LokiStorage;
pub use memory::MemoryStorage;
pub use registry::{create_storage, create_storage_by_name};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudrate_core::{DataFrame, Filters, RetrieveQuery, RetrieveResult, TotalQuery, TotalResult};

/// The storage contract every backend implements.
///
/// Mutating operations take `&mut self`: buffered writes and caches live in
/// the instance and are not synchronized.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name used in logs.
    fn name(&self) -> &'static str;

    /// Provision backend-side schema and policies.
    ///
    /// Safe to call on every start; "already exists" answers are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached or rejects the
    /// provisioning requests.
    async fn init(&mut self) -> Result<()>;

    /// Persist every point of every frame under `scope_id`.
    ///
    /// Backends may keep points buffered until a size threshold is crossed;
    /// see [`Storage::flush`].
    ///
    /// # Errors
    ///
    /// Returns an error if a write sent during the call fails.
    async fn push(&mut self, frames: &[DataFrame], scope_id: &str) -> Result<()>;

    /// Send every buffered write.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails; unsent points stay buffered where
    /// the backend allows it.
    async fn flush(&mut self) -> Result<()>;

    /// Fetch stored rows rebuilt into frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the answer cannot be decoded.
    async fn retrieve(&self, query: &RetrieveQuery) -> Result<RetrieveResult>;

    /// Aggregate stored rows by the requested groupby fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the answer cannot be decoded.
    async fn total(&self, query: &TotalQuery) -> Result<TotalResult>;

    /// Delete the rows of `[begin, end]` matching `filters`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the deletion.
    async fn delete(&mut self, begin: DateTime<Utc>, end: DateTime<Utc>, filters: &Filters) -> Result<()>;
}

/// Warn that a backend ignores requested custom fields.
pub(crate) fn warn_custom_fields(backend: &'static str, custom_fields: Option<&[String]>) {
    if let Some(fields) = custom_fields.filter(|f| !f.is_empty()) {
        tracing::warn!(
            backend,
            fields = ?fields,
            "custom fields are not supported by this backend and will be ignored"
        );
    }
}
