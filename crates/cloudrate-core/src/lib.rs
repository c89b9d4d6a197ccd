//! Core types for cloudrate.
//!
//! This crate provides the rated usage data model shared by the rating engine
//! and the storage layer:
//!
//! - **Samples**: `DataPoint`, `DataFrame`
//! - **Queries**: `RetrieveQuery`, `TotalQuery`, `RetrieveResult`, `TotalResult`
//! - **Rows**: `UsageRow` and the client-side grouping helpers
//!
//! # Decimal amounts
//!
//! Quantities and prices are `rust_decimal::Decimal`, never floating point, so
//! re-aggregating stored values does not drift.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod dataframe;
pub mod error;
pub mod query;
pub mod rows;

pub use dataframe::{Attributes, DataFrame, DataPoint, UNDEFINED_UNIT};
pub use error::{ModelError, Result};
pub use query::{
    Filters, RetrieveQuery, RetrieveResult, TotalQuery, TotalResult, TotalRow, DEFAULT_LIMIT,
    TYPE_FIELD,
};
pub use rows::{aggregate_rows, frames_from_rows, merge_type_totals, paginate, UsageRow};

pub use rust_decimal::Decimal;
