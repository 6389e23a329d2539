//! Error types for the batch pipeline.
//!
//! Each layer owns a small error enum; only startup errors are fatal to a
//! run. The LLM client resolves its own failures through the local fallback
//! and therefore has no variant here (see `llm::client::LlmError` for the
//! internal taxonomy it retries over).

use chrono::NaiveDate;
use thiserror::Error;

/// Configuration loading or validation failures. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },
}

/// Category catalog problems detected while loading from the store.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("category catalog is empty")]
    Empty,

    #[error("fallback category id {0} is not present in the catalog")]
    MissingFallback(i32),
}

/// Store access failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Top-level failures of a batch or reconciliation run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}
