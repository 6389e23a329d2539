//! Batch classification pipeline for chat utterances.
//!
//! The pipeline pulls distinct utterances out of a chat store for a date
//! range, classifies each one into a fixed category taxonomy through an
//! external LLM, and streams the resulting keyword rows back into a derived
//! table with idempotent inserts. A reconciliation pass detects and
//! re-classifies utterances that are still missing from the derived table.

pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod queries;
pub mod repository;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{BatchError, CatalogError, ConfigError, StoreError};
pub use llm::{Classifier, LlmClient, LlmConfig};
pub use models::{CategoryCatalog, Classification, KeywordRecord, Utterance};
pub use queries::BatchQueries;
pub use repository::KeywordRepository;
pub use services::{BatchEvent, BatchService, RunSummary};
