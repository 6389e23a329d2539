//! Configuration for the batch pipeline.
//!
//! Everything is environment-driven (with `.env` support loaded in `main`)
//! so the same binary can run against different schemas and deployments.
//! Table and column names are configuration, never runtime input.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::llm::LlmConfig;

/// Names of the three tables the pipeline touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableNames {
    pub chattings: String,
    pub keywords: String,
    pub categories: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            chattings: "chattings".to_string(),
            keywords: "admin_chat_keywords".to_string(),
            categories: "admin_categories".to_string(),
        }
    }
}

/// Column names, injected into the generated SQL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnNames {
    pub chatting_pk: String,
    pub input_text: String,
    pub created_at: String,
    pub query_text: String,
    pub keyword: String,
    pub category_id: String,
    pub query_count: String,
    pub batch_created_at: String,
    pub category_name: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            chatting_pk: "chatting_pk".to_string(),
            input_text: "input_text".to_string(),
            created_at: "created_at".to_string(),
            query_text: "query_text".to_string(),
            keyword: "keyword".to_string(),
            category_id: "category_id".to_string(),
            query_count: "query_count".to_string(),
            batch_created_at: "batch_created_at".to_string(),
            category_name: "category_name".to_string(),
        }
    }
}

/// Database connection and schema settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// MySQL connection URL.
    pub url: String,
    /// Base pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Extra connections allowed beyond the base pool.
    #[serde(default = "default_max_overflow")]
    pub max_overflow: u32,
    /// Seconds to wait when acquiring a connection.
    #[serde(default = "default_pool_timeout")]
    pub acquire_timeout_secs: u64,
    /// Maximum connection age before it is recycled.
    #[serde(default = "default_pool_recycle")]
    pub recycle_secs: u64,
    #[serde(default)]
    pub tables: TableNames,
    #[serde(default)]
    pub columns: ColumnNames,
}

fn default_pool_size() -> u32 {
    10
}
fn default_max_overflow() -> u32 {
    20
}
fn default_pool_timeout() -> u64 {
    30
}
fn default_pool_recycle() -> u64 {
    3600
}

/// Chunking and fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Utterances handed to one worker at a time.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Concurrent chunk workers per date.
    #[serde(default = "default_workers_per_date")]
    pub workers_per_date: usize,
    /// Dates processed concurrently.
    #[serde(default = "default_concurrent_dates")]
    pub concurrent_dates: usize,
    /// Records per insert round trip.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
}

fn default_chunk_size() -> usize {
    100
}
fn default_workers_per_date() -> usize {
    4
}
fn default_concurrent_dates() -> usize {
    3
}
fn default_insert_batch_size() -> usize {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers_per_date: default_workers_per_date(),
            concurrent_dates: default_concurrent_dates(),
            insert_batch_size: default_insert_batch_size(),
        }
    }
}

/// Catalog settings. The catalog itself lives in the category table and is
/// loaded at startup; only the fallback id is configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_fallback_category_id")]
    pub fallback_id: i32,
}

fn default_fallback_category_id() -> i32 {
    11
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            fallback_id: default_fallback_category_id(),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub catalog: CatalogConfig,
}

impl Config {
    /// Load configuration from the environment. Missing mandatory settings
    /// or unparsable values abort startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = StoreConfig {
            url: require("DATABASE_URL")?,
            pool_size: parse_or("DB_POOL_SIZE", default_pool_size())?,
            max_overflow: parse_or("DB_MAX_OVERFLOW", default_max_overflow())?,
            acquire_timeout_secs: parse_or("DB_POOL_TIMEOUT", default_pool_timeout())?,
            recycle_secs: parse_or("DB_POOL_RECYCLE", default_pool_recycle())?,
            tables: TableNames {
                chattings: string_or("DB_TABLE_CHATTINGS", TableNames::default().chattings),
                keywords: string_or("DB_TABLE_KEYWORDS", TableNames::default().keywords),
                categories: string_or("DB_TABLE_CATEGORIES", TableNames::default().categories),
            },
            columns: ColumnNames {
                chatting_pk: string_or("DB_COLUMN_CHATTING_PK", ColumnNames::default().chatting_pk),
                input_text: string_or("DB_COLUMN_INPUT_TEXT", ColumnNames::default().input_text),
                created_at: string_or("DB_COLUMN_CREATED_AT", ColumnNames::default().created_at),
                query_text: string_or("DB_COLUMN_QUERY_TEXT", ColumnNames::default().query_text),
                keyword: string_or("DB_COLUMN_KEYWORD", ColumnNames::default().keyword),
                category_id: string_or("DB_COLUMN_CATEGORY_ID", ColumnNames::default().category_id),
                query_count: string_or("DB_COLUMN_QUERY_COUNT", ColumnNames::default().query_count),
                batch_created_at: string_or(
                    "DB_COLUMN_BATCH_CREATED_AT",
                    ColumnNames::default().batch_created_at,
                ),
                category_name: string_or(
                    "DB_COLUMN_CATEGORY_NAME",
                    ColumnNames::default().category_name,
                ),
            },
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            api_key: require("LLM_API_KEY")?,
            endpoint: require("LLM_ENDPOINT")?,
            model: string_or("LLM_MODEL", llm_defaults.model),
            max_requests_per_minute: parse_or(
                "LLM_MAX_REQUESTS_PER_MINUTE",
                llm_defaults.max_requests_per_minute,
            )?,
            min_request_interval: parse_or(
                "LLM_MIN_REQUEST_INTERVAL",
                llm_defaults.min_request_interval,
            )?,
            max_retries: parse_or("LLM_MAX_RETRIES", llm_defaults.max_retries)?,
            base_delay: parse_or("LLM_BASE_DELAY", llm_defaults.base_delay)?,
            max_delay: parse_or("LLM_MAX_DELAY", llm_defaults.max_delay)?,
            timeout_secs: parse_or("LLM_TIMEOUT", llm_defaults.timeout_secs)?,
        };

        let pipeline = PipelineConfig {
            chunk_size: parse_or("PIPELINE_CHUNK_SIZE", default_chunk_size())?,
            workers_per_date: parse_or("PIPELINE_WORKERS_PER_DATE", default_workers_per_date())?,
            concurrent_dates: parse_or("PIPELINE_CONCURRENT_DATES", default_concurrent_dates())?,
            insert_batch_size: parse_or("PIPELINE_INSERT_BATCH_SIZE", default_insert_batch_size())?,
        };

        let catalog = CatalogConfig {
            fallback_id: parse_or("CATEGORY_FALLBACK_ID", default_fallback_category_id())?,
        };

        let config = Self {
            store,
            llm,
            pipeline,
            catalog,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.chunk_size == 0 {
            return Err(ConfigError::InvalidVar {
                var: "PIPELINE_CHUNK_SIZE",
                value: "0".to_string(),
            });
        }
        if self.pipeline.workers_per_date == 0 {
            return Err(ConfigError::InvalidVar {
                var: "PIPELINE_WORKERS_PER_DATE",
                value: "0".to_string(),
            });
        }
        if self.pipeline.concurrent_dates == 0 {
            return Err(ConfigError::InvalidVar {
                var: "PIPELINE_CONCURRENT_DATES",
                value: "0".to_string(),
            });
        }
        if self.pipeline.insert_batch_size == 0 {
            return Err(ConfigError::InvalidVar {
                var: "PIPELINE_INSERT_BATCH_SIZE",
                value: "0".to_string(),
            });
        }
        if self.store.pool_size == 0 {
            return Err(ConfigError::InvalidVar {
                var: "DB_POOL_SIZE",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

fn string_or(var: &str, default: String) -> String {
    env::var(var).ok().filter(|v| !v.trim().is_empty()).unwrap_or(default)
}

fn parse_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidVar {
            var,
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_and_column_defaults() {
        let tables = TableNames::default();
        assert_eq!(tables.chattings, "chattings");
        assert_eq!(tables.keywords, "admin_chat_keywords");
        assert_eq!(tables.categories, "admin_categories");

        let columns = ColumnNames::default();
        assert_eq!(columns.input_text, "input_text");
        assert_eq!(columns.batch_created_at, "batch_created_at");
    }

    #[test]
    fn test_pipeline_defaults() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.chunk_size, 100);
        assert_eq!(pipeline.workers_per_date, 4);
        assert_eq!(pipeline.concurrent_dates, 3);
        assert_eq!(pipeline.insert_batch_size, 100);
    }

    #[test]
    fn test_fallback_category_default() {
        assert_eq!(CatalogConfig::default().fallback_id, 11);
    }
}
