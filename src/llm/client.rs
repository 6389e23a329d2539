//! HTTP client for the external classification service.
//!
//! Every call goes through the shared rate limiter, retries transient
//! failures with exponential backoff, and post-processes the response so
//! callers always receive a usable (keyword, category) pair. When the
//! service stays broken the client falls back to local keyword extraction
//! and the catalog's fallback category instead of surfacing an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::keyword::extract_keyword;
use crate::llm::rate_limit::RateLimiter;
use crate::llm::Classifier;
use crate::models::{CategoryCatalog, Classification};

/// Keyword column width in the derived table.
const MAX_KEYWORD_CHARS: usize = 100;

/// Configuration for the LLM client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Service base URL; the model id is appended as a path segment.
    pub endpoint: String,
    /// Model to use for classification.
    #[serde(default = "default_model")]
    pub model: String,
    /// Request budget per minute, shared process-wide.
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    /// Minimum gap between consecutive requests, in seconds.
    #[serde(default = "default_min_request_interval")]
    pub min_request_interval: f64,
    /// Attempts per utterance before the local fallback takes over.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in seconds; doubled per attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    /// Ceiling on a single backoff delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "HCX-005".to_string()
}
fn default_max_requests_per_minute() -> u32 {
    30
}
fn default_min_request_interval() -> f64 {
    1.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_timeout() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: String::new(),
            model: default_model(),
            max_requests_per_minute: default_max_requests_per_minute(),
            min_request_interval: default_min_request_interval(),
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Request body sent to the classification endpoint.
#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

/// Expected response shape.
#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    keyword: String,
    category_id: i32,
}

/// Errors the retry loop distinguishes. Never escapes `classify`.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by service (HTTP 429)")]
    RateLimited,

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("request rejected: HTTP {0}")]
    Rejected(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Whether another attempt could help. Rejections (4xx other than 429)
    /// will not change on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Rejected(_))
    }
}

/// Rate-limited, retrying classification client.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
    catalog: Arc<CategoryCatalog>,
    cancel: CancellationToken,
}

impl LlmClient {
    pub fn new(config: LlmConfig, catalog: Arc<CategoryCatalog>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        let limiter = RateLimiter::new(
            config.max_requests_per_minute,
            Duration::from_secs_f64(config.min_request_interval.max(0.0)),
        );

        Self {
            config,
            client,
            limiter,
            catalog,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token. In-flight work observes
    /// it at retry boundaries.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// The shared limiter, for callers that report request statistics.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn request_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn request_once(&self, text: &str) -> Result<ClassifyResponse, LlmError> {
        let response = self
            .client
            .post(self.request_url())
            .bearer_auth(&self.config.api_key)
            .json(&ClassifyRequest { text })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if status.is_server_error() {
            return Err(LlmError::Server(status.as_u16()));
        }
        if !status.is_success() {
            return Err(LlmError::Rejected(status.as_u16()));
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;

        if parsed.keyword.trim().is_empty() {
            return Err(LlmError::Malformed("empty keyword".to_string()));
        }

        Ok(parsed)
    }

    /// Full-jitter backoff: uniform between zero and the capped exponential
    /// delay for this attempt. Desynchronizes workers that trip the same
    /// 429 at once.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.config.base_delay * 2f64.powi(attempt as i32);
        let capped = exponential.min(self.config.max_delay);
        Duration::from_secs_f64(capped * rand::thread_rng().gen_range(0.0..1.0))
    }

    /// Normalize a successful response into a classification.
    fn resolve(&self, text: &str, response: ClassifyResponse) -> Classification {
        let trimmed = response.keyword.trim();
        let keyword = if trimmed == text || trimmed.chars().count() > MAX_KEYWORD_CHARS {
            debug!(
                "keyword unusable ({} chars), extracting locally",
                trimmed.chars().count()
            );
            extract_keyword(text)
        } else {
            trimmed.to_string()
        };

        Classification {
            keyword,
            category_id: self.catalog.resolve(response.category_id),
            via_fallback: false,
        }
    }

    /// Local classification when the service could not produce one.
    fn local_fallback(&self, text: &str) -> Classification {
        Classification {
            keyword: extract_keyword(text),
            category_id: self.catalog.fallback_id(),
            via_fallback: true,
        }
    }
}

#[async_trait]
impl Classifier for LlmClient {
    async fn classify(&self, text: &str) -> Classification {
        let attempts = self.config.max_retries.max(1);

        for attempt in 0..attempts {
            if self.cancel.is_cancelled() {
                break;
            }

            self.limiter.acquire().await;

            match self.request_once(text).await {
                Ok(response) => return self.resolve(text, response),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        "attempt {}/{} failed ({}), retrying in {:?}",
                        attempt + 1,
                        attempts,
                        err,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Err(err) => {
                    warn!("classification failed ({}), using local fallback", err);
                    return self.local_fallback(text);
                }
            }
        }

        self.local_fallback(text)
    }
}
