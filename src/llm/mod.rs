//! LLM classification layer.
//!
//! `LlmClient` wraps the external chat-completion service behind the
//! `Classifier` trait; `rate_limit` keeps the process inside the service's
//! request budget and `keyword` provides the deterministic local fallback.

pub mod client;
pub mod keyword;
pub mod rate_limit;

use async_trait::async_trait;

use crate::models::Classification;

pub use client::{LlmClient, LlmConfig, LlmError};
pub use keyword::extract_keyword;
pub use rate_limit::{RateLimiter, RateLimiterStats};

/// Anything that can classify an utterance.
///
/// Implementations never fail: when the backing service is unusable they
/// resolve through a local fallback and mark the result accordingly. This is
/// the seam the chunk workers are written against.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Classification;
}
