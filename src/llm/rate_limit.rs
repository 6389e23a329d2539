//! Process-wide request rate limiting for the LLM.
//!
//! One bucket is shared by every caller in the process: a per-minute request
//! budget plus a minimum gap between consecutive requests. State lives
//! behind a single short-lived lock; waiting always happens outside it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BucketState {
    window_start: Instant,
    issued_in_window: u32,
    last_request: Option<Instant>,
    total_requests: u64,
}

/// Snapshot of limiter activity for run reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub issued_in_window: u32,
}

/// Token bucket shared across all LLM callers.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_minute: u32,
    min_interval: Duration,
    state: Arc<Mutex<BucketState>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32, min_interval: Duration) -> Self {
        Self {
            max_per_minute: max_per_minute.max(1),
            min_interval,
            state: Arc::new(Mutex::new(BucketState {
                window_start: Instant::now(),
                issued_in_window: 0,
                last_request: None,
                total_requests: 0,
            })),
        }
    }

    /// Block until a request may be issued, then consume one permit.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                if now.duration_since(state.window_start) >= WINDOW {
                    state.window_start = now;
                    state.issued_in_window = 0;
                }

                if state.issued_in_window >= self.max_per_minute {
                    WINDOW - now.duration_since(state.window_start)
                } else {
                    let gap = state
                        .last_request
                        .map(|last| now.duration_since(last))
                        .unwrap_or(self.min_interval);
                    if gap < self.min_interval {
                        self.min_interval - gap
                    } else {
                        state.issued_in_window += 1;
                        state.last_request = Some(now);
                        state.total_requests += 1;
                        return;
                    }
                }
            };

            debug!("rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        RateLimiterStats {
            total_requests: state.total_requests,
            issued_in_window: state.issued_in_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_minimum_gap_between_requests() {
        let limiter = RateLimiter::new(100, Duration::from_secs(1));

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Two gaps of one second each under the paused clock.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(limiter.stats().await.total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_budget_blocks_until_window_rolls() {
        let limiter = RateLimiter::new(2, Duration::ZERO);

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));

        // Third request must wait out the remainder of the minute.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_shared_across_clones() {
        let limiter = RateLimiter::new(2, Duration::ZERO);
        let clone = limiter.clone();

        limiter.acquire().await;
        clone.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(clone.stats().await.total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new(30, Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
