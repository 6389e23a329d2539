//! Missing-data reconciliation.
//!
//! Detects (text, date) pairs that exist in the chat store but have no row
//! in the derived table, and pushes them through the same chunk workers the
//! normal batch uses. The missing set is never materialized: the anti-join
//! stream flows straight into the bounded worker pool.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::BatchError;
use crate::services::batch::{BatchEvent, BatchService, RunCounters};
use crate::utils::{day_end, day_start};

/// What `check` finds in a range.
#[derive(Debug, Clone, Default)]
pub struct MissingReport {
    /// Missing distinct utterances per date.
    pub per_date: BTreeMap<NaiveDate, u64>,
    pub total_missing: u64,
    /// Distinct (text, date) pairs already classified in the range.
    pub total_processed: u64,
}

/// Result of a reconciliation `process` run.
#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub limit: Option<usize>,
    pub counters: RunCounters,
    /// Missing count measured again after processing. Reported, not
    /// retried.
    pub missing_after: u64,
    pub duration: Duration,
}

/// Result of `auto`: the pre-run report plus the processing summary.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub before: MissingReport,
    pub summary: ReconcileSummary,
}

impl BatchService {
    /// Count missing utterances per date in the inclusive range. Pure read;
    /// streams the anti-join so the missing set never sits in memory.
    pub async fn check_missing(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MissingReport, BatchError> {
        if start > end {
            return Err(BatchError::InvalidRange { start, end });
        }

        let mut stream = self.repo.stream_utterances(
            self.queries.missing_utterances(),
            missing_binds(start, end),
        );

        let mut per_date: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        let mut total_missing = 0u64;
        while let Some(row) = stream.next().await {
            let utterance = row.map_err(BatchError::from)?;
            *per_date.entry(utterance.observed_on).or_insert(0) += 1;
            total_missing += 1;
        }

        let total_processed = self
            .repo
            .count_classified(&self.queries, start, end)
            .await
            .map_err(BatchError::from)?;

        info!(
            "missing check {} .. {}: {} missing, {} processed",
            start, end, total_missing, total_processed
        );

        Ok(MissingReport {
            per_date,
            total_missing,
            total_processed,
        })
    }

    /// Re-classify utterances missing from the derived table, optionally
    /// capped at `limit` records, then measure what is still missing.
    pub async fn process_missing(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: Option<usize>,
        events: mpsc::Sender<BatchEvent>,
    ) -> Result<ReconcileSummary, BatchError> {
        if start > end {
            return Err(BatchError::InvalidRange { start, end });
        }

        let started = Instant::now();
        let batch_created_at = Local::now().naive_local();
        info!(
            "processing missing data {} .. {}{}",
            start,
            end,
            limit.map(|n| format!(" (limit {n})")).unwrap_or_default()
        );

        let stream = self.repo.stream_utterances(
            self.queries.missing_utterances(),
            missing_binds(start, end),
        );

        let workers = self.pipeline.workers_per_date;
        let (counters, error) = match limit {
            Some(n) => {
                self.drive_chunks(stream.take(n), workers, batch_created_at, &events)
                    .await
            }
            None => {
                self.drive_chunks(stream, workers, batch_created_at, &events)
                    .await
            }
        };

        if let Some(err) = error {
            // Extraction died mid-stream; whatever was flushed stays, but
            // the operation itself is a failure.
            return Err(BatchError::Store(err));
        }

        let after = self.check_missing(start, end).await?;
        if after.total_missing > 0 {
            warn!(
                "{} utterances still missing after reconciliation",
                after.total_missing
            );
        }

        Ok(ReconcileSummary {
            start,
            end,
            limit,
            counters,
            missing_after: after.total_missing,
            duration: started.elapsed(),
        })
    }

    /// Check, process, and report both sides.
    pub async fn auto_missing(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        limit: Option<usize>,
        events: mpsc::Sender<BatchEvent>,
    ) -> Result<ReconcileOutcome, BatchError> {
        let before = self.check_missing(start, end).await?;

        if before.total_missing == 0 {
            info!("no missing data in {} .. {}", start, end);
            return Ok(ReconcileOutcome {
                summary: ReconcileSummary {
                    start,
                    end,
                    limit,
                    counters: RunCounters::default(),
                    missing_after: 0,
                    duration: Duration::ZERO,
                },
                before,
            });
        }

        let summary = self.process_missing(start, end, limit, events).await?;
        Ok(ReconcileOutcome { before, summary })
    }
}

fn missing_binds(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    // Derived-table window first, then the chat window; both are the same
    // inclusive day bounds.
    vec![
        day_start(start),
        day_end(end),
        day_start(start),
        day_end(end),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binds_order_matches_statement() {
        let start: NaiveDate = "2025-06-11".parse().unwrap();
        let end: NaiveDate = "2025-06-12".parse().unwrap();
        assert_eq!(
            missing_binds(start, end),
            vec![
                "2025-06-11 00:00:00".to_string(),
                "2025-06-12 23:59:59".to_string(),
                "2025-06-11 00:00:00".to_string(),
                "2025-06-12 23:59:59".to_string(),
            ]
        );
    }
}
