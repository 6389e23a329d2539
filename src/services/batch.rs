//! Batch classification over a date range.
//!
//! One date runs as: stream distinct utterances out of the store, cut the
//! stream into chunks, classify each chunk on a bounded pool of workers and
//! flush every chunk the moment it is full. Dates themselves run on a second
//! bounded pool. Nothing ever materializes a whole day in memory: the
//! extraction stream blocks when the workers are saturated.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate, NaiveDateTime};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{BatchError, StoreError};
use crate::llm::{extract_keyword, Classifier};
use crate::models::{CategoryCatalog, KeywordRecord, Utterance};
use crate::queries::BatchQueries;
use crate::repository::KeywordRepository;
use crate::utils::{date_range, day_end, day_start};

/// Keyword column width, enforced again at the worker level.
const MAX_KEYWORD_CHARS: usize = 100;

/// Soft per-date duration ceiling. Exceeding it is only logged; slow days
/// happen whenever the rate budget is the bottleneck.
const DATE_SOFT_CEILING: Duration = Duration::from_secs(300);

/// Progress events emitted while a run executes.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// Run started; how many dates it covers.
    Started { total_dates: usize },
    /// One date began processing.
    DateStarted { date: NaiveDate },
    /// A worker flushed a chunk.
    ChunkFlushed {
        inserted: u64,
        skipped: u64,
        failed: u64,
    },
    /// One date finished (successfully or not).
    DateCompleted { summary: DateSummary },
    /// The whole run finished.
    Complete { succeeded: usize, failed: usize },
}

/// Terminal state of one date pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateStatus {
    Succeeded,
    Failed,
}

impl DateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Counters accumulated by workers and merged upwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub extracted: u64,
    pub classified: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed_insert: u64,
    pub llm_fallbacks: u64,
    pub category_distribution: BTreeMap<i32, u64>,
}

impl RunCounters {
    pub fn absorb(&mut self, other: &RunCounters) {
        self.extracted += other.extracted;
        self.classified += other.classified;
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed_insert += other.failed_insert;
        self.llm_fallbacks += other.llm_fallbacks;
        for (category, count) in &other.category_distribution {
            *self.category_distribution.entry(*category).or_insert(0) += count;
        }
    }
}

/// Result of one date pipeline.
#[derive(Debug, Clone)]
pub struct DateSummary {
    pub date: NaiveDate,
    pub status: DateStatus,
    pub counters: RunCounters,
    pub error: Option<String>,
}

/// Result of a whole batch run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub counters: RunCounters,
    pub dates: Vec<DateSummary>,
    pub duration: Duration,
}

impl RunSummary {
    /// A run succeeded when nothing was lost: every date completed and no
    /// record failed to insert.
    pub fn is_success(&self) -> bool {
        self.counters.failed_insert == 0
            && self.dates.iter().all(|d| d.status == DateStatus::Succeeded)
    }

    pub fn failed_dates(&self) -> Vec<NaiveDate> {
        self.dates
            .iter()
            .filter(|d| d.status == DateStatus::Failed)
            .map(|d| d.date)
            .collect()
    }
}

/// Classify one chunk of utterances into insert-ready records.
///
/// Calls within the chunk are sequential: the shared rate bucket is the
/// throughput floor anyway, and serial calls keep lock traffic down.
/// Cancellation is observed between calls; records already classified are
/// kept so the following flush can complete.
pub async fn classify_chunk(
    classifier: &dyn Classifier,
    chunk: Vec<Utterance>,
    batch_created_at: NaiveDateTime,
    cancel: &CancellationToken,
) -> (Vec<KeywordRecord>, RunCounters) {
    let mut counters = RunCounters {
        extracted: chunk.len() as u64,
        ..RunCounters::default()
    };
    let mut records = Vec::with_capacity(chunk.len());

    for utterance in chunk {
        if cancel.is_cancelled() {
            debug!("chunk classification cancelled after {} records", records.len());
            break;
        }

        let mut classification = classifier.classify(&utterance.text).await;
        if classification.via_fallback {
            counters.llm_fallbacks += 1;
        }

        // Worker-level guard; the client normally bounds this already.
        if classification.keyword.chars().count() > MAX_KEYWORD_CHARS {
            classification.keyword = extract_keyword(&utterance.text);
        }

        *counters
            .category_distribution
            .entry(classification.category_id)
            .or_insert(0) += 1;
        counters.classified += 1;
        records.push(KeywordRecord::assemble(
            utterance,
            classification,
            batch_created_at,
        ));
    }

    (records, counters)
}

/// Drives classification runs over date ranges.
pub struct BatchService {
    pub(crate) repo: KeywordRepository,
    pub(crate) classifier: Arc<dyn Classifier>,
    pub(crate) catalog: Arc<CategoryCatalog>,
    pub(crate) queries: BatchQueries,
    pub(crate) pipeline: PipelineConfig,
    pub(crate) cancel: CancellationToken,
}

impl BatchService {
    pub fn new(
        repo: KeywordRepository,
        classifier: Arc<dyn Classifier>,
        catalog: Arc<CategoryCatalog>,
        queries: BatchQueries,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            repo,
            classifier,
            catalog,
            queries,
            pipeline,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token; a cancel stops new work
    /// while in-progress flushes complete, so counters stay accurate.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Classify every distinct utterance in the inclusive date range.
    ///
    /// `concurrent_dates` and `workers` override the configured fan-out for
    /// this run only. A failing date is recorded in the summary and does not
    /// stop the other dates.
    pub async fn run_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        concurrent_dates: Option<usize>,
        workers: Option<usize>,
        events: mpsc::Sender<BatchEvent>,
    ) -> Result<RunSummary, BatchError> {
        if start > end {
            return Err(BatchError::InvalidRange { start, end });
        }

        let dates = date_range(start, end);
        let date_parallelism = concurrent_dates
            .unwrap_or(self.pipeline.concurrent_dates)
            .max(1);
        let workers = workers.unwrap_or(self.pipeline.workers_per_date).max(1);

        // Stamped once; every record of this run shares it so the insert key
        // (text, DATE(batch_created_at)) is stable across workers.
        let batch_created_at = Local::now().naive_local();
        let started = Instant::now();

        info!(
            "batch run {} .. {}: {} dates, {} concurrent, {} workers/date",
            start,
            end,
            dates.len(),
            date_parallelism,
            workers
        );
        let _ = events
            .send(BatchEvent::Started {
                total_dates: dates.len(),
            })
            .await;

        let mut summaries: Vec<DateSummary> = futures::stream::iter(dates)
            .map(|date| self.run_date(date, workers, batch_created_at, events.clone()))
            .buffer_unordered(date_parallelism)
            .collect()
            .await;
        summaries.sort_by_key(|s| s.date);

        let mut counters = RunCounters::default();
        for summary in &summaries {
            counters.absorb(&summary.counters);
        }

        let succeeded = summaries
            .iter()
            .filter(|s| s.status == DateStatus::Succeeded)
            .count();
        let failed = summaries.len() - succeeded;
        let _ = events
            .send(BatchEvent::Complete { succeeded, failed })
            .await;

        info!(
            "batch run finished: {} classified, {} inserted, {} skipped, {} failed inserts, {} fallbacks",
            counters.classified,
            counters.inserted,
            counters.skipped,
            counters.failed_insert,
            counters.llm_fallbacks
        );

        Ok(RunSummary {
            start,
            end,
            counters,
            dates: summaries,
            duration: started.elapsed(),
        })
    }

    /// Run the pipeline for a single date. Extraction failures fail the
    /// date; insert failures are counted and the date carries on.
    async fn run_date(
        &self,
        date: NaiveDate,
        workers: usize,
        batch_created_at: NaiveDateTime,
        events: mpsc::Sender<BatchEvent>,
    ) -> DateSummary {
        let _ = events.send(BatchEvent::DateStarted { date }).await;
        debug!("date {} extracting", date);
        let date_started = Instant::now();

        let stream = self.repo.stream_utterances(
            self.queries.unique_utterances(),
            vec![day_start(date), day_end(date)],
        );

        let (counters, error) = self
            .drive_chunks(stream, workers, batch_created_at, &events)
            .await;
        let error = error.map(|e| e.to_string());

        if date_started.elapsed() > DATE_SOFT_CEILING {
            warn!(
                "date {} took {:?}, over the {:?} soft ceiling",
                date,
                date_started.elapsed(),
                DATE_SOFT_CEILING
            );
        }

        let status = if error.is_some() {
            DateStatus::Failed
        } else {
            DateStatus::Succeeded
        };
        if let Some(ref err) = error {
            warn!("date {} failed: {}", date, err);
        } else {
            debug!(
                "date {} done: {} extracted, {} inserted, {} skipped",
                date, counters.extracted, counters.inserted, counters.skipped
            );
        }

        let summary = DateSummary {
            date,
            status,
            counters,
            error,
        };
        let _ = events
            .send(BatchEvent::DateCompleted {
                summary: summary.clone(),
            })
            .await;
        summary
    }

    /// Chunk an utterance stream and fan the chunks out to workers.
    ///
    /// `buffer_unordered` only polls the chunking stream when a worker slot
    /// is free, so extraction cannot outrun classification. Returns merged
    /// counters plus the first extraction error, if any.
    pub(crate) async fn drive_chunks<S>(
        &self,
        stream: S,
        workers: usize,
        batch_created_at: NaiveDateTime,
        events: &mpsc::Sender<BatchEvent>,
    ) -> (RunCounters, Option<StoreError>)
    where
        S: futures::Stream<Item = Result<Utterance, StoreError>> + Send,
    {
        let results: Vec<Result<RunCounters, StoreError>> = stream
            .try_chunks(self.pipeline.chunk_size)
            .map(|chunk| async move {
                match chunk {
                    Ok(utterances) => Ok(self
                        .process_chunk(utterances, batch_created_at, events)
                        .await),
                    Err(err) => Err(err.1),
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;

        let mut counters = RunCounters::default();
        let mut error = None;
        for result in results {
            match result {
                Ok(chunk_counters) => counters.absorb(&chunk_counters),
                Err(err) => {
                    if error.is_none() {
                        error = Some(err);
                    }
                }
            }
        }
        (counters, error)
    }

    /// One chunk worker: classify, then flush the buffer in a single call
    /// and release it immediately.
    async fn process_chunk(
        &self,
        chunk: Vec<Utterance>,
        batch_created_at: NaiveDateTime,
        events: &mpsc::Sender<BatchEvent>,
    ) -> RunCounters {
        let (records, mut counters) = classify_chunk(
            self.classifier.as_ref(),
            chunk,
            batch_created_at,
            &self.cancel,
        )
        .await;

        if records.is_empty() {
            return counters;
        }

        let report = self
            .repo
            .insert_batch(&self.queries, &records, &self.catalog)
            .await;
        counters.inserted = report.inserted;
        counters.skipped = report.skipped;
        counters.failed_insert = report.failed;

        let _ = events
            .send(BatchEvent::ChunkFlushed {
                inserted: report.inserted,
                skipped: report.skipped,
                failed: report.failed,
            })
            .await;

        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_absorb_merges_distribution() {
        let mut a = RunCounters {
            extracted: 10,
            classified: 10,
            inserted: 8,
            skipped: 2,
            ..RunCounters::default()
        };
        a.category_distribution.insert(1, 4);
        a.category_distribution.insert(2, 6);

        let mut b = RunCounters {
            extracted: 5,
            classified: 5,
            inserted: 5,
            llm_fallbacks: 1,
            ..RunCounters::default()
        };
        b.category_distribution.insert(2, 3);
        b.category_distribution.insert(11, 2);

        a.absorb(&b);
        assert_eq!(a.extracted, 15);
        assert_eq!(a.inserted, 13);
        assert_eq!(a.llm_fallbacks, 1);
        assert_eq!(a.category_distribution[&1], 4);
        assert_eq!(a.category_distribution[&2], 9);
        assert_eq!(a.category_distribution[&11], 2);
    }

    #[test]
    fn test_run_success_requires_clean_dates_and_inserts() {
        let date: NaiveDate = "2025-06-11".parse().unwrap();
        let clean = DateSummary {
            date,
            status: DateStatus::Succeeded,
            counters: RunCounters::default(),
            error: None,
        };
        let failed = DateSummary {
            date: "2025-06-12".parse().unwrap(),
            status: DateStatus::Failed,
            counters: RunCounters::default(),
            error: Some("extraction failed".to_string()),
        };

        let ok = RunSummary {
            start: date,
            end: date,
            counters: RunCounters::default(),
            dates: vec![clean.clone()],
            duration: Duration::from_secs(1),
        };
        assert!(ok.is_success());

        let partial = RunSummary {
            start: date,
            end: "2025-06-12".parse().unwrap(),
            counters: RunCounters::default(),
            dates: vec![clean.clone(), failed],
            duration: Duration::from_secs(1),
        };
        assert!(!partial.is_success());
        assert_eq!(partial.failed_dates(), vec!["2025-06-12".parse::<NaiveDate>().unwrap()]);

        let lossy = RunSummary {
            start: date,
            end: date,
            counters: RunCounters {
                failed_insert: 1,
                ..RunCounters::default()
            },
            dates: vec![clean],
            duration: Duration::from_secs(1),
        };
        assert!(!lossy.is_success());
    }
}
