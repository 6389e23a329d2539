//! Store gateway: pool management, streaming reads and idempotent inserts.
//!
//! Reads are streamed through a bounded channel so a large day never sits in
//! memory; the producer blocks when the workers fall behind. Inserts go out
//! in batches with a per-row fallback so one bad record cannot sink a run.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::config::{PipelineConfig, StoreConfig};
use crate::error::{BatchError, StoreError};
use crate::models::{CategoryCatalog, KeywordRecord, Utterance};
use crate::queries::BatchQueries;

/// Characters kept when the pre-insert guard truncates a keyword; an
/// ellipsis is appended on top.
const GUARD_TRUNCATE_CHARS: usize = 98;

/// Keyword column width.
const MAX_KEYWORD_CHARS: usize = 100;

/// Outcome of flushing a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl InsertReport {
    pub fn absorb(&mut self, other: InsertReport) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Gateway to the chat store and the derived keyword table.
#[derive(Clone)]
pub struct KeywordRepository {
    pool: MySqlPool,
    insert_batch_size: usize,
    stream_buffer: usize,
}

impl KeywordRepository {
    /// Connect a pool sized for the configured fan-out.
    pub async fn connect(
        store: &StoreConfig,
        pipeline: &PipelineConfig,
    ) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(store.pool_size + store.max_overflow)
            .acquire_timeout(Duration::from_secs(store.acquire_timeout_secs))
            .max_lifetime(Duration::from_secs(store.recycle_secs))
            .connect(&store.url)
            .await?;

        Ok(Self {
            pool,
            insert_batch_size: pipeline.insert_batch_size.max(1),
            stream_buffer: (pipeline.chunk_size * pipeline.workers_per_date).max(1),
        })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Load the category catalog. Fatal when the table is empty or the
    /// fallback id is unknown; the pipeline cannot start without it.
    pub async fn load_categories(
        &self,
        queries: &BatchQueries,
        fallback_id: i32,
    ) -> Result<CategoryCatalog, BatchError> {
        let rows = sqlx::query(&queries.categories())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;

        let mut categories = BTreeMap::new();
        for row in rows {
            let id: i32 = row.try_get(0).map_err(StoreError::from)?;
            let name: String = row.try_get(1).map_err(StoreError::from)?;
            categories.insert(id, name);
        }

        debug!("loaded {} categories", categories.len());
        Ok(CategoryCatalog::new(categories, fallback_id)?)
    }

    /// Stream utterance rows for a prepared extraction statement.
    ///
    /// Rows flow through a channel bounded by roughly one date's working set
    /// (chunk size x workers); the database read pauses when the consumer is
    /// saturated. The stream is finite and not restartable. The first error
    /// ends it.
    pub fn stream_utterances(
        &self,
        sql: String,
        binds: Vec<String>,
    ) -> ReceiverStream<Result<Utterance, StoreError>> {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }

            let mut rows = query.fetch(&pool);
            while let Some(row) = rows.next().await {
                let item = row
                    .map_err(StoreError::from)
                    .and_then(|row| utterance_from_row(&row));
                let is_err = item.is_err();
                if tx.send(item).await.is_err() {
                    // Consumer went away; stop reading.
                    break;
                }
                if is_err {
                    break;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Insert records idempotently, up to the configured batch size per
    /// round trip. A failed round trip falls back to row-by-row execution;
    /// rows that still fail are counted, never raised.
    pub async fn insert_batch(
        &self,
        queries: &BatchQueries,
        records: &[KeywordRecord],
        catalog: &CategoryCatalog,
    ) -> InsertReport {
        let mut report = InsertReport::default();

        for batch in records.chunks(self.insert_batch_size) {
            let guarded: Vec<KeywordRecord> =
                batch.iter().map(|r| guard_record(r, catalog)).collect();

            match self.execute_batch(queries, &guarded).await {
                Ok(inserted) => {
                    report.inserted += inserted;
                    report.skipped += guarded.len() as u64 - inserted;
                }
                Err(err) => {
                    warn!(
                        "batch insert of {} records failed ({}), retrying row by row",
                        guarded.len(),
                        err
                    );
                    report.absorb(self.insert_rows(queries, &guarded).await);
                }
            }
        }

        report
    }

    async fn execute_batch(
        &self,
        queries: &BatchQueries,
        records: &[KeywordRecord],
    ) -> Result<u64, StoreError> {
        let sql = queries.insert_keywords_batch(records.len());
        let mut query = sqlx::query(&sql);
        for record in records {
            query = query
                .bind(record.query_text.as_str())
                .bind(record.keyword.as_str())
                .bind(record.category_id)
                .bind(record.query_count)
                .bind(record.created_at)
                .bind(record.batch_created_at);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_rows(
        &self,
        queries: &BatchQueries,
        records: &[KeywordRecord],
    ) -> InsertReport {
        let sql = queries.insert_keyword();
        let mut report = InsertReport::default();

        for record in records {
            let result = sqlx::query(&sql)
                .bind(record.query_text.as_str())
                .bind(record.keyword.as_str())
                .bind(record.category_id)
                .bind(record.query_count)
                .bind(record.created_at)
                .bind(record.batch_created_at)
                .bind(record.query_text.as_str())
                .bind(record.created_at)
                .execute(&self.pool)
                .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => report.inserted += 1,
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    error!(
                        "insert failed for keyword '{}': {}",
                        record.keyword, err
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Distinct (text, date) pairs already present in the derived table.
    pub async fn count_classified(
        &self,
        queries: &BatchQueries,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(&queries.classified_count())
            .bind(crate::utils::day_start(start))
            .bind(crate::utils::day_end(end))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }
}

fn utterance_from_row(row: &sqlx::mysql::MySqlRow) -> Result<Utterance, StoreError> {
    Ok(Utterance {
        text: row.try_get("text")?,
        occurrences: row.try_get("occurrences")?,
        observed_on: row.try_get("observed_on")?,
    })
}

/// Last line of defense before a row reaches the database. The client and
/// the worker already bound the keyword and category, so a hit here is
/// logged as unexpected.
fn guard_record(record: &KeywordRecord, catalog: &CategoryCatalog) -> KeywordRecord {
    let mut guarded = record.clone();

    if guarded.keyword.chars().count() > MAX_KEYWORD_CHARS {
        warn!(
            "keyword exceeded {} chars at insert, truncating",
            MAX_KEYWORD_CHARS
        );
        let mut cut: String = guarded.keyword.chars().take(GUARD_TRUNCATE_CHARS).collect();
        cut.push('…');
        guarded.keyword = cut;
    }

    if !catalog.contains(guarded.category_id) {
        warn!(
            "unknown category id {} at insert, using fallback",
            guarded.category_id
        );
        guarded.category_id = catalog.fallback_id();
    }

    guarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use std::collections::BTreeMap;

    fn catalog() -> CategoryCatalog {
        let mut map = BTreeMap::new();
        map.insert(1, "학교폭력".to_string());
        map.insert(11, "기타".to_string());
        CategoryCatalog::new(map, 11).unwrap()
    }

    fn record(keyword: &str, category_id: i32) -> KeywordRecord {
        KeywordRecord {
            query_text: "질문".to_string(),
            keyword: keyword.to_string(),
            category_id,
            query_count: 1,
            created_at: "2025-06-11".parse().unwrap(),
            batch_created_at: "2025-06-12T04:00:00".parse::<NaiveDateTime>().unwrap(),
        }
    }

    #[test]
    fn test_guard_leaves_valid_records_alone() {
        let record = record("수강신청", 1);
        let guarded = guard_record(&record, &catalog());
        assert_eq!(guarded, record);
    }

    #[test]
    fn test_guard_truncates_overlong_keyword() {
        let record = record(&"가".repeat(130), 1);
        let guarded = guard_record(&record, &catalog());
        assert_eq!(guarded.keyword.chars().count(), GUARD_TRUNCATE_CHARS + 1);
        assert!(guarded.keyword.ends_with('…'));
    }

    #[test]
    fn test_guard_remaps_unknown_category() {
        let record = record("수강신청", 99);
        let guarded = guard_record(&record, &catalog());
        assert_eq!(guarded.category_id, 11);
    }

    #[test]
    fn test_insert_report_absorb() {
        let mut total = InsertReport::default();
        total.absorb(InsertReport {
            inserted: 3,
            skipped: 1,
            failed: 0,
        });
        total.absorb(InsertReport {
            inserted: 2,
            skipped: 0,
            failed: 4,
        });
        assert_eq!(
            total,
            InsertReport {
                inserted: 5,
                skipped: 1,
                failed: 4,
            }
        );
    }
}
