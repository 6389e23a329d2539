//! Chunk worker behavior against scripted classifiers.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio_util::sync::CancellationToken;

use keyword_batch::llm::Classifier;
use keyword_batch::models::{Classification, Utterance};
use keyword_batch::services::batch::classify_chunk;

fn utterance(text: &str, date: &str, occurrences: i64) -> Utterance {
    Utterance {
        text: text.to_string(),
        observed_on: date.parse().unwrap(),
        occurrences,
    }
}

fn stamp() -> NaiveDateTime {
    "2025-06-12T04:00:00".parse().unwrap()
}

/// Always returns the same category with a fixed keyword prefix.
struct ScriptedClassifier {
    category_id: i32,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, text: &str) -> Classification {
        Classification {
            keyword: text.chars().take(10).collect(),
            category_id: self.category_id,
            via_fallback: false,
        }
    }
}

/// Echoes the full utterance back as the keyword, like a lazy model.
struct EchoClassifier;

#[async_trait]
impl Classifier for EchoClassifier {
    async fn classify(&self, text: &str) -> Classification {
        Classification {
            keyword: text.to_string(),
            category_id: 3,
            via_fallback: false,
        }
    }
}

/// Simulates a dead service: local fallback every time.
struct DownClassifier;

#[async_trait]
impl Classifier for DownClassifier {
    async fn classify(&self, text: &str) -> Classification {
        Classification {
            keyword: text.chars().take(5).collect(),
            category_id: 11,
            via_fallback: true,
        }
    }
}

#[tokio::test]
async fn chunk_produces_one_record_per_utterance() {
    let classifier = ScriptedClassifier { category_id: 3 };
    let chunk = vec![
        utterance("수강신청 언제?", "2025-06-11", 3),
        utterance("전학 문의", "2025-06-11", 1),
    ];

    let (records, counters) =
        classify_chunk(&classifier, chunk, stamp(), &CancellationToken::new()).await;

    assert_eq!(records.len(), 2);
    assert_eq!(counters.extracted, 2);
    assert_eq!(counters.classified, 2);
    assert_eq!(counters.llm_fallbacks, 0);

    assert_eq!(records[0].query_text, "수강신청 언제?");
    assert_eq!(records[0].query_count, 3);
    assert_eq!(
        records[0].created_at,
        "2025-06-11".parse::<NaiveDate>().unwrap()
    );
    assert_eq!(records[0].batch_created_at, stamp());
    assert_eq!(records[1].batch_created_at, stamp());
    assert_eq!(counters.category_distribution[&3], 2);
}

#[tokio::test]
async fn overlong_keyword_is_replaced_with_extracted_one() {
    // A 300-char utterance echoed back verbatim as the keyword.
    let text = format!("수강신청 {}", "가".repeat(295));
    let chunk = vec![utterance(&text, "2025-06-11", 1)];

    let (records, counters) =
        classify_chunk(&EchoClassifier, chunk, stamp(), &CancellationToken::new()).await;

    assert_eq!(counters.classified, 1);
    let keyword = &records[0].keyword;
    assert!(!keyword.is_empty());
    assert!(keyword.chars().count() <= 100);
    assert_eq!(keyword, "수강신청");
}

#[tokio::test]
async fn short_echoed_keyword_is_kept() {
    // Echo of a short utterance stays within bounds; the worker does not
    // second-guess it.
    let chunk = vec![utterance("전학 문의", "2025-06-11", 1)];
    let (records, _) =
        classify_chunk(&EchoClassifier, chunk, stamp(), &CancellationToken::new()).await;
    assert_eq!(records[0].keyword, "전학 문의");
}

#[tokio::test]
async fn fallback_classifications_are_counted() {
    let chunk = vec![
        utterance("질문 하나", "2025-06-11", 1),
        utterance("질문 둘", "2025-06-11", 2),
    ];

    let (records, counters) =
        classify_chunk(&DownClassifier, chunk, stamp(), &CancellationToken::new()).await;

    assert_eq!(records.len(), 2);
    assert_eq!(counters.llm_fallbacks, 2);
    assert!(records.iter().all(|r| r.category_id == 11));
}

#[tokio::test]
async fn cancelled_chunk_stops_before_classifying() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let chunk = vec![
        utterance("질문 하나", "2025-06-11", 1),
        utterance("질문 둘", "2025-06-11", 1),
    ];
    let classifier = ScriptedClassifier { category_id: 3 };

    let (records, counters) = classify_chunk(&classifier, chunk, stamp(), &cancel).await;

    // The chunk was pulled from the stream but no work was done on it.
    assert!(records.is_empty());
    assert_eq!(counters.extracted, 2);
    assert_eq!(counters.classified, 0);
}

#[tokio::test]
async fn empty_chunk_is_a_no_op() {
    let classifier = ScriptedClassifier { category_id: 3 };
    let (records, counters) =
        classify_chunk(&classifier, Vec::new(), stamp(), &CancellationToken::new()).await;
    assert!(records.is_empty());
    assert_eq!(counters.extracted, 0);
    assert_eq!(counters.classified, 0);
}
