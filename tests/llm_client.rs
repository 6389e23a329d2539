//! LLM client behavior against a scripted HTTP server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keyword_batch::llm::{Classifier, LlmClient, LlmConfig};
use keyword_batch::models::CategoryCatalog;

fn catalog() -> Arc<CategoryCatalog> {
    let mut map = BTreeMap::new();
    map.insert(3, "학생 생활".to_string());
    map.insert(5, "전학, 편입".to_string());
    map.insert(11, "기타".to_string());
    Arc::new(CategoryCatalog::new(map, 11).unwrap())
}

fn config(server: &MockServer) -> LlmConfig {
    LlmConfig {
        api_key: "test-key".to_string(),
        endpoint: server.uri(),
        model: "test-model".to_string(),
        max_requests_per_minute: 600,
        min_request_interval: 0.0,
        max_retries: 3,
        base_delay: 0.1,
        max_delay: 1.0,
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn successful_classification_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"keyword": "수강신청", "category_id": 3})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify("수강신청 언제 해요?").await;

    assert_eq!(result.keyword, "수강신청");
    assert_eq!(result.category_id, 3);
    assert!(!result.via_fallback);
}

#[tokio::test]
async fn two_rate_limits_then_success_recovers_without_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"keyword": "전학", "category_id": 5})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let started = Instant::now();
    let result = client.classify("전학 가고 싶어요").await;

    assert_eq!(result.keyword, "전학");
    assert_eq!(result.category_id, 5);
    assert!(!result.via_fallback);
    // Full jitter draws each backoff uniformly below the capped exponential
    // (0.1s then 0.2s here), so only the upper bound is deterministic; the
    // mock expectations above pin the two retries themselves.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn persistent_server_errors_resolve_via_local_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify("수강신청 방법 알려주세요").await;

    assert!(result.via_fallback);
    assert_eq!(result.keyword, "수강신청");
    assert_eq!(result.category_id, 11);
}

#[tokio::test]
async fn malformed_body_retries_then_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .expect(3)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify("장학금 신청").await;

    assert!(result.via_fallback);
    assert_eq!(result.keyword, "장학금");
    assert_eq!(result.category_id, 11);
}

#[tokio::test]
async fn empty_keyword_is_treated_as_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"keyword": "  ", "category_id": 3})),
        )
        .expect(3)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify("증명서 발급").await;

    assert!(result.via_fallback);
    assert_eq!(result.keyword, "증명서");
}

#[tokio::test]
async fn client_rejection_falls_back_without_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify("검정고시 접수").await;

    assert!(result.via_fallback);
    assert_eq!(result.keyword, "검정고시");
    assert_eq!(result.category_id, 11);
}

#[tokio::test]
async fn unknown_category_is_remapped_to_fallback_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"keyword": "휴학", "category_id": 42})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify("휴학 신청은 어디서 하나요").await;

    assert_eq!(result.category_id, 11);
    assert!(!result.via_fallback);
}

#[tokio::test]
async fn echoed_keyword_is_replaced_locally() {
    let text = "전학 절차가 너무 복잡해서 어디부터 시작해야 할지 모르겠어요";
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/test-model"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"keyword": text, "category_id": 5})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = LlmClient::new(config(&server), catalog());
    let result = client.classify(text).await;

    assert_eq!(result.keyword, "전학");
    assert_eq!(result.category_id, 5);
    assert!(!result.via_fallback);
}
