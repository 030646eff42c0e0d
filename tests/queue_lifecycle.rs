//! Queue lifecycle: duplicate admission, dispatch through the worker pool,
//! and restart recovery over the persisted queue state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use newsflow::balance::{KeyPool, KeyPoolConfig};
use newsflow::cache::{commentary_key, ShardPool, TieredCache};
use newsflow::enrich::{AiClient, Enricher};
use newsflow::model::{Article, Section};
use newsflow::queue::{Admission, EnrichmentQueue, SubmitOptions};
use newsflow::store::Store;
use newsflow::Config;

fn article(id: &str) -> Article {
    Article {
        id: id.into(),
        title: format!("Article {id}"),
        summary: "Summary.".into(),
        url: format!("https://news.example.com/{id}"),
        published_date: Some(Utc::now()),
        byline: None,
        image_url: None,
        source: "topstories".into(),
        section: Section::Technology,
        keywords: BTreeSet::new(),
        ai_commentary: None,
        commentary_generated_at: None,
        commentary_source: None,
    }
}

async fn queue_over(
    ai: &MockServer,
    cache: Arc<TieredCache>,
    store: Arc<Store>,
) -> Arc<EnrichmentQueue> {
    let mut config = Config::default();
    config.ai_base_url = ai.uri();
    let pool = Arc::new(KeyPool::new(
        KeyPoolConfig {
            name: "ai",
            daily_limit: 100_000,
            safety_buffer: 1_000,
            reserved_quantum: 600,
        },
        vec![SecretString::from("ai-key")],
    ));
    let enricher = Arc::new(
        Enricher::new(cache.clone(), store.clone(), AiClient::new(&config, pool))
            .with_retry_backoff(Duration::from_millis(2)),
    );
    Arc::new(EnrichmentQueue::new(
        cache,
        store,
        enricher,
        Duration::from_millis(10),
    ))
}

async fn wait_for_completed(queue: &EnrichmentQueue, count: usize) -> bool {
    for _ in 0..300 {
        if queue.stats().await.completed >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Duplicate submission through a live dispatcher
// ============================================================================

#[tokio::test]
async fn test_duplicate_submission_processes_once() {
    let ai = MockServer::start().await;
    // Exactly one generation request may reach the provider; the mock
    // verifies the expectation when the server drops.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [ { "message": { "role": "assistant", "content": "Once" } } ],
            "usage": { "total_tokens": 100 },
        })))
        .expect(1)
        .mount(&ai)
        .await;

    let cache = Arc::new(TieredCache::new(Arc::new(ShardPool::memory_only())));
    let store = Arc::new(Store::in_memory().await.unwrap());
    let queue = queue_over(&ai, cache.clone(), store.clone()).await;

    let a = article("dup");
    assert!(matches!(
        queue.submit(a.clone(), SubmitOptions::default()).await.unwrap(),
        Admission::Enqueued { .. }
    ));
    assert_eq!(
        queue.submit(a.clone(), SubmitOptions::default()).await.unwrap(),
        Admission::Duplicate
    );
    assert_eq!(queue.stats().await.waiting, 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(queue.clone().run(shutdown_rx));
    assert!(wait_for_completed(&queue, 1).await, "job never completed");

    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();

    // Exactly one commentary write happened.
    assert_eq!(
        cache.get_text(&commentary_key("dup")).await.as_deref(),
        Some("Once")
    );
    let stats = queue.stats().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.waiting + stats.active + stats.delayed + stats.failed, 0);
}

// ============================================================================
// Resubmission after completion is AlreadyDone
// ============================================================================

#[tokio::test]
async fn test_resubmission_after_completion_is_already_done() {
    let ai = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [ { "message": { "role": "assistant", "content": "Done" } } ],
            "usage": { "total_tokens": 100 },
        })))
        .mount(&ai)
        .await;

    let cache = Arc::new(TieredCache::new(Arc::new(ShardPool::memory_only())));
    let store = Arc::new(Store::in_memory().await.unwrap());
    let queue = queue_over(&ai, cache.clone(), store.clone()).await;

    let a = article("once");
    store.upsert_by_url(&a).await.unwrap();
    queue.submit(a.clone(), SubmitOptions::default()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(queue.clone().run(shutdown_rx));
    assert!(wait_for_completed(&queue, 1).await);
    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();

    // The store now holds the commentary, so admission short-circuits.
    assert_eq!(
        queue.submit(a, SubmitOptions::default()).await.unwrap(),
        Admission::AlreadyDone
    );
}

// ============================================================================
// Restart recovery from persisted queue state
// ============================================================================

#[tokio::test]
async fn test_queue_state_survives_restart() {
    let ai = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [ { "message": { "role": "assistant", "content": "Recovered" } } ],
            "usage": { "total_tokens": 100 },
        })))
        .mount(&ai)
        .await;

    // The shard pool outlives the queue instance, like the remote cache
    // outlives a process.
    let cache = Arc::new(TieredCache::new(Arc::new(ShardPool::memory_only())));
    let store = Arc::new(Store::in_memory().await.unwrap());

    {
        let first_incarnation = queue_over(&ai, cache.clone(), store.clone()).await;
        first_incarnation
            .submit(article("survivor"), SubmitOptions::default())
            .await
            .unwrap();
        // Process dies here: no dispatcher ever ran.
    }

    let second_incarnation = queue_over(&ai, cache.clone(), store.clone()).await;
    assert_eq!(second_incarnation.restore().await, 1);
    assert_eq!(second_incarnation.stats().await.waiting, 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(second_incarnation.clone().run(shutdown_rx));
    assert!(wait_for_completed(&second_incarnation, 1).await);
    shutdown_tx.send(true).unwrap();
    runner.await.unwrap();

    assert_eq!(
        cache.get_text(&commentary_key("survivor")).await.as_deref(),
        Some("Recovered")
    );
}
