//! Application-level cache facade over the shard pool.
//!
//! Adds what the raw command set doesn't have: named TTL classes, read-through
//! `get_or_set` with per-key single-flight, glob invalidation, the capped FIFO
//! section lists, and the bounded "top-N" hot list.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::pool::ShardPool;
use crate::model::Section;

// ============================================================================
// TTL classes
// ============================================================================

/// Named TTL classes. Call sites say what a value *is*; the class says how
/// long it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// AI commentary text, one UTC day.
    Commentary,
    /// Read-through article snapshots.
    Article,
    /// Raw upstream publisher payloads.
    Upstream,
    /// Short-lived derived views.
    Short,
    /// Slow-moving reference data, one week.
    Long,
}

impl TtlClass {
    pub fn secs(&self) -> u64 {
        match self {
            TtlClass::Commentary => 86_400,
            TtlClass::Article => 300,
            TtlClass::Upstream => 1_800,
            TtlClass::Short => 60,
            TtlClass::Long => 604_800,
        }
    }
}

/// TTL the enrichment worker uses for full article snapshots; longer than the
/// read-through [`TtlClass::Article`] class because the worker's snapshots
/// are authoritative at write time.
pub const ARTICLE_SNAPSHOT_TTL_SECS: u64 = 1_800;

/// Outcome of one FIFO maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoOutcome {
    pub added: usize,
    pub removed: usize,
}

// ============================================================================
// Key helpers
// ============================================================================

pub fn commentary_key(article_id: &str) -> String {
    format!("commentary:{article_id}")
}

pub fn article_key(article_id: &str) -> String {
    format!("article:{article_id}")
}

pub fn section_list_key(section: Section) -> String {
    format!("section:{section}:articles")
}

/// Derived per-section views (rendered lists, API payloads). These are the
/// caches invalidated after a fetch batch; the canonical `:articles` FIFO is
/// maintained incrementally and never pattern-wiped.
pub fn section_view_pattern(section: Section) -> String {
    format!("section:{section}:view:*")
}

pub const HOMEPAGE_LIST_KEY: &str = "homepage:top20";
pub const HOMEPAGE_LIST_MAX: usize = 20;

// ============================================================================
// TieredCache
// ============================================================================

pub struct TieredCache {
    pool: Arc<ShardPool>,
    /// Per-key single-flight locks for `get_or_set`.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TieredCache {
    pub fn new(pool: Arc<ShardPool>) -> Self {
        Self {
            pool,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ShardPool> {
        &self.pool
    }

    // ========================================================================
    // Plain reads and writes
    // ========================================================================

    pub async fn get_text(&self, key: &str) -> Option<String> {
        self.pool.get(key).await
    }

    pub async fn set_text(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        self.pool.setex(key, ttl_secs, value).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.pool.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                // Best-effort decode: a corrupt entry is a miss, not an error.
                tracing::debug!(key = key, error = %e, "Cached value failed to decode, treating as miss");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.pool.setex(key, ttl_secs, &raw).await,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Failed to encode value for cache");
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.pool.exists(key).await
    }

    // ========================================================================
    // Read-through
    // ========================================================================

    /// Return the cached text under `key`, or produce it with `fetch`, store
    /// it with the class TTL, and return it.
    ///
    /// Per-key single-flight: concurrent callers for the same absent key run
    /// `fetch` exactly once; the rest wait and read the stored value. A fetch
    /// error propagates untouched — a cache-layer failure never masks it.
    pub async fn get_or_set_text<E, F, Fut>(
        &self,
        key: &str,
        class: TtlClass,
        fetch: F,
    ) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(cached) = self.get_text(key).await {
            return Ok(cached);
        }

        let lock = self.inflight_lock(key).await;
        let _guard = lock.lock().await;

        // Re-check: a concurrent caller may have filled the key while this
        // one waited on the flight lock.
        if let Some(cached) = self.get_text(key).await {
            self.release_inflight(key).await;
            return Ok(cached);
        }

        let result = fetch().await;
        match &result {
            Ok(value) => {
                if !self.set_text(key, value, class.secs()).await {
                    tracing::warn!(key = key, "Cache store after fetch failed, serving fetched value anyway");
                }
            }
            Err(_) => {}
        }
        self.release_inflight(key).await;
        result
    }

    /// JSON variant of [`Self::get_or_set_text`].
    pub async fn get_or_set_json<T, E, F, Fut>(
        &self,
        key: &str,
        class: TtlClass,
        fetch: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get_json(key).await {
            return Ok(cached);
        }

        let lock = self.inflight_lock(key).await;
        let _guard = lock.lock().await;

        if let Some(cached) = self.get_json(key).await {
            self.release_inflight(key).await;
            return Ok(cached);
        }

        let result = fetch().await;
        if let Ok(value) = &result {
            if !self.set_json(key, value, class.secs()).await {
                tracing::warn!(key = key, "Cache store after fetch failed, serving fetched value anyway");
            }
        }
        self.release_inflight(key).await;
        result
    }

    async fn inflight_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_inflight(&self, key: &str) {
        let mut inflight = self.inflight.lock().await;
        inflight.remove(key);
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Delete all keys matching each glob pattern. Returns the delete count.
    pub async fn invalidate(&self, patterns: &[&str]) -> usize {
        let mut removed = 0usize;
        for pattern in patterns {
            let keys = self.pool.keys(pattern).await;
            if keys.is_empty() {
                continue;
            }
            removed += self.pool.del(&keys).await as usize;
        }
        if removed > 0 {
            tracing::debug!(patterns = ?patterns, removed = removed, "Invalidated cache keys");
        }
        removed
    }

    // ========================================================================
    // Lists
    // ========================================================================

    /// Left-push ids onto a hot list and trim it to `max_len`. Newest first.
    pub async fn push_to_list(&self, list_key: &str, ids: &[String], max_len: usize) {
        if ids.is_empty() {
            return;
        }
        self.pool.lpush(list_key, ids).await;
        self.pool.ltrim(list_key, 0, max_len as i64 - 1).await;
    }

    /// Append newly published ids to a section's FIFO list, evicting from the
    /// head once the list exceeds `max_articles` — and deleting the evicted
    /// ids' companion `article:{id}` snapshots in the same pass, so the list
    /// and the per-article keys stay in lock-step.
    ///
    /// Ids already present in the list are skipped; republication (catch-up
    /// after the gate opens, restarts over a persisted list) is a no-op.
    pub async fn manage_section_fifo(
        &self,
        section: Section,
        new_ids: &[String],
        max_articles: usize,
    ) -> FifoOutcome {
        let list_key = section_list_key(section);
        let current = self.pool.lrange(&list_key, 0, -1).await;
        let new_ids: Vec<String> = new_ids
            .iter()
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect();
        if new_ids.is_empty() {
            return FifoOutcome {
                added: 0,
                removed: 0,
            };
        }
        self.pool.rpush(&list_key, &new_ids).await;

        let len = self.pool.llen(&list_key).await;
        let excess = len - max_articles as i64;
        if excess <= 0 {
            return FifoOutcome {
                added: new_ids.len(),
                removed: 0,
            };
        }

        let evicted = self.pool.lrange(&list_key, 0, excess - 1).await;
        self.pool.ltrim(&list_key, excess, -1).await;

        let companion_keys: Vec<String> = evicted.iter().map(|id| article_key(id)).collect();
        self.pool.del(&companion_keys).await;

        tracing::debug!(
            section = %section,
            added = new_ids.len(),
            evicted = evicted.len(),
            "Section FIFO trimmed"
        );
        FifoOutcome {
            added: new_ids.len(),
            removed: evicted.len(),
        }
    }

    /// The last `count` ids of a section list, newest first.
    pub async fn section_articles(&self, section: Section, count: usize) -> Vec<String> {
        let list_key = section_list_key(section);
        let mut ids = self.pool.lrange(&list_key, -(count as i64), -1).await;
        ids.reverse();
        ids
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> TieredCache {
        TieredCache::new(Arc::new(ShardPool::memory_only()))
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_get_or_set_fetches_on_miss_then_hits() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<String, Infallible> = cache
                .get_or_set_text("k", TtlClass::Short, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok("fetched".to_string()) }
                })
                .await;
            assert_eq!(value.unwrap(), "fetched");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_single_flight_under_concurrency() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let value: Result<String, Infallible> = cache
                    .get_or_set_text("shared", TtlClass::Short, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            // Let the other callers pile up on the flight lock.
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok("value".to_string())
                        }
                    })
                    .await;
                value.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_set_propagates_fetch_error() {
        let cache = cache();
        let result: Result<String, &str> = cache
            .get_or_set_text("k", TtlClass::Short, || async { Err("upstream broke") })
            .await;
        assert_eq!(result.unwrap_err(), "upstream broke");
        // Nothing was cached.
        assert!(cache.get_text("k").await.is_none());
    }

    #[tokio::test]
    async fn test_get_or_set_json_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Payload {
            n: u32,
        }

        let cache = cache();
        let first: Result<Payload, Infallible> = cache
            .get_or_set_json("p", TtlClass::Short, || async { Ok(Payload { n: 7 }) })
            .await;
        assert_eq!(first.unwrap(), Payload { n: 7 });

        let second: Result<Payload, Infallible> = cache
            .get_or_set_json("p", TtlClass::Short, || async {
                panic!("must not fetch on hit")
            })
            .await;
        assert_eq!(second.unwrap(), Payload { n: 7 });
    }

    #[tokio::test]
    async fn test_invalidate_counts_matches() {
        let cache = cache();
        cache.set_text("section:tech:view:1", "x", 60).await;
        cache.set_text("section:tech:view:2", "x", 60).await;
        cache.set_text("section:world:view:1", "x", 60).await;

        let removed = cache.invalidate(&["section:tech:view:*"]).await;
        assert_eq!(removed, 2);
        assert!(cache.get_text("section:world:view:1").await.is_some());
    }

    #[tokio::test]
    async fn test_fifo_under_cap_keeps_everything() {
        let cache = cache();
        let outcome = cache
            .manage_section_fifo(Section::Technology, &ids(&["a", "b"]), 3)
            .await;
        assert_eq!(outcome, FifoOutcome { added: 2, removed: 0 });
        assert_eq!(
            cache.section_articles(Section::Technology, 20).await,
            ids(&["b", "a"])
        );
    }

    #[tokio::test]
    async fn test_fifo_eviction_deletes_companion_keys() {
        let cache = cache();
        for id in ["a", "b", "c", "d"] {
            cache.set_text(&article_key(id), "{}", 60).await;
        }
        cache
            .manage_section_fifo(Section::Technology, &ids(&["a", "b", "c"]), 3)
            .await;
        let outcome = cache
            .manage_section_fifo(Section::Technology, &ids(&["d"]), 3)
            .await;
        assert_eq!(outcome, FifoOutcome { added: 1, removed: 1 });

        // Oldest id dropped from the list, its snapshot deleted with it.
        assert_eq!(
            cache.section_articles(Section::Technology, 20).await,
            ids(&["d", "c", "b"])
        );
        assert!(!cache.exists(&article_key("a")).await);
        for id in ["b", "c", "d"] {
            assert!(cache.exists(&article_key(id)).await, "article:{id} must remain");
        }
    }

    #[tokio::test]
    async fn test_fifo_republication_is_noop() {
        let cache = cache();
        cache
            .manage_section_fifo(Section::Technology, &ids(&["a", "b"]), 5)
            .await;
        let outcome = cache
            .manage_section_fifo(Section::Technology, &ids(&["a", "b", "c"]), 5)
            .await;
        assert_eq!(outcome, FifoOutcome { added: 1, removed: 0 });
        assert_eq!(
            cache.section_articles(Section::Technology, 20).await,
            ids(&["c", "b", "a"])
        );
    }

    #[tokio::test]
    async fn test_fifo_large_burst_trims_to_cap() {
        let cache = cache();
        let many: Vec<String> = (0..10).map(|i| format!("id-{i}")).collect();
        let outcome = cache
            .manage_section_fifo(Section::World, &many, 4)
            .await;
        assert_eq!(outcome.added, 10);
        assert_eq!(outcome.removed, 6);
        let listed = cache.section_articles(Section::World, 20).await;
        assert_eq!(listed, ids(&["id-9", "id-8", "id-7", "id-6"]));
    }

    #[tokio::test]
    async fn test_section_articles_newest_first_and_counted() {
        let cache = cache();
        cache
            .manage_section_fifo(Section::Us, &ids(&["a", "b", "c", "d"]), 20)
            .await;
        assert_eq!(cache.section_articles(Section::Us, 2).await, ids(&["d", "c"]));
    }

    #[tokio::test]
    async fn test_push_to_list_caps_length() {
        let cache = cache();
        for i in 0..25 {
            cache
                .push_to_list(HOMEPAGE_LIST_KEY, &[format!("id-{i}")], HOMEPAGE_LIST_MAX)
                .await;
        }
        let listed = cache.pool().lrange(HOMEPAGE_LIST_KEY, 0, -1).await;
        assert_eq!(listed.len(), HOMEPAGE_LIST_MAX);
        assert_eq!(listed[0], "id-24");
    }

    #[tokio::test]
    async fn test_ttl_classes() {
        assert_eq!(TtlClass::Commentary.secs(), 86_400);
        assert_eq!(TtlClass::Article.secs(), 300);
        assert_eq!(TtlClass::Upstream.secs(), 1_800);
        assert_eq!(TtlClass::Short.secs(), 60);
        assert_eq!(TtlClass::Long.secs(), 604_800);
    }
}
