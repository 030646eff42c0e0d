//! Enrichment job queue: durable, idempotent, priority-ordered.
//!
//! The queue is the asynchronous enrichment path — callers submit articles
//! (user-triggered reads, backlog sweeps) and a small worker pool drains them
//! under a rate limiter, reusing the worker's enrichment semantics. The
//! fetcher's inline path never goes through here.
//!
//! Job state lives in the cache-shard pool under `queue:job:*` so a restart
//! reloads the queue instead of losing it. Supervision follows a dispatch
//! loop + bounded workers + stalled-job monitor shape: the loop pulls the
//! best due job, a semaphore caps concurrency, and a timer re-queues jobs
//! whose locks expired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, Semaphore};

use crate::cache::{commentary_key, TieredCache};
use crate::enrich::Enricher;
use crate::model::{Article, CommentarySource};
use crate::store::{Store, StoreError};

// ============================================================================
// Tunables
// ============================================================================

/// Generation attempts per job before the fallback path runs.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff base for retries: 5 s, then 10 s, then 20 s.
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Sliding-window rate limit on job starts.
const DISPATCH_WINDOW: Duration = Duration::from_secs(60);
const DISPATCH_BURST: usize = 10;

/// Concurrent workers.
const CONCURRENCY: usize = 2;

/// How long a dispatched job may run before the stalled monitor reclaims it.
const LOCK_TTL: Duration = Duration::from_secs(120);

/// Stalled-job scan period.
const STALL_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Retention: completed jobs keep the most recent 100 for up to a day;
/// failed jobs keep 500 for up to a week.
const COMPLETED_KEEP: usize = 100;
const COMPLETED_MAX_AGE_SECS: i64 = 86_400;
const FAILED_KEEP: usize = 500;
const FAILED_MAX_AGE_SECS: i64 = 604_800;

const JOB_KEY_PREFIX: &str = "queue:job:";

fn job_cache_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

// ============================================================================
// Job model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    /// Full article snapshot so the worker can enrich without a store read.
    pub article: Article,
    /// 1 is highest, 10 lowest.
    pub priority: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub commentary_source: Option<CommentarySource>,
}

impl JobRecord {
    fn is_pending(&self) -> bool {
        matches!(
            self.state,
            JobState::Waiting | JobState::Active | JobState::Delayed
        )
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed)
            && self.next_run_at.map_or(true, |at| at <= now)
    }
}

/// Admission verdict for a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Enqueued { job_id: String, priority: u8 },
    /// A job for this article is already waiting, active, or delayed.
    Duplicate,
    /// The article already has a commentary in the store or cache.
    AlreadyDone,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Article id is empty")]
    InvalidArticle,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitOptions {
    /// Explicit priority; computed from article age and section when absent.
    pub priority: Option<u8>,
    /// Defer the first run.
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub health: &'static str,
}

// ============================================================================
// Queue
// ============================================================================

struct QueueState {
    jobs: HashMap<String, JobRecord>,
    accepting: bool,
}

pub struct EnrichmentQueue {
    cache: Arc<TieredCache>,
    store: Arc<Store>,
    enricher: Arc<Enricher>,
    state: Mutex<QueueState>,
    /// Start timestamps inside the sliding dispatch window.
    starts: Mutex<VecDeque<Instant>>,
    /// Wakes the dispatch loop on submission instead of waiting out the
    /// drain delay.
    wake: Notify,
    drain_delay: Duration,
}

impl EnrichmentQueue {
    pub fn new(
        cache: Arc<TieredCache>,
        store: Arc<Store>,
        enricher: Arc<Enricher>,
        drain_delay: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            enricher,
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                accepting: true,
            }),
            starts: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            drain_delay,
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Submit an article for asynchronous enrichment.
    ///
    /// Admission short-circuits: a commentary already in the store means
    /// nothing to do; one already in the cache is back-filled into the store
    /// and likewise ends the submission. Duplicate in-flight job ids are
    /// no-ops.
    pub async fn submit(
        &self,
        article: Article,
        options: SubmitOptions,
    ) -> Result<Admission, QueueError> {
        if article.id.trim().is_empty() {
            return Err(QueueError::InvalidArticle);
        }
        let job_id = format!("commentary-{}", article.id);

        if let Some(existing) = self.store.find_by_id(&article.id).await? {
            if existing.is_complete() {
                return Ok(Admission::AlreadyDone);
            }
        }

        if let Some(commentary) = self.cache.get_text(&commentary_key(&article.id)).await {
            if !commentary.trim().is_empty() {
                self.backfill_store(&article, &commentary).await;
                return Ok(Admission::AlreadyDone);
            }
        }

        let now = Utc::now();
        let priority = options
            .priority
            .unwrap_or_else(|| compute_priority(&article, now));

        let record = {
            let mut state = self.state.lock().await;
            if !state.accepting {
                // Shutdown in progress; treat like a duplicate no-op rather
                // than inventing a new error surface for a closing process.
                return Ok(Admission::Duplicate);
            }
            if state.jobs.get(&job_id).is_some_and(JobRecord::is_pending) {
                return Ok(Admission::Duplicate);
            }

            let record = JobRecord {
                job_id: job_id.clone(),
                article,
                priority,
                attempts: 0,
                max_attempts: MAX_ATTEMPTS,
                state: if options.delay.is_some() {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                },
                enqueued_at: now,
                next_run_at: options
                    .delay
                    .map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()),
                lock_expires_at: None,
                last_error: None,
                finished_at: None,
                commentary_source: None,
            };
            state.jobs.insert(job_id.clone(), record.clone());
            record
        };

        self.persist(&record).await;
        self.wake.notify_one();
        tracing::debug!(job_id = %job_id, priority = priority, "Enrichment job enqueued");
        Ok(Admission::Enqueued { job_id, priority })
    }

    /// Cache hit during admission: write the commentary through to the store
    /// so the next reader finds it there too. Best effort.
    async fn backfill_store(&self, article: &Article, commentary: &str) {
        let now = Utc::now();
        match self
            .store
            .set_commentary(&article.id, commentary, CommentarySource::Ai, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let mut enriched = article.clone();
                enriched.ai_commentary = Some(commentary.to_string());
                enriched.commentary_generated_at = Some(now);
                enriched.commentary_source = Some(CommentarySource::Ai);
                if let Err(e) = self.store.upsert_by_url(&enriched).await {
                    tracing::warn!(article_id = %article.id, error = %e, "Cache back-fill upsert failed");
                }
            }
            Err(e) => {
                tracing::warn!(article_id = %article.id, error = %e, "Cache back-fill failed");
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn persist(&self, record: &JobRecord) {
        match serde_json::to_string(record) {
            Ok(raw) => {
                self.cache.pool().set(&job_cache_key(&record.job_id), &raw).await;
            }
            Err(e) => tracing::warn!(job_id = %record.job_id, error = %e, "Failed to encode job"),
        }
    }

    async fn unpersist(&self, job_id: &str) {
        self.cache.pool().del(&[job_cache_key(job_id)]).await;
    }

    /// Reload persisted jobs after a restart. Jobs that were active when the
    /// previous process died return to waiting.
    pub async fn restore(&self) -> usize {
        let keys = self
            .cache
            .pool()
            .keys(&format!("{JOB_KEY_PREFIX}*"))
            .await;
        let mut restored = 0usize;

        for key in keys {
            let Some(raw) = self.cache.pool().get(&key).await else {
                continue;
            };
            let mut record: JobRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping undecodable persisted job");
                    self.cache.pool().del(&[key.clone()]).await;
                    continue;
                }
            };
            if record.state == JobState::Active {
                record.state = JobState::Waiting;
                record.lock_expires_at = None;
            }
            let mut state = self.state.lock().await;
            state.jobs.insert(record.job_id.clone(), record);
            restored += 1;
        }

        if restored > 0 {
            tracing::info!(restored = restored, "Restored persisted enrichment jobs");
        }
        restored
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            waiting: 0,
            active: 0,
            completed: 0,
            failed: 0,
            delayed: 0,
            health: if state.accepting { "ok" } else { "draining" },
        };
        for job in state.jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Delayed => stats.delayed += 1,
            }
        }
        stats
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run the dispatch loop until `shutdown` flips. Spawns the stalled-job
    /// monitor alongside and drains active workers before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let monitor = tokio::spawn(Self::stall_monitor(self.clone(), shutdown.clone()));
        let semaphore = Arc::new(Semaphore::new(CONCURRENCY));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = self.take_next_due().await;
            let Some(job) = next else {
                // Drain delay: an empty queue polls slowly to spare the
                // cache-shard command budget; submissions wake it early.
                tokio::select! {
                    _ = tokio::time::sleep(self.drain_delay) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            self.acquire_rate_slot().await;

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed: process is going away
            };

            let queue = self.clone();
            tokio::spawn(async move {
                queue.work(job).await;
                drop(permit);
            });
        }

        // Stop admitting, then wait for in-flight workers to finish.
        {
            let mut state = self.state.lock().await;
            state.accepting = false;
        }
        let _drained = semaphore.acquire_many(CONCURRENCY as u32).await;
        monitor.abort();
        tracing::info!("Enrichment queue stopped");
    }

    /// Promote due delayed jobs and claim the best waiting one, ordered by
    /// (priority, enqueue time).
    async fn take_next_due(&self) -> Option<JobRecord> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        for job in state.jobs.values_mut() {
            if job.state == JobState::Delayed && job.due(now) {
                job.state = JobState::Waiting;
            }
        }

        let best_id = state
            .jobs
            .values()
            .filter(|job| job.due(now))
            .min_by_key(|job| (job.priority, job.enqueued_at))
            .map(|job| job.job_id.clone())?;

        let job = state.jobs.get_mut(&best_id)?;
        job.state = JobState::Active;
        job.lock_expires_at =
            Some(now + chrono::Duration::from_std(LOCK_TTL).unwrap_or_default());
        let claimed = job.clone();
        drop(state);

        self.persist(&claimed).await;
        Some(claimed)
    }

    /// Sliding-window limiter: at most [`DISPATCH_BURST`] job starts per
    /// [`DISPATCH_WINDOW`]. Blocks until a slot opens.
    async fn acquire_rate_slot(&self) {
        loop {
            let wait = {
                let mut starts = self.starts.lock().await;
                let now = Instant::now();
                while starts
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= DISPATCH_WINDOW)
                {
                    starts.pop_front();
                }
                if starts.len() < DISPATCH_BURST {
                    starts.push_back(now);
                    None
                } else {
                    starts
                        .front()
                        .map(|&t| DISPATCH_WINDOW - now.duration_since(t))
                }
            };
            match wait {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Process one claimed job through the enrichment worker.
    async fn work(&self, job: JobRecord) {
        tracing::debug!(job_id = %job.job_id, attempt = job.attempts + 1, "Job started");
        match self.enricher.enrich_article(&job.article).await {
            Ok(outcome) => self.complete(&job.job_id, outcome.source).await,
            Err(e) => self.handle_failure(&job.job_id, &e.to_string()).await,
        }
    }

    async fn complete(&self, job_id: &str, source: CommentarySource) {
        let record = {
            let mut state = self.state.lock().await;
            let Some(job) = state.jobs.get_mut(job_id) else {
                return;
            };
            job.state = JobState::Completed;
            job.finished_at = Some(Utc::now());
            job.lock_expires_at = None;
            job.commentary_source = Some(source);
            job.clone()
        };
        self.persist(&record).await;
        self.apply_retention().await;
        tracing::info!(job_id = %job_id, source = source.as_str(), "Job completed");
    }

    /// Non-terminal failures back off exponentially; the final failure runs
    /// the worker's fallback so the article still completes, and only a
    /// fallback that cannot happen leaves a terminally failed job.
    async fn handle_failure(&self, job_id: &str, error: &str) {
        let (terminal, article) = {
            let mut state = self.state.lock().await;
            let Some(job) = state.jobs.get_mut(job_id) else {
                return;
            };
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            if job.attempts >= job.max_attempts {
                (true, Some(job.article.clone()))
            } else {
                let delay = BACKOFF_BASE * 2u32.pow(job.attempts - 1);
                job.state = JobState::Delayed;
                job.next_run_at =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                job.lock_expires_at = None;
                tracing::warn!(
                    job_id = %job_id,
                    attempts = job.attempts,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Job attempt failed, backing off"
                );
                (false, None)
            }
        };

        if !terminal {
            if let Some(record) = self.snapshot(job_id).await {
                self.persist(&record).await;
            }
            self.wake.notify_one();
            return;
        }

        // Terminal: the fallback path makes the article complete anyway.
        let article = article.expect("terminal failure carries its article");
        tracing::warn!(job_id = %job_id, error = %error, "Job attempts exhausted, applying fallback");
        let outcome = self.enricher.apply_fallback(&article).await;
        self.complete(job_id, outcome.source).await;
    }

    async fn snapshot(&self, job_id: &str) -> Option<JobRecord> {
        let state = self.state.lock().await;
        state.jobs.get(job_id).cloned()
    }

    // ========================================================================
    // Stalled jobs
    // ========================================================================

    async fn stall_monitor(queue: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(STALL_CHECK_PERIOD) => {}
                _ = shutdown.changed() => return,
            }
            queue.requeue_stalled().await;
        }
    }

    /// Return any active job whose lock expired to the waiting state.
    async fn requeue_stalled(&self) -> usize {
        let now = Utc::now();
        let stalled: Vec<JobRecord> = {
            let mut state = self.state.lock().await;
            let mut stalled = Vec::new();
            for job in state.jobs.values_mut() {
                if job.state == JobState::Active
                    && job.lock_expires_at.is_some_and(|at| at <= now)
                {
                    job.state = JobState::Waiting;
                    job.lock_expires_at = None;
                    stalled.push(job.clone());
                }
            }
            stalled
        };
        for record in &stalled {
            tracing::warn!(job_id = %record.job_id, "Stalled job returned to waiting");
            self.persist(record).await;
        }
        if !stalled.is_empty() {
            self.wake.notify_one();
        }
        stalled.len()
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Prune terminal jobs beyond the retention policy, removing their
    /// persisted copies with them.
    async fn apply_retention(&self) {
        let now = Utc::now();
        let to_remove: Vec<String> = {
            let state = self.state.lock().await;
            let mut completed: Vec<&JobRecord> = state
                .jobs
                .values()
                .filter(|j| j.state == JobState::Completed)
                .collect();
            let mut failed: Vec<&JobRecord> = state
                .jobs
                .values()
                .filter(|j| j.state == JobState::Failed)
                .collect();
            completed.sort_by_key(|j| std::cmp::Reverse(j.finished_at));
            failed.sort_by_key(|j| std::cmp::Reverse(j.finished_at));

            let overflow = |jobs: Vec<&JobRecord>, keep: usize, max_age: i64| {
                jobs.into_iter()
                    .enumerate()
                    .filter(move |(index, job)| {
                        *index >= keep
                            || job
                                .finished_at
                                .is_some_and(|at| (now - at).num_seconds() > max_age)
                    })
                    .map(|(_, job)| job.job_id.clone())
                    .collect::<Vec<_>>()
            };

            let mut ids = overflow(completed, COMPLETED_KEEP, COMPLETED_MAX_AGE_SECS);
            ids.extend(overflow(failed, FAILED_KEEP, FAILED_MAX_AGE_SECS));
            ids
        };

        for job_id in to_remove {
            {
                let mut state = self.state.lock().await;
                state.jobs.remove(&job_id);
            }
            self.unpersist(&job_id).await;
        }
    }
}

/// Priority from article age and section: newer and harder news first.
/// Default 5; age under 6 h → 1, under 24 h → 2, under 48 h → 3; hard-news
/// sections get one extra step, clamped to 1.
fn compute_priority(article: &Article, now: DateTime<Utc>) -> u8 {
    let mut priority: u8 = match article.age(now) {
        Some(age) if age < chrono::Duration::hours(6) => 1,
        Some(age) if age < chrono::Duration::hours(24) => 2,
        Some(age) if age < chrono::Duration::hours(48) => 3,
        _ => 5,
    };
    if article.section.is_priority() {
        priority = priority.saturating_sub(1);
    }
    priority.clamp(1, 10)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{KeyPool, KeyPoolConfig};
    use crate::cache::ShardPool;
    use crate::config::Config;
    use crate::enrich::AiClient;
    use crate::model::Section;
    use secrecy::SecretString;
    use serde_json::json;
    use std::collections::BTreeSet;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article(id: &str, section: Section, age_hours: i64) -> Article {
        Article {
            id: id.into(),
            title: format!("Article {id}"),
            summary: "Summary".into(),
            url: format!("https://example.com/{id}"),
            published_date: Some(Utc::now() - chrono::Duration::hours(age_hours)),
            byline: None,
            image_url: None,
            source: "test".into(),
            section,
            keywords: BTreeSet::new(),
            ai_commentary: None,
            commentary_generated_at: None,
            commentary_source: None,
        }
    }

    async fn queue_for(ai: &MockServer) -> (Arc<EnrichmentQueue>, Arc<TieredCache>, Arc<Store>) {
        let mut config = Config::default();
        config.ai_base_url = ai.uri();
        let pool = Arc::new(KeyPool::new(
            KeyPoolConfig {
                name: "ai",
                daily_limit: 100_000,
                safety_buffer: 1_000,
                reserved_quantum: 600,
            },
            vec![SecretString::from("key")],
        ));
        let cache = Arc::new(TieredCache::new(Arc::new(ShardPool::memory_only())));
        let store = Arc::new(Store::in_memory().await.unwrap());
        let enricher = Arc::new(
            Enricher::new(cache.clone(), store.clone(), AiClient::new(&config, pool))
                .with_retry_backoff(Duration::from_millis(5)),
        );
        let queue = Arc::new(EnrichmentQueue::new(
            cache.clone(),
            store.clone(),
            enricher,
            Duration::from_millis(20),
        ));
        (queue, cache, store)
    }

    fn mount_ai_ok(server: &MockServer) -> impl std::future::Future<Output = ()> + '_ {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [ { "message": { "role": "assistant", "content": "Generated" } } ],
                "usage": { "total_tokens": 300 },
            })))
            .mount(server)
    }

    #[tokio::test]
    async fn test_submit_enqueues_with_computed_priority() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;

        let admission = queue
            .submit(article("fresh", Section::Sports, 1), SubmitOptions::default())
            .await
            .unwrap();
        match admission {
            Admission::Enqueued { priority, .. } => assert_eq!(priority, 1),
            other => panic!("expected Enqueued, got {other:?}"),
        }
        assert_eq!(queue.stats().await.waiting, 1);
    }

    #[tokio::test]
    async fn test_priority_rules() {
        let now = Utc::now();
        // Hard-news bonus clamps at 1.
        assert_eq!(compute_priority(&article("a", Section::Politics, 1), now), 1);
        assert_eq!(compute_priority(&article("b", Section::Sports, 10), now), 2);
        assert_eq!(compute_priority(&article("c", Section::Politics, 10), now), 1);
        assert_eq!(compute_priority(&article("d", Section::Sports, 30), now), 3);
        assert_eq!(compute_priority(&article("e", Section::Sports, 100), now), 5);
        assert_eq!(compute_priority(&article("f", Section::World, 100), now), 4);
        // No publication date → default.
        let mut undated = article("g", Section::Sports, 0);
        undated.published_date = None;
        assert_eq!(compute_priority(&undated, now), 5);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_noop() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;
        let a = article("x", Section::World, 1);

        assert!(matches!(
            queue.submit(a.clone(), SubmitOptions::default()).await.unwrap(),
            Admission::Enqueued { .. }
        ));
        assert_eq!(
            queue.submit(a.clone(), SubmitOptions::default()).await.unwrap(),
            Admission::Duplicate
        );
        assert_eq!(queue.stats().await.waiting, 1);
    }

    #[tokio::test]
    async fn test_empty_article_id_rejected() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;
        let mut a = article("x", Section::World, 1);
        a.id = "  ".into();
        assert!(matches!(
            queue.submit(a, SubmitOptions::default()).await,
            Err(QueueError::InvalidArticle)
        ));
    }

    #[tokio::test]
    async fn test_already_enriched_in_store_short_circuits() {
        let ai = MockServer::start().await;
        let (queue, _cache, store) = queue_for(&ai).await;
        let mut a = article("done", Section::World, 1);
        a.ai_commentary = Some("existing".into());
        store.upsert_by_url(&a).await.unwrap();

        let admission = queue
            .submit(article("done", Section::World, 1), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(admission, Admission::AlreadyDone);
        assert_eq!(queue.stats().await.waiting, 0);
    }

    #[tokio::test]
    async fn test_cached_commentary_backfills_store() {
        let ai = MockServer::start().await;
        let (queue, cache, store) = queue_for(&ai).await;
        let a = article("cached", Section::World, 1);
        store.upsert_by_url(&a).await.unwrap();
        cache
            .set_text(&commentary_key("cached"), "from cache", 60)
            .await;

        let admission = queue.submit(a, SubmitOptions::default()).await.unwrap();
        assert_eq!(admission, Admission::AlreadyDone);

        let stored = store.find_by_id("cached").await.unwrap().unwrap();
        assert_eq!(stored.ai_commentary.as_deref(), Some("from cache"));
    }

    #[tokio::test]
    async fn test_dispatch_completes_job_and_writes_cache_once() {
        let ai = MockServer::start().await;
        mount_ai_ok(&ai).await;
        let (queue, cache, _store) = queue_for(&ai).await;

        let a = article("job1", Section::World, 1);
        // Submit twice in quick succession: queue must hold exactly one job.
        queue.submit(a.clone(), SubmitOptions::default()).await.unwrap();
        queue.submit(a.clone(), SubmitOptions::default()).await.unwrap();
        assert_eq!(queue.stats().await.waiting, 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(queue.clone().run(shutdown_rx));

        // Wait for the single job to complete.
        for _ in 0..200 {
            if queue.stats().await.completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.waiting + stats.active + stats.delayed, 0);

        assert_eq!(
            cache.get_text(&commentary_key("job1")).await.as_deref(),
            Some("Generated")
        );

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_failure_falls_back_and_completes() {
        let ai = MockServer::start().await;
        // Provider permanently rate limited: attempts exhaust, fallback runs.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&ai)
            .await;
        let (queue, cache, store) = queue_for(&ai).await;
        let a = article("doomed", Section::Health, 1);
        store.upsert_by_url(&a).await.unwrap();
        queue.submit(a, SubmitOptions::default()).await.unwrap();

        // Drive the job by hand instead of through the timed loop: claim and
        // work it three times (backoff states are cleared manually).
        for _ in 0..MAX_ATTEMPTS {
            if let Some(job) = queue.take_next_due().await {
                queue.work(job).await;
            }
            // Clear the retry delay so the next claim is immediately due.
            let mut state = queue.state.lock().await;
            if let Some(job) = state.jobs.get_mut("commentary-doomed") {
                job.next_run_at = None;
            }
        }

        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);

        let stored = store.find_by_id("doomed").await.unwrap().unwrap();
        assert!(stored.is_complete());
        assert_eq!(stored.commentary_source, Some(CommentarySource::Fallback));
        assert!(cache.get_text(&commentary_key("doomed")).await.is_some());
    }

    #[tokio::test]
    async fn test_retry_backoff_schedule() {
        let ai = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&ai)
            .await;
        let (queue, _cache, _store) = queue_for(&ai).await;
        queue
            .submit(article("retry", Section::World, 1), SubmitOptions::default())
            .await
            .unwrap();

        let job = queue.take_next_due().await.unwrap();
        queue.work(job).await;

        let state = queue.state.lock().await;
        let job = state.jobs.get("commentary-retry").unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Delayed);
        let delay = (job.next_run_at.unwrap() - Utc::now()).num_seconds();
        // First backoff step is 5 s.
        assert!((3..=5).contains(&delay), "unexpected delay {delay}");
    }

    #[tokio::test]
    async fn test_delayed_submission_not_due_immediately() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;
        queue
            .submit(
                article("later", Section::World, 1),
                SubmitOptions {
                    priority: None,
                    delay: Some(Duration::from_secs(3600)),
                },
            )
            .await
            .unwrap();

        assert_eq!(queue.stats().await.delayed, 1);
        assert!(queue.take_next_due().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_order_by_priority_then_fifo() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;

        queue
            .submit(
                article("low", Section::Sports, 100),
                SubmitOptions { priority: Some(5), delay: None },
            )
            .await
            .unwrap();
        queue
            .submit(
                article("high", Section::Sports, 100),
                SubmitOptions { priority: Some(1), delay: None },
            )
            .await
            .unwrap();
        queue
            .submit(
                article("mid", Section::Sports, 100),
                SubmitOptions { priority: Some(3), delay: None },
            )
            .await
            .unwrap();

        let first = queue.take_next_due().await.unwrap();
        assert_eq!(first.job_id, "commentary-high");
        let second = queue.take_next_due().await.unwrap();
        assert_eq!(second.job_id, "commentary-mid");
        let third = queue.take_next_due().await.unwrap();
        assert_eq!(third.job_id, "commentary-low");
    }

    #[tokio::test]
    async fn test_stalled_job_requeued() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;
        queue
            .submit(article("stall", Section::World, 1), SubmitOptions::default())
            .await
            .unwrap();

        let _job = queue.take_next_due().await.unwrap();
        assert_eq!(queue.stats().await.active, 1);

        // Expire the lock by hand, then run the monitor's scan.
        {
            let mut state = queue.state.lock().await;
            let job = state.jobs.get_mut("commentary-stall").unwrap();
            job.lock_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        let requeued = queue.requeue_stalled().await;
        assert_eq!(requeued, 1);
        assert_eq!(queue.stats().await.waiting, 1);
    }

    #[tokio::test]
    async fn test_restore_reloads_persisted_jobs() {
        let ai = MockServer::start().await;
        let (queue, cache, store) = queue_for(&ai).await;
        queue
            .submit(article("persist", Section::World, 1), SubmitOptions::default())
            .await
            .unwrap();
        // Simulate the claimed-but-unfinished state surviving a crash.
        let _job = queue.take_next_due().await.unwrap();

        // A fresh queue instance over the same cache pool sees the job.
        let mut config = Config::default();
        config.ai_base_url = ai.uri();
        let pool = Arc::new(KeyPool::new(
            KeyPoolConfig {
                name: "ai",
                daily_limit: 100_000,
                safety_buffer: 1_000,
                reserved_quantum: 600,
            },
            vec![SecretString::from("key")],
        ));
        let enricher = Arc::new(Enricher::new(
            cache.clone(),
            store.clone(),
            AiClient::new(&config, pool),
        ));
        let revived = EnrichmentQueue::new(
            cache.clone(),
            store.clone(),
            enricher,
            Duration::from_millis(20),
        );
        assert_eq!(revived.restore().await, 1);

        let stats = revived.stats().await;
        // The previously active job is back to waiting.
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_retention_prunes_old_completed_jobs() {
        let ai = MockServer::start().await;
        let (queue, _cache, _store) = queue_for(&ai).await;

        // Insert a completed job finished beyond the retention age.
        {
            let mut state = queue.state.lock().await;
            let mut record = JobRecord {
                job_id: "commentary-old".into(),
                article: article("old", Section::World, 100),
                priority: 5,
                attempts: 1,
                max_attempts: MAX_ATTEMPTS,
                state: JobState::Completed,
                enqueued_at: Utc::now() - chrono::Duration::days(3),
                next_run_at: None,
                lock_expires_at: None,
                last_error: None,
                finished_at: Some(Utc::now() - chrono::Duration::days(2)),
                commentary_source: Some(CommentarySource::Ai),
            };
            state.jobs.insert(record.job_id.clone(), record.clone());
            record.job_id = "commentary-new".into();
            record.finished_at = Some(Utc::now());
            state.jobs.insert(record.job_id.clone(), record);
        }

        queue.apply_retention().await;
        let state = queue.state.lock().await;
        assert!(!state.jobs.contains_key("commentary-old"));
        assert!(state.jobs.contains_key("commentary-new"));
    }
}
