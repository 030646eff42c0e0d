//! Article fetcher: pull a section batch from its publisher, dedupe against
//! the store, enrich inline, persist, and publish into the cache when the
//! threshold gate allows.

pub mod sources;

pub use sources::{source_for, HeadlinesApi, SourceKind, TopStoriesApi};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::balance::BalancerError;
use crate::cache::{section_view_pattern, TieredCache, TtlClass};
use crate::enrich::Enricher;
use crate::model::{Article, Section};
use crate::store::{Store, StoreError};
use crate::threshold::ThresholdGate;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Publisher pull failed after credential rotation.
    #[error(transparent)]
    Publisher(#[from] BalancerError),

    /// Store write failed; enrichment work for the item is preserved in the
    /// cache, but the batch aborts because persistence is the point.
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Fetcher {
    store: Arc<Store>,
    cache: Arc<TieredCache>,
    enricher: Arc<Enricher>,
    gate: Arc<ThresholdGate>,
    top_stories: TopStoriesApi,
    headlines: HeadlinesApi,
    max_section_cache: usize,
    item_pacing: Duration,
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        cache: Arc<TieredCache>,
        enricher: Arc<Enricher>,
        gate: Arc<ThresholdGate>,
        top_stories: TopStoriesApi,
        headlines: HeadlinesApi,
        max_section_cache: usize,
        item_pacing: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            enricher,
            gate,
            top_stories,
            headlines,
            max_section_cache,
            item_pacing,
        }
    }

    pub fn top_stories(&self) -> &TopStoriesApi {
        &self.top_stories
    }

    pub fn headlines(&self) -> &HeadlinesApi {
        &self.headlines
    }

    /// Pull a batch for `section`, enrich and persist up to `max_to_process`
    /// new articles, and return how many were enriched and persisted.
    ///
    /// Items are processed serially with a courtesy pause between them; the
    /// scheduler's section rotation provides the only concurrency the
    /// publishers ever see from this path.
    pub async fn fetch_section(
        &self,
        section: Section,
        max_to_process: usize,
    ) -> Result<usize, FetchError> {
        // Raw batches are cached for the upstream TTL: consecutive rotation
        // passes over the same section reuse one publisher request, and dedup
        // below keeps reprocessing cheap.
        let source = source_for(section);
        let upstream_key = format!("upstream:{}:{section}", source.as_str());
        let batch: Vec<Article> = self
            .cache
            .get_or_set_json(&upstream_key, TtlClass::Upstream, || async {
                match source {
                    SourceKind::TopStories => self.top_stories.fetch_section(section).await,
                    SourceKind::Headlines => self.headlines.fetch_section(section).await,
                }
            })
            .await?;
        tracing::debug!(section = %section, batch = batch.len(), "Publisher batch ready");

        let mut processed = 0usize;
        let mut enriched_count = 0usize;

        for article in batch {
            if processed >= max_to_process {
                break;
            }

            // Dedup by URL: an already-enriched article is done; a known but
            // incomplete one gets its enrichment finished.
            if let Some(existing) = self.store.find_by_url(&article.url).await? {
                if existing.is_complete() {
                    tracing::trace!(url = %article.url, "Already enriched, skipping");
                    continue;
                }
            }

            if processed > 0 {
                tokio::time::sleep(self.item_pacing).await;
            }
            processed += 1;

            enriched_count += self.process_one(section, article).await?;
        }

        // Derived section views are stale after any batch; the canonical
        // FIFO list is maintained incrementally above and is not wiped.
        self.cache
            .invalidate(&[&section_view_pattern(section)])
            .await;

        if enriched_count > 0 {
            tracing::info!(section = %section, enriched = enriched_count, "Section fetch complete");
        }
        Ok(enriched_count)
    }

    /// Enrich one article (fallback included — this always completes), then
    /// persist it and publish into the cache if the gate is open.
    async fn process_one(&self, section: Section, article: Article) -> Result<usize, FetchError> {
        let outcome = self.enricher.enrich_with_retries(&article).await;

        let mut enriched = article;
        enriched.ai_commentary = Some(outcome.commentary);
        enriched.commentary_generated_at = Some(chrono::Utc::now());
        enriched.commentary_source = Some(outcome.source);

        // Ephemeral (temp-) articles stay cache-only: no store row, no
        // section list entry.
        if !enriched.is_ephemeral() {
            self.store.upsert_by_url(&enriched).await?;
        }

        // Publication is threshold-gated; recheck after the write so the
        // article that crosses the threshold is also published in the same
        // pass. The open transition publishes the backlog that accumulated
        // while the gate was closed.
        match self.gate.check_transition().await {
            Ok((_, true)) => self.publish_backlog().await,
            Ok((status, false)) if status.met => {
                if !enriched.is_ephemeral() {
                    self.cache
                        .manage_section_fifo(section, &[enriched.id.clone()], self.max_section_cache)
                        .await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Threshold check failed, skipping publication for this item");
            }
        }

        Ok(1)
    }

    /// Catch-up publication, run once when the gate opens: every watched
    /// section's enriched backlog goes into its FIFO list (oldest first, so
    /// the newest ends up at the front of reads) with fresh snapshots.
    async fn publish_backlog(&self) {
        tracing::info!("Threshold gate opened, publishing enriched backlog");
        for &section in self.gate.sections() {
            let articles = match self.store.recent_enriched(section, self.max_section_cache).await {
                Ok(articles) => articles,
                Err(e) => {
                    tracing::warn!(section = %section, error = %e, "Backlog read failed");
                    continue;
                }
            };
            if articles.is_empty() {
                continue;
            }

            let now = chrono::Utc::now();
            // recent_enriched returns newest first; FIFO appends at the tail.
            let ids: Vec<String> = articles.iter().rev().map(|a| a.id.clone()).collect();
            for article in &articles {
                let snapshot = crate::model::CachedArticle {
                    article: article.clone(),
                    cached_at: now,
                };
                self.cache
                    .set_json(
                        &crate::cache::article_key(&article.id),
                        &snapshot,
                        crate::cache::ARTICLE_SNAPSHOT_TTL_SECS,
                    )
                    .await;
            }
            self.cache
                .manage_section_fifo(section, &ids, self.max_section_cache)
                .await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
