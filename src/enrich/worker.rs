//! Enrichment worker: cache-first commentary generation, snapshot caching,
//! store persistence, and the deterministic fallback used when generation
//! fails for good.
//!
//! The worker is shared by both enrichment paths — the fetcher calls it
//! inline per new article, and the job queue calls it per dispatched job —
//! so both paths get identical semantics.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::balance::BalancerError;
use crate::cache::{article_key, commentary_key, TieredCache, TtlClass, ARTICLE_SNAPSHOT_TTL_SECS};
use crate::enrich::provider::AiClient;
use crate::model::{Article, CachedArticle, CommentarySource, Section};
use crate::store::Store;

/// How many generation attempts the inline path makes before falling back.
pub const MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff base between attempts: 5 s, 10 s, 20 s.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
#[error(transparent)]
pub struct EnrichError(#[from] pub BalancerError);

impl EnrichError {
    /// Rate limits and transient upstream failures may clear before the day
    /// ends; auth failures never will.
    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }
}

/// Result of enriching one article. Fallback commentary still counts as a
/// completed enrichment — readers never see a half-enriched article.
#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub commentary: String,
    pub source: CommentarySource,
}

pub struct Enricher {
    cache: Arc<TieredCache>,
    store: Arc<Store>,
    ai: AiClient,
    /// Backoff base for the inline retry loop; production uses
    /// [`BACKOFF_BASE`], tests shrink it.
    retry_backoff: Duration,
}

impl Enricher {
    pub fn new(cache: Arc<TieredCache>, store: Arc<Store>, ai: AiClient) -> Self {
        Self {
            cache,
            store,
            ai,
            retry_backoff: BACKOFF_BASE,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn ai(&self) -> &AiClient {
        &self.ai
    }

    /// One enrichment attempt: cache-first commentary, then snapshot cache
    /// and store persistence.
    ///
    /// Errors re-raise so the caller's retry policy (queue backoff or the
    /// inline loop) decides what happens next; the fallback path is the
    /// caller's move, not this function's.
    pub async fn enrich_article(&self, article: &Article) -> Result<EnrichmentOutcome, EnrichError> {
        let key = commentary_key(&article.id);
        let commentary = self
            .cache
            .get_or_set_text(&key, TtlClass::Commentary, || async {
                self.ai.generate_commentary(article).await
            })
            .await
            .map_err(EnrichError::from)?;

        self.finish(article, &commentary, CommentarySource::Ai).await;
        Ok(EnrichmentOutcome {
            commentary,
            source: CommentarySource::Ai,
        })
    }

    /// Enrich with retries and a terminal fallback: the inline-path wrapper.
    /// Always yields a complete article.
    pub async fn enrich_with_retries(&self, article: &Article) -> EnrichmentOutcome {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.enrich_article(article).await {
                Ok(outcome) => return outcome,
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = self.retry_backoff * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        article_id = %article.id,
                        attempt = attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Enrichment attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        article_id = %article.id,
                        attempt = attempt,
                        error = %e,
                        "Enrichment failed terminally, writing fallback commentary"
                    );
                    break;
                }
            }
        }
        self.apply_fallback(article).await
    }

    /// Terminal-failure path: synthesize the deterministic template
    /// commentary and persist it everywhere a real one would go.
    pub async fn apply_fallback(&self, article: &Article) -> EnrichmentOutcome {
        let commentary = fallback_commentary(&article.title, article.section);
        if !self
            .cache
            .set_text(
                &commentary_key(&article.id),
                &commentary,
                TtlClass::Commentary.secs(),
            )
            .await
        {
            tracing::warn!(article_id = %article.id, "Failed to cache fallback commentary");
        }
        self.finish(article, &commentary, CommentarySource::Fallback)
            .await;
        EnrichmentOutcome {
            commentary,
            source: CommentarySource::Fallback,
        }
    }

    /// Shared tail of every successful enrichment: write the full snapshot
    /// under `article:{id}` and persist the commentary to the store. A store
    /// failure is logged, not raised — the commentary is safe in the cache
    /// and the next rotation will reconcile the store.
    async fn finish(&self, article: &Article, commentary: &str, source: CommentarySource) {
        let now = Utc::now();
        let mut enriched = article.clone();
        enriched.ai_commentary = Some(commentary.to_string());
        enriched.commentary_generated_at = Some(now);
        enriched.commentary_source = Some(source);

        let snapshot = CachedArticle {
            article: enriched.clone(),
            cached_at: now,
        };
        self.cache
            .set_json(&article_key(&article.id), &snapshot, ARTICLE_SNAPSHOT_TTL_SECS)
            .await;

        // Ephemeral (temp-) articles are cache-only by design.
        if article.is_ephemeral() {
            return;
        }

        match self
            .store
            .set_commentary(&article.id, commentary, source, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // No row yet for this id (queue path can outrun the fetcher's
                // upsert); persist the full snapshot instead.
                if let Err(e) = self.store.upsert_by_url(&enriched).await {
                    tracing::warn!(article_id = %article.id, error = %e, "Store persist failed, commentary remains cached");
                }
            }
            Err(e) => {
                tracing::warn!(article_id = %article.id, error = %e, "Store persist failed, commentary remains cached");
            }
        }
    }
}

/// Deterministic template commentary built from title and section only. Same
/// three sections the AI produces, so downstream rendering never branches.
pub fn fallback_commentary(title: &str, section: Section) -> String {
    format!(
        "Key Points\n\
         This {section} story, \"{title}\", is developing and our automated \
         analysis is temporarily unavailable. The headline above reflects the \
         most recent information from the original publisher. Full analytical \
         commentary will be attached as soon as generation capacity returns.\n\
         \n\
         Impact Analysis\n\
         Readers following {section} coverage should treat this entry as a \
         factual report rather than an analysis. The publisher's own reporting \
         remains the authoritative account of who is affected.\n\
         \n\
         Future Outlook\n\
         This article will be re-examined automatically in a later enrichment \
         pass. Check back for the full three-part commentary once processing \
         resumes."
    )
}
