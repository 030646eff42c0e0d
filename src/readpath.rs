//! Read-side helpers consumed by the HTTP adapter.
//!
//! Two promises to readers: section lists never contain a half-enriched
//! article, and a by-id read always answers with the store's latest state —
//! queueing a high-priority enrichment when the commentary is still missing.

use serde::Serialize;
use std::sync::Arc;

use crate::cache::{article_key, TieredCache, HOMEPAGE_LIST_KEY, HOMEPAGE_LIST_MAX};
use crate::model::{Article, CachedArticle, Section};
use crate::queue::{EnrichmentQueue, SubmitOptions};
use crate::store::{Store, StoreError};

/// By-id read result. `commentary_queued` tells the caller the article is
/// real but its commentary is still being generated.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleView {
    pub article: Option<Article>,
    pub commentary_queued: bool,
}

pub struct ReadPath {
    cache: Arc<TieredCache>,
    store: Arc<Store>,
    queue: Arc<EnrichmentQueue>,
}

impl ReadPath {
    pub fn new(
        cache: Arc<TieredCache>,
        store: Arc<Store>,
        queue: Arc<EnrichmentQueue>,
    ) -> Self {
        Self {
            cache,
            store,
            queue,
        }
    }

    /// The section's published articles, newest first, complete only.
    ///
    /// Ids come from the FIFO list; each hydrates from its snapshot key and
    /// falls through to the store when the snapshot has expired. Incomplete
    /// articles are omitted entirely — before the threshold gate opens the
    /// list is simply empty.
    pub async fn section_articles(
        &self,
        section: Section,
        count: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let ids = self.cache.section_articles(section, count).await;
        let mut articles = Vec::with_capacity(ids.len());

        for id in ids {
            let article = match self.cache.get_json::<CachedArticle>(&article_key(&id)).await {
                Some(snapshot) => Some(snapshot.article),
                None => self.store.find_by_id(&id).await?,
            };
            match article {
                Some(article) if article.is_complete() => articles.push(article),
                Some(article) => {
                    tracing::warn!(
                        article_id = %article.id,
                        section = %section,
                        "Incomplete article found in section list, omitting"
                    );
                }
                None => {
                    tracing::debug!(article_id = %id, "Listed article missing everywhere, omitting")
                }
            }
        }

        // Opportunistic hot-list refresh: the homepage rotation rides on
        // whatever section reads happen anyway. Correctness never depends on
        // this list.
        if !articles.is_empty() {
            let ids: Vec<String> = articles.iter().map(|a| a.id.clone()).collect();
            self.cache
                .push_to_list(HOMEPAGE_LIST_KEY, &ids, HOMEPAGE_LIST_MAX)
                .await;
        }

        Ok(articles)
    }

    /// By-id read: snapshot cache first, then the store. A stored article
    /// without commentary is returned as-is with `commentary_queued = true`
    /// and a priority-1 enrichment job submitted on the reader's behalf.
    pub async fn article_by_id(&self, article_id: &str) -> Result<ArticleView, StoreError> {
        if let Some(snapshot) = self
            .cache
            .get_json::<CachedArticle>(&article_key(article_id))
            .await
        {
            if snapshot.article.is_complete() {
                return Ok(ArticleView {
                    article: Some(snapshot.article),
                    commentary_queued: false,
                });
            }
        }

        let Some(article) = self.store.find_by_id(article_id).await? else {
            return Ok(ArticleView {
                article: None,
                commentary_queued: false,
            });
        };

        if article.is_complete() {
            return Ok(ArticleView {
                article: Some(article),
                commentary_queued: false,
            });
        }

        // Reader-triggered submissions jump the queue.
        match self
            .queue
            .submit(
                article.clone(),
                SubmitOptions {
                    priority: Some(1),
                    delay: None,
                },
            )
            .await
        {
            Ok(admission) => {
                tracing::debug!(article_id = %article_id, admission = ?admission, "Reader-triggered enrichment submitted");
            }
            Err(e) => {
                tracing::warn!(article_id = %article_id, error = %e, "Reader-triggered submission failed");
            }
        }

        Ok(ArticleView {
            article: Some(article),
            commentary_queued: true,
        })
    }
}
